//! Durable allocation pool for authenticated game accounts
//!
//! The pool is an ordered list of records, each an auth bundle plus an
//! optional tenancy naming the client that currently holds it. The engine
//! keeps the list in memory and rewrites the backing flat file atomically
//! after every mutation, so the file is always a faithful snapshot.
//!
//! Operation flow:
//! 1. Startup loads (or creates) the pool from the flat file.
//! 2. A client request allocates the first free record; the engine releases
//!    anything the client already held first, so one client never holds two
//!    accounts.
//! 3. Maintenance releases tenancies that are too old or whose user has no
//!    live remote session, with help from the session probe.

pub mod engine;
pub mod error;
pub mod record;
pub mod sessions;

pub use engine::{ALLOC_TIMEOUT, AllocEngine, render_listing};
pub use error::{Error, Result};
pub use record::{ALLOC_DELIM, AllocRecord, FIELDS, Tenancy};
pub use sessions::{Session, SessionTable};
