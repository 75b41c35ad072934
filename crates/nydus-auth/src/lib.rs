//! Chained authentication for upstream game accounts
//!
//! Takes an upstream account from an email-shaped username to a launchable
//! game identity through four token exchanges: identity provider → Xbox Live
//! → XSTS → game services, plus a profile fetch at the end. Each exchange is
//! a standalone function so callers can renew one expiring stage without
//! rerunning the chain.
//!
//! Account flow:
//! 1. Startup builds an [`MsalClient`] and runs [`auth_all`] interactively;
//!    the operator signs each account in via a device code.
//! 2. The resulting [`AuthBundle`]s seed the allocation pool.
//! 3. Maintenance calls the per-stage functions with interaction disabled,
//!    replacing only tokens that approach expiry.

pub mod bundle;
pub mod claims;
pub mod constants;
pub mod error;
pub mod msal;
pub mod pipeline;
pub mod timestamp;
pub mod token;

pub use bundle::{AuthBundle, McProfile};
pub use claims::extract_user_hash;
pub use error::{Error, Result};
pub use msal::MsalClient;
pub use pipeline::{
    auth_all, auth_stream, minecraft_profile, minecraft_token, xboxlive_token, xsts_token,
};
pub use timestamp::parse_xbox_timestamp;
pub use token::{AccessToken, DEFAULT_RENEWAL_LOOKAHEAD};
