//! Shared form checks and timestamp helpers for the Nydus daemon

mod timefmt;
mod validate;

pub use timefmt::{TIME_FORMAT, format_timestamp, parse_timestamp};
pub use validate::{
    is_valid_field, is_valid_ipaddr, is_valid_mc_version, is_valid_ms_username, is_valid_parname,
    is_valid_port, is_valid_system_username, is_valid_timestamp, system_user_exists,
};
