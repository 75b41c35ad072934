//! Form checks for values crossing the daemon's boundaries
//!
//! Everything that lands in the pool file or on the wire is constrained to a
//! comma-free, whitespace-free alphabet so the flat-file format needs no
//! escaping. These checks are about form only; `system_user_exists` is the
//! one check that consults host state.

use crate::timefmt;

/// Opaque single-field value: non-empty, no whitespace, no commas.
///
/// Upstream usernames, game identifiers, and bearer tokens all reduce to this
/// until the upstream alphabets are confirmed to be stricter.
pub fn is_valid_field(value: &str) -> bool {
    !value.is_empty() && !value.contains(',') && !value.chars().any(char::is_whitespace)
}

/// Conventional IPv4 dotted-quad.
pub fn is_valid_ipaddr(value: &str) -> bool {
    value.parse::<std::net::Ipv4Addr>().is_ok()
}

/// Port number in string form.
pub fn is_valid_port(value: &str) -> bool {
    value.parse::<u16>().is_ok()
}

/// Upstream account username: email-shaped.
pub fn is_valid_ms_username(value: &str) -> bool {
    is_valid_field(value) && value.contains('@')
}

/// Local system username as it appears in a request line or the pool file.
/// Existence of the account is a separate check (`system_user_exists`).
pub fn is_valid_system_username(value: &str) -> bool {
    is_valid_field(value) && !value.contains(':')
}

/// Version string echoed to clients. It rides in a colon-delimited response
/// so colons are excluded along with the flat-file alphabet.
pub fn is_valid_mc_version(value: &str) -> bool {
    is_valid_field(value) && !value.contains(':')
}

/// Timestamp in the internal storage format.
pub fn is_valid_timestamp(value: &str) -> bool {
    timefmt::parse_timestamp(value).is_ok()
}

/// Configuration parameter name: no whitespace, no equals sign.
pub fn is_valid_parname(value: &str) -> bool {
    !value.is_empty() && !value.contains('=') && !value.chars().any(char::is_whitespace)
}

/// Whether the named account exists in the host's user database.
pub fn system_user_exists(name: &str) -> bool {
    if !is_valid_system_username(name) {
        return false;
    }
    matches!(nix::unistd::User::from_name(name), Ok(Some(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_rejects_empty_and_delimiters() {
        assert!(is_valid_field("abc123"));
        assert!(is_valid_field("eyJhbGciOi.something.else"));
        assert!(!is_valid_field(""));
        assert!(!is_valid_field("a,b"));
        assert!(!is_valid_field("a b"));
        assert!(!is_valid_field("a\tb"));
        assert!(!is_valid_field("a\nb"));
    }

    #[test]
    fn ipaddr_accepts_dotted_quad_only() {
        assert!(is_valid_ipaddr("192.168.1.5"));
        assert!(is_valid_ipaddr("0.0.0.0"));
        assert!(!is_valid_ipaddr(""));
        assert!(!is_valid_ipaddr("192.168.1"));
        assert!(!is_valid_ipaddr("192.168.1.256"));
        assert!(!is_valid_ipaddr("::1"));
        assert!(!is_valid_ipaddr("host.example"));
    }

    #[test]
    fn port_bounds() {
        assert!(is_valid_port("0"));
        assert!(is_valid_port("2011"));
        assert!(is_valid_port("65535"));
        assert!(!is_valid_port("65536"));
        assert!(!is_valid_port("-1"));
        assert!(!is_valid_port("port"));
    }

    #[test]
    fn ms_username_is_email_shaped() {
        assert!(is_valid_ms_username("player1@example.com"));
        assert!(!is_valid_ms_username("player1"));
        assert!(!is_valid_ms_username("player one@example.com"));
        assert!(!is_valid_ms_username(""));
    }

    #[test]
    fn system_username_form() {
        assert!(is_valid_system_username("alice"));
        assert!(is_valid_system_username("svc-launcher"));
        assert!(!is_valid_system_username("alice:x"));
        assert!(!is_valid_system_username("alice smith"));
    }

    #[test]
    fn version_excludes_response_delimiter() {
        assert!(is_valid_mc_version("1.20.6"));
        assert!(!is_valid_mc_version("1.20:6"));
        assert!(!is_valid_mc_version(""));
    }

    #[test]
    fn timestamp_uses_internal_format() {
        assert!(is_valid_timestamp("01-01-2026 13:27:00"));
        assert!(!is_valid_timestamp("2026-01-01 13:27:00"));
        assert!(!is_valid_timestamp(""));
    }

    #[test]
    fn parname_form() {
        assert!(is_valid_parname("IpAddr"));
        assert!(!is_valid_parname("Ip Addr"));
        assert!(!is_valid_parname("IpAddr="));
        assert!(!is_valid_parname(""));
    }

    #[cfg(unix)]
    #[test]
    fn system_user_lookup() {
        assert!(system_user_exists("root"));
        assert!(!system_user_exists("no-such-user-zx81"));
    }
}
