//! Error types for the authentication pipeline

/// Errors from token acquisition and the chained auth stages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value failed a form check before any network traffic happened.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The HTTP exchange itself failed (connect, TLS, body read).
    #[error("request failed: {0}")]
    Http(String),

    /// The endpoint answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// The endpoint answered 2xx but the body was not shaped as expected.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    /// The identity provider needs a human and none is available.
    #[error("interactive sign-in required: {0}")]
    InteractionRequired(String),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
