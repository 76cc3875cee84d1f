use thiserror::Error;

/// Failure to turn an access token into claims.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token must have three dot-separated segments, found {0}")]
    Malformed(usize),

    #[error("payload is not valid base64url: {0}")]
    Base64(String),

    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),
}

/// Every outcome a public `SessionManager` operation can fail with.
///
/// `Clone` because a single refresh result is shared between all callers
/// waiting on the same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("No access token available")]
    NoToken,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Invalid access token: {0}")]
    Decode(#[from] DecodeError),

    #[error("Network error: {0}")]
    Network(String),
}

impl SessionError {
    /// Errors after which the session has been forcibly logged out.
    pub fn forces_logout(&self) -> bool {
        matches!(self, SessionError::RefreshFailed(_) | SessionError::Decode(_))
    }

    /// Errors that indicate a caller ordering bug rather than a user-facing problem.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, SessionError::NoToken | SessionError::NoRefreshToken)
    }
}
