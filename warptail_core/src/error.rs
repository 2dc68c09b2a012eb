//! Structured failures surfaced by control-plane operations.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown service id or http host.
    NotFound,
    /// Slug already exists on create.
    Conflict,
    /// Invalid route or service configuration.
    BadRequest,
    /// Tailnet node not ready or not authenticated.
    OverlayUnavailable,
    /// Unknown route type.
    Unsupported,
    /// Temporary network failure during forwarding; logged, not surfaced.
    Transient,
}

impl ErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::OverlayUnavailable => "overlay_unavailable",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Transient => "transient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterError {
    kind: ErrorKind,
    message: String,
}

impl RouterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RouterError {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn overlay_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OverlayUnavailable, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure is the tailnet asking for (re-)authentication,
    /// as opposed to being merely unreachable.
    pub fn needs_login(&self) -> bool {
        if self.kind != ErrorKind::OverlayUnavailable {
            return false;
        }
        let msg = self.message.to_ascii_lowercase();
        ["not logged in", "needs login", "offline", "authentication required"]
            .iter()
            .any(|needle| msg.contains(needle))
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl Error for RouterError {}

impl From<std::io::Error> for RouterError {
    fn from(e: std::io::Error) -> Self {
        RouterError::transient(e.to_string())
    }
}
