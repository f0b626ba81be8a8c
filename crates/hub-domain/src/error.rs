//! Central error type shared across every hub crate.
//!
//! Each variant maps to one of the error kinds in the public API's error
//! handling contract (`invalid_credentials`, `not_found`, `device_offline`,
//! ...). [`Error::kind`] and [`Error::status_code`] are how the HTTP layer
//! and the agent loop turn a `Result<T>` into the right user-visible shape
//! without duplicating that mapping at every call site.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("token expired")]
    TokenExpired,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("device offline")]
    DeviceOffline,

    #[error("device backpressure")]
    DeviceBackpressure,

    #[error("tool timed out")]
    ToolTimeout,

    #[error("provider transient failure: {0}")]
    ProviderTransient(String),

    #[error("provider fatal failure: {0}")]
    ProviderFatal(String),

    #[error("max iterations reached")]
    MaxIterationsReached,

    #[error("shutting down")]
    ShuttingDown,

    #[error("setup already completed")]
    SetupAlreadyDone,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine-readable error kind. Used both for HTTP status mapping
/// and for the tool-result payloads the agent loop feeds back to the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidCredentials,
    TokenExpired,
    PermissionDenied,
    NotFound,
    ValidationFailed,
    DeviceOffline,
    DeviceBackpressure,
    ToolTimeout,
    ProviderTransient,
    ProviderFatal,
    MaxIterationsReached,
    ShuttingDown,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::DeviceOffline => "device_offline",
            ErrorKind::DeviceBackpressure => "device_backpressure",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderFatal => "provider_fatal",
            ErrorKind::MaxIterationsReached => "max_iterations_reached",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidCredentials => ErrorKind::InvalidCredentials,
            Error::TokenExpired => ErrorKind::TokenExpired,
            Error::PermissionDenied => ErrorKind::PermissionDenied,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Error::DeviceOffline => ErrorKind::DeviceOffline,
            Error::DeviceBackpressure => ErrorKind::DeviceBackpressure,
            Error::ToolTimeout => ErrorKind::ToolTimeout,
            Error::ProviderTransient(_) => ErrorKind::ProviderTransient,
            Error::ProviderFatal(_) => ErrorKind::ProviderFatal,
            Error::MaxIterationsReached => ErrorKind::MaxIterationsReached,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::SetupAlreadyDone => ErrorKind::PermissionDenied,
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for the public API layer. Internal errors are
    /// deliberately sanitized — callers get "internal error", the real
    /// detail stays in `tracing`.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidCredentials | ErrorKind::TokenExpired => 401,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::ValidationFailed => 400,
            ErrorKind::ProviderFatal => 502,
            ErrorKind::ShuttingDown => 503,
            ErrorKind::Internal => 500,
            // device_offline / device_backpressure / tool_timeout /
            // provider_transient / max_iterations_reached never escape as a
            // top-level HTTP error — they are folded into in-band results.
            _ => 500,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ProviderTransient)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
