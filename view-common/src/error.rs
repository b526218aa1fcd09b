//! Error types for Session View services.

use thiserror::Error;

/// Result type alias using the Session View error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Session View crates.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing registry entries, unreadable config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session lifecycle error (use after close, double close)
    #[error("Session error: {0}")]
    Session(String),

    /// A resource is already bound for this key in the current scope
    #[error("Resource already bound: {0}")]
    ResourceBound(String),

    /// No resource is bound for this key in the current scope
    #[error("No resource bound: {0}")]
    ResourceNotBound(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is a configuration error.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::WithContext { source, .. } => source.is_config(),
            _ => false,
        }
    }

    /// Check if this is a missing-binding error.
    pub fn is_not_bound(&self) -> bool {
        match self {
            Self::ResourceNotBound(_) => true,
            Self::WithContext { source, .. } => source.is_not_bound(),
            _ => false,
        }
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }

    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Session(_) => "SESSION_ERROR",
            Self::ResourceBound(_) | Self::ResourceNotBound(_) => "RESOURCE_BINDING",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::WithContext { source, .. } => source.code(),
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
