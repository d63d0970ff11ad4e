use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CapError>;

#[derive(Error, Debug)]
pub enum CapError {
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    #[error("Server '{server}' failed to start: {reason}")]
    ListenerStart { server: String, reason: String },

    #[error("Response body file '{}' cannot be read: {source}", path.display())]
    BodySource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown response id '{0}'")]
    ResponseResolution(String),

    #[error("Request recording error: {0}")]
    Recording(String),

    #[error("Storage error for '{}': {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("HTTP parse error: {0}")]
    Http(#[from] http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CapError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn listener(server: impl Into<String>, reason: impl ToString) -> Self {
        Self::ListenerStart {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    pub fn recording(msg: impl Into<String>) -> Self {
        Self::Recording(msg.into())
    }

    /// Status sent to the client when this error ends a request.
    pub fn to_status_code(&self) -> hyper::StatusCode {
        match self {
            Self::Hyper(_) => hyper::StatusCode::BAD_REQUEST,
            _ => hyper::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
