use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Event queue '{0}' is full")]
    QueueFull(&'static str),
    #[error("Event queue '{0}' is closed")]
    QueueClosed(&'static str),
    #[error("Timeout while waiting for {0}")]
    Timeout(&'static str),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for CoreError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<String> for CoreError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for CoreError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(CoreError::GenericError(message))
}
