use std::time::Duration;

use crate::certificate::SignMethod;

pub type Result<T, E = SignerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Failed to encode or decode signer message: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Signer connection error: {0}")]
    Connection(String),
    #[error("No response from signer within {0:?}")]
    TimeoutExpired(Duration),
    #[error("No {0} certificate available, refusing to sign")]
    MissingCertificate(SignMethod),
    #[error("Signer rejected {method}: {reason}")]
    Rejected { method: &'static str, reason: String },
    #[error("Failed to read certificate file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stored certificate is not valid base64: {0}")]
    Certificate(String),
}

impl From<async_tungstenite::tungstenite::Error> for SignerError {
    fn from(error: async_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(error.to_string())
    }
}

impl SignerError {
    /// Whether the error was raised by validating caller input.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, SignerError::InvalidArgument(_))
    }
}
