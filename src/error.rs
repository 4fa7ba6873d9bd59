use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid label format: {0}")]
    InvalidLabelFormat(String),

    #[error("unknown label type {kind} in label {label}")]
    UnknownLabelType { kind: String, label: String },

    #[error("failed to fetch metrics from CloudWatch: {0}")]
    Fetch(String),

    #[error("failed to post metrics to Mackerel: {0}")]
    Publish(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("run cancelled")]
    Cancelled,
}

impl RelayError {
    /// Label decode failures only ever skip the affected series.
    pub fn is_label_error(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidLabelFormat(_) | RelayError::UnknownLabelType { .. }
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
