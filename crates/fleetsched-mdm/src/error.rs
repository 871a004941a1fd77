use thiserror::Error;

/// Failures talking to the remote device-management API.
#[derive(Debug, Error)]
pub enum MdmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-2xx status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Remote call timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// A stored device filter that cannot be interpreted.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Filter is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Filter must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Filter field `{field}` has the wrong type: expected {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, MdmError>;
