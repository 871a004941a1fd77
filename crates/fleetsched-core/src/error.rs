use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FleetError {
    /// Short error code string returned to callers of the trigger boundary.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
