use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrqError {
    #[error("GPIO I/O error: {0}")]
    Io(String),
    #[error("Edge conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Interrupt service is closed")]
    Closed,
}

impl IrqError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, IrqError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, IrqError::Conflict(_))
    }
}
