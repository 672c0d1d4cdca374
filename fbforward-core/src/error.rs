//! Error taxonomy for the forwarding core (§7). Variants map onto the six
//! kinds in the error-handling table, not onto individual components.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("measurement stale for upstream {0}")]
    MeasurementStale(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Measure(#[from] fbforward_measure::MeasureError),

    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ForwardError>;
