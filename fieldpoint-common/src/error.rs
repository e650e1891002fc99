use thiserror::Error;

/// Common error type for Fieldpoint components.
#[derive(Debug, Error)]
pub enum Error {
    /// Broken or inconsistent configuration. Fatal to the offending
    /// slave or board only; the rest of the topology keeps running.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bus-level communication failure (timeout, short response,
    /// Modbus exception, connection reset). Recovered via scan backoff.
    #[error("Bus error: {0}")]
    Bus(String),

    /// A register inside a known block that was never successfully
    /// scanned. Callers render the affected field unavailable.
    #[error("No cached value of register '{index}'")]
    MissingRegister { index: u16 },

    /// Rejected `set()` input. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No device with the given circuit or alias.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using Fieldpoint's Error.
pub type Result<T> = std::result::Result<T, Error>;
