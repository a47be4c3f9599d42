//! Error types for data parsing in tagmux-types.

use thiserror::Error;

/// Errors that can occur when decoding SensorTag payloads or parsing
/// identifiers.
///
/// This error type is transport-agnostic; BLE failures live in tagmux-core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The notification payload was shorter than the sensor's packet layout.
    #[error("Insufficient bytes: {feature} requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        feature: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A textual value could not be interpreted.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using tagmux-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
