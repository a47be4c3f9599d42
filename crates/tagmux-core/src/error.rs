//! Error types for tagmux-core.
//!
//! Transport failures are never fatal to the coordinator. The connection
//! state machine sorts connect errors into two buckets with [`Error::is_busy`]:
//!
//! | Error | Recovery |
//! |-------|----------|
//! | busy (`EBUSY`, "Device or resource busy") | disconnect, then retry immediately |
//! | anything else | retry after the reconnect backoff |
//!
//! Feature errors ([`Error::UnsupportedFeature`], [`Error::CharacteristicNotFound`],
//! write failures) are logged and isolated to the one feature.

use std::time::Duration;

use tagmux_types::{Feature, TagId};
use thiserror::Error;

/// Errors raised by the arbitration core and its transports.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Connection attempt failed with a classified reason.
    #[error("Connection to {tag} failed: {reason}")]
    ConnectionFailed {
        tag: TagId,
        reason: ConnectionFailureReason,
    },

    /// Operation attempted while not connected to the tag.
    #[error("Not connected to tag {0}")]
    NotConnected(TagId),

    /// The transport has no handle for this tag in the current scan session.
    #[error("Unknown tag: {0}")]
    UnknownTag(TagId),

    /// Required GATT characteristic not found on the tag.
    #[error("Characteristic not found: {uuid} on {tag}")]
    CharacteristicNotFound { tag: TagId, uuid: String },

    /// The tag's hardware generation lacks this sensor.
    #[error("Feature {feature} not supported by {tag}")]
    UnsupportedFeature { tag: TagId, feature: Feature },

    /// Notification payload could not be decoded.
    #[error(transparent)]
    Parse(#[from] tagmux_types::ParseError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No consumer is registered under this id.
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    /// The coordinator task has stopped.
    #[error("Coordinator is not running")]
    CoordinatorClosed,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// The adapter or peripheral reported it is busy with another operation.
    Busy,
    /// Connection attempt timed out.
    Timeout,
    /// Tag is out of range or no longer advertising.
    OutOfRange,
    /// Tag rejected the connection.
    Rejected,
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl ConnectionFailureReason {
    /// Classify a free-form error message from a BLE stack.
    pub fn from_message(message: &str) -> Self {
        if is_busy_message(message) {
            Self::Busy
        } else {
            Self::BleError(message.to_string())
        }
    }

    /// Classify a btleplug error.
    pub fn from_btleplug(err: &btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => Self::OutOfRange,
            btleplug::Error::TimedOut(_) => Self::Timeout,
            btleplug::Error::PermissionDenied => Self::AdapterUnavailable,
            other => Self::from_message(&other.to_string()),
        }
    }
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "Device or resource busy"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::OutOfRange => write!(f, "tag out of range"),
            Self::Rejected => write!(f, "connection rejected by tag"),
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

fn is_busy_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("device or resource busy") || lower.contains("ebusy")
}

impl Error {
    /// Create a connection failure with structured reason.
    pub fn connection_failed(tag: TagId, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { tag, reason }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(tag: TagId, uuid: impl Into<String>) -> Self {
        Self::CharacteristicNotFound {
            tag,
            uuid: uuid.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error belongs to the resource-busy category.
    ///
    /// Busy connects are retried immediately after a disconnect instead of
    /// waiting for the reconnect backoff.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::ConnectionFailed { reason, .. } => *reason == ConnectionFailureReason::Busy,
            Error::Bluetooth(err) => {
                ConnectionFailureReason::from_btleplug(err) == ConnectionFailureReason::Busy
            }
            Error::Io(err) => is_busy_message(&err.to_string()),
            _ => false,
        }
    }
}

/// Result type alias using tagmux-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> TagId {
        TagId::new("b0b448c98a83")
    }

    #[test]
    fn test_error_display() {
        let err = Error::NotConnected(tag());
        assert_eq!(err.to_string(), "Not connected to tag b0b448c98a83");

        let err = Error::characteristic_not_found(tag(), "f000aa01");
        assert!(err.to_string().contains("f000aa01"));

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));

        let err = Error::UnsupportedFeature {
            tag: tag(),
            feature: Feature::Light,
        };
        assert_eq!(
            err.to_string(),
            "Feature luxometer not supported by b0b448c98a83"
        );
    }

    #[test]
    fn test_busy_classification() {
        assert_eq!(
            ConnectionFailureReason::from_message("Device or resource busy (os error 16)"),
            ConnectionFailureReason::Busy
        );
        assert_eq!(
            ConnectionFailureReason::from_message("EBUSY"),
            ConnectionFailureReason::Busy
        );
        assert_eq!(
            ConnectionFailureReason::from_message("connection refused"),
            ConnectionFailureReason::BleError("connection refused".into())
        );

        assert!(Error::connection_failed(tag(), ConnectionFailureReason::Busy).is_busy());
        assert!(!Error::connection_failed(tag(), ConnectionFailureReason::Timeout).is_busy());
        assert!(!Error::NotConnected(tag()).is_busy());
    }

    #[test]
    fn test_io_busy_is_busy() {
        let io = std::io::Error::other("Device or resource busy");
        assert!(Error::from(io).is_busy());
    }

    #[test]
    fn test_btleplug_classification() {
        assert_eq!(
            ConnectionFailureReason::from_btleplug(&btleplug::Error::DeviceNotFound),
            ConnectionFailureReason::OutOfRange
        );
        assert_eq!(
            ConnectionFailureReason::from_btleplug(&btleplug::Error::TimedOut(
                Duration::from_secs(1)
            )),
            ConnectionFailureReason::Timeout
        );
        assert!(
            Error::Bluetooth(btleplug::Error::RuntimeError(
                "Device or resource busy".into()
            ))
            .is_busy()
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = tagmux_types::ParseError::InvalidValue("x".into());
        let err: Error = parse.into();
        assert!(matches!(err, Error::Parse(_)));
    }
}
