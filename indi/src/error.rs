//! INDI error types
//!
//! Local failures (validation, capability, connection state) are returned to
//! the caller. Malformed server data is reported as [`ProtocolDataError`] and
//! never aborts the update path.

use std::time::Duration;

use crate::connection::ConnectionState;

/// A single piece of server data that could not be applied to the model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Bad data for {device}.{property}{}: {reason}", element_suffix(.element))]
pub struct ProtocolDataError {
    pub device: String,
    pub property: String,
    pub element: Option<String>,
    pub reason: String,
}

fn element_suffix(element: &Option<String>) -> String {
    element.as_ref().map(|e| format!(".{}", e)).unwrap_or_default()
}

impl ProtocolDataError {
    pub fn new(device: &str, property: &str, element: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            device: device.to_string(),
            property: property.to_string(),
            element: element.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// INDI client errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndiError {
    /// Connection to INDI server failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection attempt did not complete in time
    #[error("Connection timeout: failed to connect to {host}:{port} after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// `connect` called while a connection is pending or established
    #[error("Connection busy: manager is {state}")]
    AlreadyConnecting { state: ConnectionState },
    /// Not connected to server
    #[error("Not connected to INDI server")]
    NotConnected,
    /// Writer task is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    /// Outbound queue is at capacity; the socket is not draining
    #[error("Send queue full ({0} messages pending)")]
    QueueFull(usize),
    /// Value rejected before anything was sent
    #[error("Invalid value for {device}.{property}.{element}: {reason}")]
    InvalidValue {
        device: String,
        property: String,
        element: String,
        reason: String,
    },
    /// Number outside the element's [min, max] range
    #[error("Value {value} out of range [{min}, {max}] for {device}.{property}.{element}")]
    ValueOutOfRange {
        device: String,
        property: String,
        element: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Attempted to write to a read-only property
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// The device does not currently expose the needed property
    #[error("Operation '{operation}' not supported by {device}")]
    Unsupported { device: String, operation: String },
    /// The device was removed while a caller still held its wrapper
    #[error("Device '{0}' is no longer available")]
    DeviceGone(String),
    /// Property not found
    #[error("Property not found: {device}.{property}")]
    PropertyNotFound { device: String, property: String },
    /// Element not found
    #[error("Element not found: {device}.{property}.{element}")]
    ElementNotFound {
        device: String,
        property: String,
        element: String,
    },
    /// Malformed server payload
    #[error("Protocol data error: {0}")]
    ProtocolData(#[from] ProtocolDataError),
    /// Bad user or configuration input
    #[error("Parse error: {0}")]
    ParseError(String),
    /// A global `tracing` subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    LoggingInit(String),
}

impl IndiError {
    /// Errors that come from the network layer and are retryable by reconnecting.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            IndiError::ConnectionFailed(_)
                | IndiError::ConnectionTimeout { .. }
                | IndiError::AlreadyConnecting { .. }
                | IndiError::NotConnected
                | IndiError::ChannelClosed(_)
                | IndiError::QueueFull(_)
        )
    }

    /// Local validation failures: nothing was sent.
    ///
    /// Naming an element the property does not have counts as one.
    pub fn is_invalid_value(&self) -> bool {
        matches!(
            self,
            IndiError::InvalidValue { .. }
                | IndiError::ValueOutOfRange { .. }
                | IndiError::PermissionDenied(_)
                | IndiError::ElementNotFound { .. }
        )
    }

    pub(crate) fn unsupported(device: &str, operation: &str) -> Self {
        IndiError::Unsupported {
            device: device.to_string(),
            operation: operation.to_string(),
        }
    }

    pub(crate) fn invalid(device: &str, property: &str, element: &str, reason: impl Into<String>) -> Self {
        IndiError::InvalidValue {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;
