//! Custom error types for the application.
//!
//! This module defines the primary error type, `VscopeError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the structural failures of the fleet, the protocol layer and the snapshot store.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigMismatch`**: fleet members disagree on channel count, buffer length or
//!   channel labels after a refresh. The fleet is unusable until the hardware is fixed.
//! - **`InitializationFailure`**: fewer devices came up than ports matched the filters.
//! - **`CommunicationFailure`**: one or more devices produced no (or a short) response to a
//!   command. The failed devices have already been removed from the fleet when this is raised.
//! - **`Busy`**: the fleet lock could not be acquired in time. Recoverable; retry later.
//! - **`ShapeMismatch`**: snapshot data does not match the declared dimensions. Always a caller bug.
//! - **`Io`**, **`Serial`**, **`Json`**, **`Config`**: wrapped lower level errors.
//!
//! Consistency outcomes such as "devices disagree on the state byte" are *not* errors; the
//! protocol layer reports those as `None`.
//!
//! Per-device I/O problems are described by [`DeviceError`]. They never escape the fleet on
//! their own; the fleet folds them into `CommunicationFailure`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, VscopeError>;

/// Errors raised by the fleet, the protocol layer and the snapshot store.
#[derive(Error, Debug)]
pub enum VscopeError {
    /// Fleet members disagree on their dimensions or channel labels.
    #[error(
        "Device configuration mismatch. Expected {expected_channels}ch/{expected_buffer_length}buf \
         with matching channel labels (as reported by {reference}), but found: {}",
        .divergent.join(", ")
    )]
    ConfigMismatch {
        /// Identifier of the device the others were compared against
        reference: String,
        /// Channel count of the reference device
        expected_channels: u16,
        /// Buffer length of the reference device
        expected_buffer_length: u16,
        /// `"<identifier>: <channels>ch/<buffer_length>buf"` for every divergent device.
        divergent: Vec<String>,
    },

    /// Fewer devices came up than ports matched the filters.
    #[error(
        "Device initialization failed. Found {matched_ports} ports but only {initialized} devices initialized successfully"
    )]
    InitializationFailure {
        /// Ports that passed the USB filter
        matched_ports: usize,
        /// Devices tracked after the refresh
        initialized: usize,
    },

    /// Devices that failed a command; they are no longer part of the fleet.
    #[error("Communication failed with devices: {}", .failed.join(", "))]
    CommunicationFailure {
        /// Identifiers of the removed devices
        failed: Vec<String>,
    },

    /// The handshake with a freshly opened port failed.
    #[error("Handshake failed on {port}: {source}")]
    Handshake {
        /// Port path
        port: String,
        /// Underlying exchange failure
        #[source]
        source: DeviceError,
    },

    /// The fleet lock is held by another command.
    #[error("Serial interface busy")]
    Busy,

    /// An operation needs at least one connected device.
    #[error("No devices connected")]
    NoDevices,

    /// Devices are connected but the last refresh did not validate them.
    #[error("Device fleet is not configured, refresh it first")]
    Unconfigured,

    /// Array dimensions do not match the snapshot.
    #[error("Data shape {actual:?} does not match expected shape {expected:?}")]
    ShapeMismatch {
        /// `(channels, buffer_length)` declared by the snapshot
        expected: (usize, usize),
        /// Dimensions of the rejected array
        actual: (usize, usize),
    },

    /// No snapshot with this uid.
    #[error("Unknown snapshot {0}")]
    UnknownSnapshot(String),

    /// A cache entry on disk could not be interpreted.
    #[error("Corrupt cache entry: {0}")]
    CorruptCache(String),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings were loaded but are not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or line I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port enumeration or open failure.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Cache (de)serialization.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking device worker did not complete.
    #[error("Device worker panicked: {0}")]
    Worker(String),
}

impl From<figment::Error> for VscopeError {
    fn from(value: figment::Error) -> Self {
        VscopeError::Config(Box::new(value))
    }
}

impl VscopeError {
    /// Whether the caller may simply retry the operation later.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            VscopeError::Busy | VscopeError::CommunicationFailure { .. }
        )
    }
}

/// Failure of a single command exchange with one device.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Fewer bytes than expected arrived.
    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// The line reported an error.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every attempt failed.
    #[error("No valid response after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_names_divergent_devices() {
        let err = VscopeError::ConfigMismatch {
            reference: "scope-a".into(),
            expected_channels: 10,
            expected_buffer_length: 1000,
            divergent: vec!["scope-b: 10ch/500buf".into(), "scope-c: 8ch/1000buf".into()],
        };
        let message = err.to_string();
        assert!(message.contains("Expected 10ch/1000buf"));
        assert!(message.contains("scope-a"));
        assert!(message.contains("scope-b: 10ch/500buf, scope-c: 8ch/1000buf"));
    }

    #[test]
    fn communication_failure_lists_identifiers() {
        let err = VscopeError::CommunicationFailure {
            failed: vec!["left".into(), "right".into()],
        };
        assert_eq!(err.to_string(), "Communication failed with devices: left, right");
        assert!(err.can_recover());
    }

    #[test]
    fn shape_mismatch_is_not_recoverable() {
        let err = VscopeError::ShapeMismatch {
            expected: (2, 4),
            actual: (4, 2),
        };
        assert!(!err.can_recover());
        assert_eq!(
            err.to_string(),
            "Data shape (4, 2) does not match expected shape (2, 4)"
        );
    }
}
