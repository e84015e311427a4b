//! Error types for schedule engine operations.
//!
//! Two layers of errors exist:
//!
//! - [`LinkError`] is produced by the transport behind a [`Link`](crate::link::Link)
//!   and is surfaced unchanged. The engine never retries it.
//! - [`PixxError`] is what every public operation returns. All variants except
//!   [`PixxError::Link`] are detected on the host before any link I/O happens.

use thiserror::Error;

use crate::persona::PersonaKind;
use crate::schedule::ScheduleState;
use crate::subsystem::SubsystemKind;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, PixxError>;

/// Failures reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No response within the transport's own timeout
    #[error("Link timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// The physical link went away
    #[error("Link disconnected")]
    Disconnected,

    /// The device refused a transfer
    #[error("Device rejected transfer: {message}")]
    Rejected {
        /// Reason given by the transport
        message: String,
    },

    /// The requested persona does not answer on this link
    #[error("Persona '{persona}' is not reachable on this link")]
    UnknownPersona {
        /// Persona that was asked for
        persona: PersonaKind,
    },

    /// I/O error from the operating system
    #[error("I/O error: {message}")]
    Io {
        /// Operating system error text
        message: String,
    },
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Errors returned by the schedule engine.
#[derive(Error, Debug)]
pub enum PixxError {
    /// Transport failure, surfaced directly
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Address is odd or falls outside device RAM
    #[error("Invalid address {addr:#x}: {reason}")]
    InvalidAddress {
        /// Rejected byte address
        addr: u32,
        /// What the address violates
        reason: String,
    },

    /// Size is odd, zero, or does not fit in device RAM
    #[error("Invalid size {size:#x}: {reason}")]
    InvalidSize {
        /// Rejected size in bytes
        size: u32,
        /// What the size violates
        reason: String,
    },

    /// Value outside its closed domain
    #[error("{what} {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Name of the checked quantity
        what: String,
        /// Rejected value
        value: u64,
        /// Smallest accepted value
        min: u64,
        /// Largest accepted value
        max: u64,
    },

    /// Operation is illegal in the current schedule state
    #[error("Cannot {operation} while schedule is {state:?}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// Host-side state at the time
        state: ScheduleState,
    },

    /// `start()` was called without a ring buffer
    #[error("{subsystem} schedule has no ring buffer configured")]
    NotConfigured {
        /// Subsystem that was started
        subsystem: SubsystemKind,
    },

    /// Channel outside the range the operation accepts
    #[error("Invalid channel {channel}: {subsystem} accepts channels below {max}")]
    InvalidChannel {
        /// Subsystem addressed
        subsystem: SubsystemKind,
        /// Rejected channel
        channel: u32,
        /// Number of channels the operation accepts
        max: u32,
    },

    /// Register offset or width misuse in the register cache
    #[error("Invalid register {offset:#05x}: {reason}")]
    InvalidRegister {
        /// Byte offset of the register
        offset: u16,
        /// What the access violates
        reason: String,
    },

    /// The persona does not provide the requested feature
    #[error("Operation not supported: {message}")]
    NotSupported {
        /// What was asked for
        message: String,
    },

    /// Another schedule already owns this subsystem
    #[error("{subsystem} on '{persona}' is already claimed by another schedule")]
    SubsystemBusy {
        /// Persona the subsystem belongs to
        persona: PersonaKind,
        /// Claimed subsystem
        subsystem: SubsystemKind,
    },

    /// The register file belongs to another persona than the one opened
    #[error("Expected {expected} (id {}) but the device reports id {id}", expected.link_id())]
    PersonaMismatch {
        /// Persona the device was opened as
        expected: PersonaKind,
        /// Id found in the device id register
        id: u16,
    },

    /// Invalid configuration or parameter
    #[error("Invalid configuration: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },
}

impl PixxError {
    /// Check if this error came from the transport.
    pub fn is_link(&self) -> bool {
        matches!(self, Self::Link(_))
    }

    /// Check if this error was raised by host-side validation.
    ///
    /// Validation errors never touch the link, so the device and the
    /// register cache are exactly as they were before the call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. }
                | Self::InvalidSize { .. }
                | Self::OutOfRange { .. }
                | Self::InvalidChannel { .. }
                | Self::InvalidRegister { .. }
        )
    }

    /// Check if this is a state-machine violation.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    pub(crate) fn out_of_range(what: impl Into<String>, value: u64, min: u64, max: u64) -> Self {
        Self::OutOfRange {
            what: what.into(),
            value,
            min,
            max,
        }
    }
}
