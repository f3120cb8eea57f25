//! Southbound error types and status handling.
//!
//! Switch-side rejections arrive as OpenFlow error messages carrying an
//! `ofp_error_type`; [`OfStatus`] names the types the controller reacts to
//! and [`OfError`] folds them together with local channel failures.

use std::fmt;
use thiserror::Error;

/// OpenFlow error types (`ofp_error_type`).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfStatus {
    HelloFailed = 0,
    BadRequest = 1,
    BadAction = 2,
    BadInstruction = 3,
    BadMatch = 4,
    FlowModFailed = 5,
    GroupModFailed = 6,
    PortModFailed = 7,
    TableModFailed = 8,
    QueueOpFailed = 9,
    SwitchConfigFailed = 10,
    RoleRequestFailed = 11,
    MeterModFailed = 12,
    TableFeaturesFailed = 13,
    Experimenter = 0xffff,
}

impl OfStatus {
    /// Creates an OfStatus from the raw error type.
    ///
    /// Unknown values map to `Experimenter`, which is what vendor
    /// extensions report anyway.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => OfStatus::HelloFailed,
            1 => OfStatus::BadRequest,
            2 => OfStatus::BadAction,
            3 => OfStatus::BadInstruction,
            4 => OfStatus::BadMatch,
            5 => OfStatus::FlowModFailed,
            6 => OfStatus::GroupModFailed,
            7 => OfStatus::PortModFailed,
            8 => OfStatus::TableModFailed,
            9 => OfStatus::QueueOpFailed,
            10 => OfStatus::SwitchConfigFailed,
            11 => OfStatus::RoleRequestFailed,
            12 => OfStatus::MeterModFailed,
            13 => OfStatus::TableFeaturesFailed,
            _ => OfStatus::Experimenter,
        }
    }
}

impl fmt::Display for OfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OfStatus::HelloFailed => "OFPET_HELLO_FAILED",
            OfStatus::BadRequest => "OFPET_BAD_REQUEST",
            OfStatus::BadAction => "OFPET_BAD_ACTION",
            OfStatus::BadInstruction => "OFPET_BAD_INSTRUCTION",
            OfStatus::BadMatch => "OFPET_BAD_MATCH",
            OfStatus::FlowModFailed => "OFPET_FLOW_MOD_FAILED",
            OfStatus::GroupModFailed => "OFPET_GROUP_MOD_FAILED",
            OfStatus::PortModFailed => "OFPET_PORT_MOD_FAILED",
            OfStatus::TableModFailed => "OFPET_TABLE_MOD_FAILED",
            OfStatus::QueueOpFailed => "OFPET_QUEUE_OP_FAILED",
            OfStatus::SwitchConfigFailed => "OFPET_SWITCH_CONFIG_FAILED",
            OfStatus::RoleRequestFailed => "OFPET_ROLE_REQUEST_FAILED",
            OfStatus::MeterModFailed => "OFPET_METER_MOD_FAILED",
            OfStatus::TableFeaturesFailed => "OFPET_TABLE_FEATURES_FAILED",
            OfStatus::Experimenter => "OFPET_EXPERIMENTER",
        };
        write!(f, "{}", s)
    }
}

/// Error type for southbound operations.
#[derive(Debug, Clone, Error)]
pub enum OfError {
    /// The switch rejected the request.
    #[error("switch rejected request: {status}")]
    Status { status: OfStatus },

    /// No session to the switch is currently up.
    #[error("switch channel disconnected")]
    Disconnected,

    /// The switch did not answer in time.
    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    /// A request could not be expressed on this channel.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },
}

impl OfError {
    pub fn from_status(status: OfStatus) -> Self {
        OfError::Status { status }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        OfError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        OfError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Returns the switch-reported status if this is a Status error.
    pub fn status(&self) -> Option<OfStatus> {
        match self {
            OfError::Status { status } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for failures that a later resync can repair.
    ///
    /// Everything except a malformed request qualifies; the controller never
    /// retries locally either way.
    pub fn is_transient(&self) -> bool {
        !matches!(self, OfError::InvalidParameter { .. })
    }
}

/// Result type for southbound operations.
pub type OfResult<T> = Result<T, OfError>;
