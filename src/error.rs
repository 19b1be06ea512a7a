//! Controller error types

use crate::infrastructure::bluetooth::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the protocol codec and the device controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Invalid parameter {name}: {value} (allowed {min}..={max})")]
    InvalidParameter {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Write failed after {attempts} attempt(s): {reason}")]
    WriteFailed { attempts: u32, reason: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Unsupported device variant: {0}")]
    UnsupportedVariant(String),

    #[error("Device variant not resolved yet")]
    NotReady,

    #[error("Unknown effect: {0}")]
    UnknownEffect(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ControllerError {
    pub(crate) fn out_of_range(name: &'static str, value: impl Into<i64>, min: i64, max: i64) -> Self {
        Self::InvalidParameter {
            name,
            value: value.into(),
            min,
            max,
        }
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

/// Reject `value` unless it lies in `min..=max`
pub(crate) fn ensure_range(name: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ControllerError::out_of_range(name, value, min, max))
    }
}
