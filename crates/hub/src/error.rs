//! Typed errors for the irrigation core.
//!
//! Startup and config problems stay on `anyhow`; these enums cover what the
//! running hub has to tell apart: bad input, single-flight conflicts, and
//! the different ways the pump controller can fail to answer.

use thiserror::Error;
use uuid::Uuid;

/// Malformed sensor update or command payload. Never mutates state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("zone must not be empty")]
    EmptyZone,

    #[error("duration {value} min out of range [1, {max}]")]
    Duration { value: i64, max: u32 },

    #[error("invalid device url: {0}")]
    InvalidUrl(String),

    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

/// Rejections from the state machine's command entry points.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("irrigation session {session_id} is already in progress")]
    Conflict { session_id: Uuid },
}

/// Failures talking to the pump controller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("device unavailable: no endpoint registered")]
    Unavailable,

    #[error("device did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("device connection failed: {0}")]
    Connection(String),

    #[error("device rejected command (status {status})")]
    Rejected { status: u16 },

    #[error("invalid device response: {0}")]
    InvalidResponse(String),
}

impl DeviceError {
    /// `Unavailable` can't improve by retrying; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeviceError::Unavailable)
    }
}
