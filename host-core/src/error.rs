//! Error taxonomy of the host core.

use sap_shared::{FrameError, QueueError};
use thiserror::Error;

/// Errors surfaced by the SAP host core
#[derive(Error, Debug)]
pub enum SapError {
    #[error("Bus transport error: {0}")]
    Transport(String),
    #[error("Protocol corruption: {0}")]
    ProtocolCorruption(&'static str),
    #[error("Not enough room in the shared queue")]
    InsufficientSpace,
    #[error("Timed out waiting for the firmware")]
    Timeout,
    #[error("SAP session is not connected")]
    NotConnected,
    #[error("Another consumer is already registered")]
    AlreadyRegistered,
    #[error("Request denied by the firmware")]
    Denied,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Allocation failed: {0}")]
    Allocation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SapError>;

impl From<QueueError> for SapError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InsufficientSpace => SapError::InsufficientSpace,
            QueueError::Corrupted => SapError::ProtocolCorruption("queue cursors out of range"),
            QueueError::Underflow => SapError::ProtocolCorruption("read past the queue contents"),
        }
    }
}

impl From<FrameError> for SapError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::BufferTooSmall => {
                SapError::InvalidArgument("message does not fit the encode buffer".into())
            }
            FrameError::TooShort => SapError::ProtocolCorruption("message shorter than its layout"),
            FrameError::LengthMismatch => SapError::ProtocolCorruption("message length mismatch"),
            FrameError::UnknownType => SapError::ProtocolCorruption("unknown message type"),
            FrameError::SsidTooLong => SapError::ProtocolCorruption("SSID longer than 32 bytes"),
        }
    }
}
