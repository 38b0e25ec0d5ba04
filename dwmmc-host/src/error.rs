//! # Error types
use crate::request::Request;

/// Terminal error of a command or data transfer.
///
/// Errors are attached to the sub-object of a [Request] they belong to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The card was removed or was never present.
    #[error("no medium")]
    NoMedium,
    #[error("timeout")]
    Timeout,
    #[error("CRC error")]
    CrcError,
    #[error("response error")]
    ResponseError,
    /// FIFO overrun/underrun, start or end bit error.
    #[error("FIFO or data bus error")]
    FifoError,
    #[error("DMA descriptor unavailable")]
    DmaDescriptorUnavailable,
    #[error("sample phase tuning failed")]
    TuningFailed,
    /// The data line stayed busy through every controller reset.
    #[error("controller not recoverable")]
    NotRecoverable,
    #[error("invalid request")]
    InvalidRequest,
}

/// A self-clearing reset bit did not clear in time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timeout waiting for reset bits {0:#010x} to clear")]
pub struct ResetTimeout(pub u32);

impl From<ResetTimeout> for Error {
    fn from(_: ResetTimeout) -> Self {
        Error::Timeout
    }
}

/// Reasons a scatter list can not be handed to the internal DMA controller.
///
/// None of these are fatal, the transfer simply runs in PIO mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmaBuildError {
    #[error("transfer below DMA threshold")]
    BelowThreshold,
    #[error("buffer or block size misaligned for DMA")]
    Misaligned,
    #[error("not enough descriptors in ring")]
    RingOverflow,
}

/// Submission was rejected. The request is handed back unchanged.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("request queue full")]
    QueueFull(Request),
    #[error("invalid slot")]
    InvalidSlot(Request),
}

impl SubmitError {
    /// Take the rejected request back.
    pub fn into_request(self) -> Request {
        match self {
            SubmitError::QueueFull(request) => request,
            SubmitError::InvalidSlot(request) => request,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("controller reset failed: {0}")]
    ResetTimeout(#[from] ResetTimeout),
    #[error("bus clock frequency is zero")]
    ZeroBusClock,
    #[error("controller reports no card slots")]
    NoSlots,
}
