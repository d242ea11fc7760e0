//! Crate-wide error type and the CAN driver trait boundary.
//!
//! The CAN driver itself — frame TX/RX, filter installation, bus-off
//! detection — is an external collaborator (spec.md §1 "Excluded"); this
//! module only defines the trait the protocol engines are driven through.

use crate::od::abort::SdoAbortCode;
use crate::types::NodeIdError;
use core::fmt;

/// Portable, descriptive error type for the CANopen core (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanOpenError {
    /// The provided buffer is too small for the operation.
    BufferTooShort,
    /// A received CAN frame used an extended (29-bit) identifier.
    ExtendedIdRejected,
    /// A frame arrived on an owned COB-ID with the wrong DLC.
    WrongDlc { expected: u8, actual: u8 },
    /// A value in the frame is not a valid `NodeId`.
    InvalidNodeId(u8),
    /// The requested Object Dictionary index does not exist.
    ObjectNotFound,
    /// The requested sub-index does not exist for the given object.
    SubObjectNotFound,
    /// An attempt was made to write/decode a value with an incorrect data type.
    TypeMismatch,
    /// Argument supplied by the host-side API was null/out of range
    /// (spec.md §7 "wrongArguments" — synchronous, produces no CAN traffic).
    WrongArguments,
    /// The OD/SDO layer produced an abort and the caller should stop.
    SdoAborted(SdoAbortCode),
    /// A FIFO token was larger than the caller's buffer and was discarded.
    TokenTooLarge,
    /// Internal logic/assertion failure.
    InternalError(&'static str),
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooShort => write!(f, "buffer is too short"),
            Self::ExtendedIdRejected => write!(f, "extended (29-bit) CAN identifier rejected"),
            Self::WrongDlc { expected, actual } => {
                write!(f, "wrong DLC: expected {}, got {}", expected, actual)
            }
            Self::InvalidNodeId(v) => write!(f, "invalid node-id: {}", v),
            Self::ObjectNotFound => write!(f, "OD index not found"),
            Self::SubObjectNotFound => write!(f, "OD sub-index not found"),
            Self::TypeMismatch => write!(f, "data type mismatch"),
            Self::WrongArguments => write!(f, "wrong arguments"),
            Self::SdoAborted(code) => write!(f, "SDO aborted: {}", code),
            Self::TokenTooLarge => write!(f, "token too large for buffer"),
            Self::InternalError(s) => write!(f, "internal error: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CanOpenError {}

impl From<NodeIdError> for CanOpenError {
    fn from(err: NodeIdError) -> Self {
        match err {
            NodeIdError::InvalidRange(v) => CanOpenError::InvalidNodeId(v),
        }
    }
}

impl From<SdoAbortCode> for CanOpenError {
    fn from(code: SdoAbortCode) -> Self {
        CanOpenError::SdoAborted(code)
    }
}

/// An 8-byte CANopen data frame: an 11-bit COB-ID plus up to 8 payload
/// bytes. Extended identifiers are out of scope (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub cob_id: u16,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    pub fn new(cob_id: u16, data: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let n = data.len().min(8);
        buf[..n].copy_from_slice(&data[..n]);
        Self {
            cob_id: cob_id & crate::types::CAN_ID_MAX,
            dlc: n as u8,
            data: buf,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// Hardware abstraction for the CAN driver layer (spec.md §1, component A).
///
/// Protocol engines never perform frame I/O themselves beyond this trait:
/// they ask for a transmit-buffer handle at "communication reset" time and
/// reuse it for the lifetime of the configuration (spec.md §3.5 "Ownership
/// & Lifecycle" — the CAN driver owns transmit-buffer slots).
pub trait CanInterface {
    /// Opaque, non-owning handle into a pre-configured transmit slot.
    type TxHandle: Copy;

    /// Reserves a transmit-buffer slot for a given outgoing COB-ID. Called
    /// once per COB-ID at communication reset.
    fn tx_buffer_init(&mut self, cob_id: u16) -> Self::TxHandle;

    /// Installs a receive filter for `cob_id`; frames matching it are
    /// expected to be latched by the caller before the next `process(dt)`.
    fn filter_install(&mut self, cob_id: u16);

    /// Sends the frame currently staged in `handle`. Returns
    /// `Err(CanOpenError::InternalError(..))`-style backpressure when the
    /// hardware TX queue is full; the caller retries next tick
    /// (spec.md §7 "transmittBufferFull").
    fn send(&mut self, handle: Self::TxHandle, frame: &CanFrame) -> Result<(), CanOpenError>;
}
