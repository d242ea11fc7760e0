//! SDO abort code space (spec.md §6) and the OD-error-to-abort-code table
//! shared by the server's write path and the client's local-loopback write
//! path (SPEC_FULL.md supplemented feature 3).

use core::fmt;

/// A 32-bit SDO abort code, wire-encoded little-endian in an `ABORT` frame.
/// Variants cover the exhaustive list required by spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SdoAbortCode {
    ToggleBitNotAlternated = 0x0503_0000,
    SdoProtocolTimedOut = 0x0504_0000,
    CommandSpecifierUnknown = 0x0504_0001,
    InvalidBlockSize = 0x0504_0002,
    InvalidSequenceNumber = 0x0504_0003,
    CrcError = 0x0504_0004,
    OutOfMemory = 0x0504_0005,
    UnsupportedAccess = 0x0601_0000,
    AttemptToReadWriteOnly = 0x0601_0001,
    AttemptToWriteReadOnly = 0x0601_0002,
    ObjectDoesNotExist = 0x0602_0000,
    ObjectCannotBeMapped = 0x0604_0041,
    PdoLengthExceeded = 0x0604_0042,
    ParameterIncompatibility = 0x0604_0043,
    InternalIncompatibility = 0x0604_0047,
    HardwareError = 0x0606_0000,
    DataTypeMismatchLengthMismatch = 0x0607_0010,
    DataTypeMismatchLengthTooHigh = 0x0607_0012,
    DataTypeMismatchLengthTooLow = 0x0607_0013,
    SubIndexDoesNotExist = 0x0609_0011,
    ValueRangeExceeded = 0x0609_0030,
    ValueTooHigh = 0x0609_0031,
    ValueTooLow = 0x0609_0032,
    MaxLessThanMin = 0x0609_0036,
    ResourceNotAvailable = 0x060A_0023,
    GeneralError = 0x0800_0000,
    DataCannotBeStored = 0x0800_0020,
    DataCannotBeStoredLocalControl = 0x0800_0021,
    DataCannotBeStoredDeviceState = 0x0800_0022,
    ObjectDictionaryGenerationFailed = 0x0800_0023,
    NoDataAvailable = 0x0800_0024,
}

impl SdoAbortCode {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn wire_bytes(self) -> [u8; 4] {
        self.code().to_le_bytes()
    }

    /// Human-readable suffix the gateway appends after `ERROR:0x...`
    /// (spec.md §4.10, seed scenario 5).
    pub fn description(self) -> &'static str {
        match self {
            Self::ToggleBitNotAlternated => "Toggle bit not alternated.",
            Self::SdoProtocolTimedOut => "SDO protocol timed out.",
            Self::CommandSpecifierUnknown => {
                "Client/server command specifier not valid or unknown."
            }
            Self::InvalidBlockSize => "Invalid block size (block mode only).",
            Self::InvalidSequenceNumber => "Invalid sequence number (block mode only).",
            Self::CrcError => "CRC error (block mode only).",
            Self::OutOfMemory => "Out of memory.",
            Self::UnsupportedAccess => "Unsupported access to an object.",
            Self::AttemptToReadWriteOnly => "Attempt to read a write only object.",
            Self::AttemptToWriteReadOnly => "Attempt to write a read only object.",
            Self::ObjectDoesNotExist => "Object does not exist in the object dictionary.",
            Self::ObjectCannotBeMapped => "Object cannot be mapped to the PDO.",
            Self::PdoLengthExceeded => {
                "The number and length of the objects to be mapped would exceed PDO length."
            }
            Self::ParameterIncompatibility => "General parameter incompatibility reason.",
            Self::InternalIncompatibility => {
                "General internal incompatibility in the device."
            }
            Self::HardwareError => "Access failed due to a hardware error.",
            Self::DataTypeMismatchLengthMismatch => {
                "Data type does not match, length of service parameter does not match."
            }
            Self::DataTypeMismatchLengthTooHigh => {
                "Data type does not match, length of service parameter too high."
            }
            Self::DataTypeMismatchLengthTooLow => {
                "Data type does not match, length of service parameter too low."
            }
            Self::SubIndexDoesNotExist => "Sub-index does not exist.",
            Self::ValueRangeExceeded => "Value range of parameter exceeded.",
            Self::ValueTooHigh => "Value of parameter written too high.",
            Self::ValueTooLow => "Value of parameter written too low.",
            Self::MaxLessThanMin => "Maximum value is less than minimum value.",
            Self::ResourceNotAvailable => "Resource not available: SDO connection.",
            Self::GeneralError => "General error.",
            Self::DataCannotBeStored => {
                "Data cannot be transferred or stored to the application."
            }
            Self::DataCannotBeStoredLocalControl => {
                "Data cannot be transferred or stored due to local control."
            }
            Self::DataCannotBeStoredDeviceState => {
                "Data cannot be transferred or stored due to the present device state."
            }
            Self::ObjectDictionaryGenerationFailed => {
                "Object dictionary dynamic generation fails or no object dictionary is present."
            }
            Self::NoDataAvailable => "No data available.",
        }
    }
}

impl fmt::Display for SdoAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} #{}", self.code(), self.description())
    }
}

/// Errors the Object Dictionary surfaces internally before they are mapped
/// to an [`SdoAbortCode`] (spec.md §4.2 "Error mapping").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdError {
    IndexNotFound,
    SubIndexNotFound,
    ReadOnly,
    WriteOnly,
    LengthMismatch,
    LengthTooHigh,
    LengthTooLow,
    ValueTooHigh,
    ValueTooLow,
    Unsupported,
    NoDataAvailable,
    HardwareError,
}

impl From<OdError> for SdoAbortCode {
    fn from(err: OdError) -> Self {
        match err {
            OdError::IndexNotFound => SdoAbortCode::ObjectDoesNotExist,
            OdError::SubIndexNotFound => SdoAbortCode::SubIndexDoesNotExist,
            OdError::ReadOnly => SdoAbortCode::AttemptToWriteReadOnly,
            OdError::WriteOnly => SdoAbortCode::AttemptToReadWriteOnly,
            OdError::LengthMismatch => SdoAbortCode::DataTypeMismatchLengthMismatch,
            OdError::LengthTooHigh => SdoAbortCode::DataTypeMismatchLengthTooHigh,
            OdError::LengthTooLow => SdoAbortCode::DataTypeMismatchLengthTooLow,
            OdError::ValueTooHigh => SdoAbortCode::ValueTooHigh,
            OdError::ValueTooLow => SdoAbortCode::ValueTooLow,
            OdError::Unsupported => SdoAbortCode::UnsupportedAccess,
            OdError::NoDataAvailable => SdoAbortCode::NoDataAvailable,
            OdError::HardwareError => SdoAbortCode::HardwareError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes_are_little_endian() {
        assert_eq!(
            SdoAbortCode::AttemptToWriteReadOnly.wire_bytes(),
            [0x02, 0x00, 0x01, 0x06]
        );
    }

    #[test]
    fn od_error_maps_to_documented_abort_code() {
        let code: SdoAbortCode = OdError::ReadOnly.into();
        assert_eq!(code, SdoAbortCode::AttemptToWriteReadOnly);
    }
}
