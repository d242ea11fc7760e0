//! Typed value cells stored in Object Dictionary entries (spec.md §3.1).

use crate::hal::CanOpenError;
use alloc::string::String;
use alloc::vec::Vec;
use alloc::{vec};

/// Any value an Object Dictionary entry can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    Boolean(bool),
    Integer8(i8),
    Integer16(i16),
    Integer32(i32),
    Integer64(i64),
    Unsigned8(u8),
    Unsigned16(u16),
    Unsigned32(u32),
    Unsigned64(u64),
    Real32(f32),
    Real64(f64),
    VisibleString(String),
    OctetString(Vec<u8>),
    UnicodeString(Vec<u16>),
    Domain(Vec<u8>),
}

impl ObjectValue {
    /// Wire length in bytes. Variable-length values report their current
    /// length (spec.md §4.2: "Length for Domain is 0 in the table;
    /// callbacks convey actual size").
    pub fn len(&self) -> usize {
        match self {
            Self::Boolean(_) | Self::Integer8(_) | Self::Unsigned8(_) => 1,
            Self::Integer16(_) | Self::Unsigned16(_) => 2,
            Self::Integer32(_) | Self::Unsigned32(_) | Self::Real32(_) => 4,
            Self::Integer64(_) | Self::Unsigned64(_) | Self::Real64(_) => 8,
            Self::VisibleString(s) => s.len(),
            Self::OctetString(v) | Self::Domain(v) => v.len(),
            Self::UnicodeString(v) => v.len() * 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for the fixed-width numeric types flagged `multi-byte` in
    /// spec.md §3.1, whose wire bytes need an endianness swap on
    /// big-endian hosts.
    pub fn is_multi_byte(&self) -> bool {
        matches!(
            self,
            Self::Integer16(_)
                | Self::Integer32(_)
                | Self::Integer64(_)
                | Self::Unsigned16(_)
                | Self::Unsigned32(_)
                | Self::Unsigned64(_)
                | Self::Real32(_)
                | Self::Real64(_)
        )
    }

    /// Serializes to little-endian wire bytes (spec.md §3.1 invariant 4).
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Boolean(v) => vec![*v as u8],
            Self::Integer8(v) => v.to_le_bytes().to_vec(),
            Self::Integer16(v) => v.to_le_bytes().to_vec(),
            Self::Integer32(v) => v.to_le_bytes().to_vec(),
            Self::Integer64(v) => v.to_le_bytes().to_vec(),
            Self::Unsigned8(v) => v.to_le_bytes().to_vec(),
            Self::Unsigned16(v) => v.to_le_bytes().to_vec(),
            Self::Unsigned32(v) => v.to_le_bytes().to_vec(),
            Self::Unsigned64(v) => v.to_le_bytes().to_vec(),
            Self::Real32(v) => v.to_le_bytes().to_vec(),
            Self::Real64(v) => v.to_le_bytes().to_vec(),
            Self::VisibleString(v) => v.as_bytes().to_vec(),
            Self::OctetString(v) => v.clone(),
            Self::Domain(v) => v.clone(),
            Self::UnicodeString(v) => v.iter().flat_map(|c| c.to_le_bytes()).collect(),
        }
    }

    /// Deserializes `data` using `self` as a type/shape template, replacing
    /// its value in place. Fixed-width variants reject a length mismatch;
    /// variable-length variants accept any length.
    pub fn deserialize_into(&mut self, data: &[u8]) -> Result<(), CanOpenError> {
        macro_rules! fixed {
            ($variant:ident, $ty:ty) => {{
                let bytes: [u8; core::mem::size_of::<$ty>()] =
                    data.try_into().map_err(|_| CanOpenError::TypeMismatch)?;
                *self = Self::$variant(<$ty>::from_le_bytes(bytes));
            }};
        }
        match self {
            Self::Boolean(_) => {
                let b = *data.first().ok_or(CanOpenError::TypeMismatch)?;
                *self = Self::Boolean(b != 0);
            }
            Self::Integer8(_) => fixed!(Integer8, i8),
            Self::Integer16(_) => fixed!(Integer16, i16),
            Self::Integer32(_) => fixed!(Integer32, i32),
            Self::Integer64(_) => fixed!(Integer64, i64),
            Self::Unsigned8(_) => fixed!(Unsigned8, u8),
            Self::Unsigned16(_) => fixed!(Unsigned16, u16),
            Self::Unsigned32(_) => fixed!(Unsigned32, u32),
            Self::Unsigned64(_) => fixed!(Unsigned64, u64),
            Self::Real32(_) => fixed!(Real32, f32),
            Self::Real64(_) => fixed!(Real64, f64),
            Self::VisibleString(_) => {
                *self = Self::VisibleString(
                    String::from_utf8(data.to_vec()).map_err(|_| CanOpenError::TypeMismatch)?,
                );
            }
            Self::OctetString(_) => *self = Self::OctetString(data.to_vec()),
            Self::Domain(_) => *self = Self::Domain(data.to_vec()),
            Self::UnicodeString(_) => {
                if data.len() % 2 != 0 {
                    return Err(CanOpenError::TypeMismatch);
                }
                *self = Self::UnicodeString(
                    data.chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_roundtrips_through_wire_bytes() {
        let mut v = ObjectValue::Unsigned16(0);
        v.deserialize_into(&0x1234u16.to_le_bytes()).unwrap();
        assert_eq!(v, ObjectValue::Unsigned16(0x1234));
        assert_eq!(v.serialize(), vec![0x34, 0x12]);
    }

    #[test]
    fn fixed_width_rejects_wrong_length() {
        let mut v = ObjectValue::Unsigned32(0);
        assert!(v.deserialize_into(&[1, 2]).is_err());
    }

    #[test]
    fn domain_accepts_any_length() {
        let mut v = ObjectValue::Domain(Vec::new());
        v.deserialize_into(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(v.len(), 5);
    }
}
