//! PDO mapping-entry packing and scatter-list construction (spec.md §3.3),
//! grounded in `CO_PDOfindMap`/`CO_RPDOconfigMap`/`CO_TPDOconfigMap`
//! (`CO_PDO.c`).

use crate::od::{Attributes, ObjectDictionary, SdoAbortCode};
use alloc::vec::Vec;
use core::fmt;
use log::warn;

/// Up to eight objects may be mapped into a single PDO (spec.md §3.3).
pub const MAX_MAPPED_OBJECTS: usize = 8;

/// One `0xIIIISSLL`-packed mapping entry: index, subindex, bit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMappingEntry {
    pub index: u16,
    pub sub_index: u8,
    pub bit_length: u8,
}

impl PdoMappingEntry {
    pub fn from_u32(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub_index: (raw >> 8) as u8,
            bit_length: raw as u8,
        }
    }

    pub fn to_u32(self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub_index as u32) << 8) | self.bit_length as u32
    }
}

/// Which side of the mapping is being validated: an RPDO consumes
/// (writes into the OD), a TPDO produces (reads from the OD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingDirection {
    Rpdo,
    Tpdo,
}

/// Failure building a [`MappedVariables`] scatter list from raw mapping
/// entries (mirrors the abort codes `CO_PDOfindMap` returns).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoMappingError {
    TooManyEntries { count: usize },
    BitLengthNotByteAligned { index: u16, sub_index: u8, bit_length: u8 },
    TotalLengthExceeds64Bits { total_bits: u32 },
    ObjectNotFound { index: u16, sub_index: u8 },
    ObjectNotMappable { index: u16, sub_index: u8 },
}

impl fmt::Display for PdoMappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyEntries { count } => {
                write!(f, "PDO mapping has {} entries, at most {} allowed", count, MAX_MAPPED_OBJECTS)
            }
            Self::BitLengthNotByteAligned { index, sub_index, bit_length } => write!(
                f,
                "PDO mapping {:#06x}:{:02x} has non-byte-aligned bit length {}",
                index, sub_index, bit_length
            ),
            Self::TotalLengthExceeds64Bits { total_bits } => {
                write!(f, "PDO mapping totals {} bits, exceeds 64", total_bits)
            }
            Self::ObjectNotFound { index, sub_index } => {
                write!(f, "PDO mapping {:#06x}:{:02x} does not exist in the object dictionary", index, sub_index)
            }
            Self::ObjectNotMappable { index, sub_index } => {
                write!(f, "object {:#06x}:{:02x} is not mappable in this direction", index, sub_index)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PdoMappingError {}

impl From<PdoMappingError> for SdoAbortCode {
    fn from(err: PdoMappingError) -> Self {
        match err {
            PdoMappingError::TooManyEntries { .. } | PdoMappingError::TotalLengthExceeds64Bits { .. } => {
                SdoAbortCode::PdoLengthExceeded
            }
            PdoMappingError::BitLengthNotByteAligned { .. }
            | PdoMappingError::ObjectNotFound { .. }
            | PdoMappingError::ObjectNotMappable { .. } => SdoAbortCode::ObjectCannotBeMapped,
        }
    }
}

/// One object's position within the 8-byte PDO image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappedSlot {
    index: u16,
    sub_index: u8,
    byte_offset: u8,
    byte_len: u8,
}

/// The materialized scatter list for a configured RPDO/TPDO (spec.md §3.3:
/// "an 8-slot array of pointers into OD storage is materialized at
/// configure time"). Rust has no raw OD pointers, so each slot instead
/// records the `(index, sub_index)` pair and its byte span inside the PDO
/// image; copies go through `ObjectDictionary::read`/`write`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MappedVariables {
    slots: Vec<MappedSlot>,
    send_if_cos_flags: u8,
    byte_length: u8,
}

impl MappedVariables {
    /// An empty mapping (PDO deactivated, or configuration failed).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn byte_length(&self) -> u8 {
        self.byte_length
    }

    pub fn send_if_cos_flags(&self) -> u8 {
        self.send_if_cos_flags
    }

    /// Validates `raw_entries` against the dictionary and builds the
    /// scatter list (`CO_RPDOconfigMap`/`CO_TPDOconfigMap`).
    pub fn configure(
        od: &ObjectDictionary,
        raw_entries: &[u32],
        direction: MappingDirection,
    ) -> Result<Self, PdoMappingError> {
        if raw_entries.len() > MAX_MAPPED_OBJECTS {
            return Err(PdoMappingError::TooManyEntries { count: raw_entries.len() });
        }

        let mut slots = Vec::with_capacity(raw_entries.len());
        let mut send_if_cos_flags = 0u8;
        let mut total_bits: u32 = 0;

        for &raw in raw_entries {
            let entry = PdoMappingEntry::from_u32(raw);
            if entry.bit_length == 0 || entry.bit_length % 8 != 0 {
                return Err(PdoMappingError::BitLengthNotByteAligned {
                    index: entry.index,
                    sub_index: entry.sub_index,
                    bit_length: entry.bit_length,
                });
            }
            let new_total = total_bits + entry.bit_length as u32;
            if new_total > 64 {
                return Err(PdoMappingError::TotalLengthExceeds64Bits { total_bits: new_total });
            }

            let attrs = object_attributes(od, entry.index, entry.sub_index).ok_or(
                PdoMappingError::ObjectNotFound { index: entry.index, sub_index: entry.sub_index },
            )?;
            let mappable = match direction {
                MappingDirection::Rpdo => attrs.writable && attrs.rpdo_mappable,
                MappingDirection::Tpdo => attrs.readable && attrs.tpdo_mappable,
            };
            if !mappable {
                return Err(PdoMappingError::ObjectNotMappable {
                    index: entry.index,
                    sub_index: entry.sub_index,
                });
            }

            let byte_offset = (total_bits / 8) as u8;
            let byte_len = (entry.bit_length / 8) as u8;
            if direction == MappingDirection::Tpdo && attrs.track_cos {
                for bit in byte_offset..byte_offset + byte_len {
                    send_if_cos_flags |= 1 << bit;
                }
            }
            slots.push(MappedSlot { index: entry.index, sub_index: entry.sub_index, byte_offset, byte_len });
            total_bits = new_total;
        }

        Ok(Self { slots, send_if_cos_flags, byte_length: (total_bits / 8) as u8 })
    }

    /// Copies `bytes` (a received RPDO image) into the mapped OD variables.
    pub fn copy_into_od(&self, od: &mut ObjectDictionary, bytes: &[u8; 8]) {
        for slot in &self.slots {
            let start = slot.byte_offset as usize;
            let end = start + slot.byte_len as usize;
            if end > bytes.len() {
                continue;
            }
            if let Err(e) = od.write(slot.index, slot.sub_index, &bytes[start..end]) {
                warn!(
                    "RPDO mapping write to {:#06x}:{:02x} failed: {:?}",
                    slot.index, slot.sub_index, e
                );
            }
        }
    }

    /// Fills `out` (a to-be-sent TPDO image) from the mapped OD variables.
    pub fn copy_from_od(&self, od: &mut ObjectDictionary, out: &mut [u8; 8]) {
        for slot in &self.slots {
            let start = slot.byte_offset as usize;
            let end = start + slot.byte_len as usize;
            if end > out.len() {
                continue;
            }
            match od.read(slot.index, slot.sub_index) {
                Ok((value, _)) => {
                    let bytes = value.serialize();
                    let len = bytes.len().min(slot.byte_len as usize);
                    out[start..start + len].copy_from_slice(&bytes[..len]);
                }
                Err(e) => warn!(
                    "TPDO mapping read from {:#06x}:{:02x} failed: {:?}",
                    slot.index, slot.sub_index, e
                ),
            }
        }
    }

    /// True if any byte flagged in `send_if_cos_flags` changed between
    /// `prev` and `current` (spec.md §4.6 `is_cos`).
    pub fn is_cos(&self, prev: &[u8; 8], current: &[u8; 8]) -> bool {
        (0..self.byte_length).any(|i| {
            let i = i as usize;
            prev[i] != current[i] && (self.send_if_cos_flags & (1 << i)) != 0
        })
    }
}

fn object_attributes(od: &ObjectDictionary, index: u16, sub_index: u8) -> Option<Attributes> {
    od.find(index)?.sub(sub_index).map(|s| s.attributes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{ObjectEntry, ObjectValue};

    #[test]
    fn mapping_entry_roundtrips_through_u32() {
        let entry = PdoMappingEntry { index: 0x6000, sub_index: 1, bit_length: 16 };
        assert_eq!(entry.to_u32(), 0x6000_0110);
        assert_eq!(PdoMappingEntry::from_u32(0x6000_0110), entry);
    }

    fn sample_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(
            0x6000,
            Attributes::read_write().with_rpdo_mappable().with_tpdo_mappable(),
            ObjectValue::Unsigned16(0),
        ));
        od
    }

    #[test]
    fn configure_rejects_non_byte_aligned_length() {
        let od = sample_od();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 12 }.to_u32();
        let err = MappedVariables::configure(&od, &[raw], MappingDirection::Rpdo).unwrap_err();
        assert!(matches!(err, PdoMappingError::BitLengthNotByteAligned { .. }));
    }

    #[test]
    fn configure_rejects_unmappable_object() {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(0x6001, Attributes::read_write(), ObjectValue::Unsigned8(0)));
        let raw = PdoMappingEntry { index: 0x6001, sub_index: 0, bit_length: 8 }.to_u32();
        let err = MappedVariables::configure(&od, &[raw], MappingDirection::Tpdo).unwrap_err();
        assert!(matches!(err, PdoMappingError::ObjectNotMappable { .. }));
    }

    #[test]
    fn configure_builds_scatter_list_and_copies_roundtrip() {
        let od_template = sample_od();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 16 }.to_u32();
        let mapping = MappedVariables::configure(&od_template, &[raw], MappingDirection::Rpdo).unwrap();
        assert_eq!(mapping.byte_length(), 2);

        let mut od = od_template;
        let bytes = [0x34, 0x12, 0, 0, 0, 0, 0, 0];
        mapping.copy_into_od(&mut od, &bytes);
        let (value, _) = od.read(0x6000, 0).unwrap();
        assert_eq!(value, ObjectValue::Unsigned16(0x1234));

        let mut out = [0u8; 8];
        mapping.copy_from_od(&mut od, &mut out);
        assert_eq!(&out[..2], &[0x34, 0x12]);
    }

    #[test]
    fn is_cos_only_fires_for_flagged_bytes() {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(
            0x6002,
            Attributes::read_write().with_tpdo_mappable().with_track_cos(),
            ObjectValue::Unsigned8(0),
        ));
        od.insert(ObjectEntry::variable(
            0x6003,
            Attributes::read_write().with_tpdo_mappable(),
            ObjectValue::Unsigned8(0),
        ));
        let raw = [
            PdoMappingEntry { index: 0x6002, sub_index: 0, bit_length: 8 }.to_u32(),
            PdoMappingEntry { index: 0x6003, sub_index: 0, bit_length: 8 }.to_u32(),
        ];
        let mapping = MappedVariables::configure(&od, &raw, MappingDirection::Tpdo).unwrap();
        let prev = [0u8; 8];
        let mut changed_untracked = [0u8; 8];
        changed_untracked[1] = 9;
        assert!(!mapping.is_cos(&prev, &changed_untracked));
        let mut changed_tracked = [0u8; 8];
        changed_tracked[0] = 9;
        assert!(mapping.is_cos(&prev, &changed_tracked));
    }
}
