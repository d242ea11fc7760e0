//! Process Data Object engine (spec.md §4.6 — component J), grounded in
//! `CO_PDO.c/h`. [`mapping`] builds the scatter list shared by both
//! directions; [`rpdo`]/[`tpdo`] drive the per-direction state machines.

pub mod mapping;
pub mod rpdo;
pub mod tpdo;

pub use mapping::{MappedVariables, MappingDirection, PdoMappingEntry, PdoMappingError, MAX_MAPPED_OBJECTS};
pub use rpdo::Rpdo;
pub use tpdo::Tpdo;

use log::warn;

/// Splits a raw OD 0x1400+/0x1800+ COB-ID field into `(valid, cob_id)`
/// (spec.md §4.6: "bit 31 = invalid; bits 11..29 must be zero; bit 30
/// reserved"). Reserved/extended bits are not rejected outright — matching
/// the source's tolerance for already-deployed masters that set them — but
/// are logged and stripped.
pub(crate) fn decode_cob_id(raw: u32) -> (bool, u16) {
    let valid = raw & 0x8000_0000 == 0;
    if raw & 0x3FFF_F800 != 0 {
        warn!("PDO COB-ID {:#010x} has reserved/extended bits set, clearing them", raw);
    }
    (valid, (raw & 0x7FF) as u16)
}
