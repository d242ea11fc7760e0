//! Object Dictionary entry shapes and per-subindex attributes (spec.md
//! §3.1).

use super::extension::Extension;
use super::value::ObjectValue;
use alloc::vec::Vec;

/// Per-subindex attribute flags (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub readable: bool,
    pub writable: bool,
    pub rpdo_mappable: bool,
    pub tpdo_mappable: bool,
    /// "detect change-of-state": writes to this subindex are compared
    /// against the previous value and a status flag is raised on change.
    pub track_cos: bool,
    /// Endianness-sensitive multi-byte value; swapped on big-endian hosts.
    pub multi_byte: bool,
}

impl Attributes {
    pub const fn read_only() -> Self {
        Self {
            readable: true,
            writable: false,
            rpdo_mappable: false,
            tpdo_mappable: false,
            track_cos: false,
            multi_byte: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            readable: true,
            writable: true,
            rpdo_mappable: false,
            tpdo_mappable: false,
            track_cos: false,
            multi_byte: false,
        }
    }

    pub const fn with_rpdo_mappable(mut self) -> Self {
        self.rpdo_mappable = true;
        self
    }

    pub const fn with_tpdo_mappable(mut self) -> Self {
        self.tpdo_mappable = true;
        self
    }

    pub const fn with_track_cos(mut self) -> Self {
        self.track_cos = true;
        self
    }

    pub const fn with_multi_byte(mut self) -> Self {
        self.multi_byte = true;
        self
    }
}

/// One addressable subindex slot: a value cell plus its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct SubEntry {
    pub attributes: Attributes,
    pub value: ObjectValue,
}

impl SubEntry {
    pub fn new(attributes: Attributes, value: ObjectValue) -> Self {
        Self { attributes, value }
    }
}

/// The shape of an Object Dictionary entry (spec.md §3.1).
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// A single value at subindex 0.
    Variable(SubEntry),
    /// Homogeneous subindexes `1..=N` sharing attributes+type, with an
    /// implicit read-only subindex 0 reporting `N` (invariant 1).
    Array(Vec<SubEntry>),
    /// Heterogeneous subindexes, each with its own attributes+type.
    Record(Vec<SubEntry>),
    /// Variable-length payload; length is conveyed by the extension
    /// callback, not stored here (spec.md §4.2).
    Domain(SubEntry),
}

/// A complete dictionary entry: index, declared max subindex and shape,
/// plus an optional callback extension (spec.md §3.1, §4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub index: u16,
    pub max_sub_index: u8,
    pub object: Object,
    pub extension: Option<Extension>,
}

impl ObjectEntry {
    pub fn variable(index: u16, attributes: Attributes, value: ObjectValue) -> Self {
        Self {
            index,
            max_sub_index: 0,
            object: Object::Variable(SubEntry::new(attributes, value)),
            extension: None,
        }
    }

    pub fn domain(index: u16, attributes: Attributes) -> Self {
        Self {
            index,
            max_sub_index: 0,
            object: Object::Domain(SubEntry::new(attributes, ObjectValue::Domain(Vec::new()))),
            extension: None,
        }
    }

    pub fn array(index: u16, entries: Vec<SubEntry>) -> Self {
        let max_sub_index = entries.len() as u8;
        Self {
            index,
            max_sub_index,
            object: Object::Array(entries),
            extension: None,
        }
    }

    pub fn record(index: u16, entries: Vec<SubEntry>) -> Self {
        let max_sub_index = entries.len() as u8;
        Self {
            index,
            max_sub_index,
            object: Object::Record(entries),
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Borrows the sub-entry at `sub`, synthesizing the implicit
    /// Array/Record subindex-0 "highest subindex supported" entry
    /// (invariant 1).
    pub fn sub(&self, sub: u8) -> Option<SubEntryRef<'_>> {
        match &self.object {
            Object::Variable(e) | Object::Domain(e) => {
                if sub == 0 {
                    Some(SubEntryRef::Stored(e))
                } else {
                    None
                }
            }
            Object::Array(entries) => {
                if sub == 0 {
                    Some(SubEntryRef::HighestSubIndex(self.max_sub_index))
                } else {
                    entries.get(sub as usize - 1).map(SubEntryRef::Stored)
                }
            }
            Object::Record(entries) => {
                if sub == 0 {
                    entries.first().map(SubEntryRef::Stored)
                } else {
                    entries.get(sub as usize - 1).map(SubEntryRef::Stored)
                }
            }
        }
    }

    pub fn sub_mut(&mut self, sub: u8) -> Option<&mut SubEntry> {
        match &mut self.object {
            Object::Variable(e) | Object::Domain(e) => {
                if sub == 0 {
                    Some(e)
                } else {
                    None
                }
            }
            Object::Array(entries) => {
                if sub == 0 {
                    None
                } else {
                    entries.get_mut(sub as usize - 1)
                }
            }
            Object::Record(entries) => {
                if sub == 0 {
                    entries.get_mut(0)
                } else {
                    entries.get_mut(sub as usize - 1)
                }
            }
        }
    }
}

/// A borrowed sub-entry, or the synthesized Array subindex-0 value
/// (invariant 1, "index 0 of an Array is an implicit read-only u8 yielding
/// max_sub_index").
pub enum SubEntryRef<'a> {
    Stored(&'a SubEntry),
    HighestSubIndex(u8),
}

impl<'a> SubEntryRef<'a> {
    pub fn attributes(&self) -> Attributes {
        match self {
            Self::Stored(e) => e.attributes,
            Self::HighestSubIndex(_) => Attributes::read_only(),
        }
    }

    pub fn value(&self) -> ObjectValue {
        match self {
            Self::Stored(e) => e.value.clone(),
            Self::HighestSubIndex(n) => ObjectValue::Unsigned8(*n),
        }
    }
}
