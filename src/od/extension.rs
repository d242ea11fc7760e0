//! Per-entry callback extension (spec.md §4.2, Design Notes §9).
//!
//! Modeled as a capability pair rather than a function pointer + opaque
//! `void*`: the `user` payload's lifetime is tied to the owning
//! [`super::entry::ObjectEntry`], and handlers borrow the OD slice through
//! [`ExtCtx`] instead of holding a raw pointer into it.

use super::abort::OdError;
use super::value::ObjectValue;
use alloc::boxed::Box;

/// Outcome of an extension read/write callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtResult {
    /// The operation is complete.
    Ok,
    /// More data is expected (Domain read/write only): call again for the
    /// next chunk.
    Partial,
}

/// Borrowed context handed to an extension callback: the index/subindex
/// being accessed, and whether this call is part of an RPDO write, a TPDO
/// read, or a generic SDO/gateway access (some devices special-case the
/// first two, e.g. to set a "variable was written by RPDO" status flag).
pub struct ExtCtx<'a> {
    pub index: u16,
    pub sub_index: u8,
    pub status_flags: &'a mut [u8],
}

type ReadFn = dyn FnMut(&mut ExtCtx<'_>, &mut ObjectValue) -> Result<ExtResult, OdError>;
type WriteFn = dyn FnMut(&mut ExtCtx<'_>, &[u8]) -> Result<ExtResult, OdError>;

/// The callback + status-flags extension attached to an [`super::entry::ObjectEntry`].
pub struct Extension {
    read_fn: Option<Box<ReadFn>>,
    write_fn: Option<Box<WriteFn>>,
    /// Per-subindex status byte array (spec.md §3.1: "variable was written
    /// by RPDO", "send TPDO now", etc.). Index 0 unused, mirroring
    /// subindex numbering.
    status_flags: alloc::vec::Vec<u8>,
}

impl Extension {
    pub fn new(max_sub_index: u8) -> Self {
        Self {
            read_fn: None,
            write_fn: None,
            status_flags: alloc::vec![0u8; max_sub_index as usize + 1],
        }
    }

    pub fn with_read_fn(
        mut self,
        f: impl FnMut(&mut ExtCtx<'_>, &mut ObjectValue) -> Result<ExtResult, OdError> + 'static,
    ) -> Self {
        self.read_fn = Some(Box::new(f));
        self
    }

    pub fn with_write_fn(
        mut self,
        f: impl FnMut(&mut ExtCtx<'_>, &[u8]) -> Result<ExtResult, OdError> + 'static,
    ) -> Self {
        self.write_fn = Some(Box::new(f));
        self
    }

    /// Invokes the read callback, if installed. Returns `Ok(None)` when no
    /// callback is installed (the caller falls back to the stored value).
    pub fn read(
        &mut self,
        index: u16,
        sub_index: u8,
        value: &mut ObjectValue,
    ) -> Result<Option<ExtResult>, OdError> {
        match self.read_fn.as_mut() {
            Some(f) => {
                let mut ctx = ExtCtx {
                    index,
                    sub_index,
                    status_flags: &mut self.status_flags,
                };
                f(&mut ctx, value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Invokes the write callback, if installed.
    pub fn write(
        &mut self,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<Option<ExtResult>, OdError> {
        match self.write_fn.as_mut() {
            Some(f) => {
                let mut ctx = ExtCtx {
                    index,
                    sub_index,
                    status_flags: &mut self.status_flags,
                };
                f(&mut ctx, data).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn status_flag(&self, sub_index: u8) -> u8 {
        self.status_flags.get(sub_index as usize).copied().unwrap_or(0)
    }

    pub fn set_status_flag(&mut self, sub_index: u8, value: u8) {
        if let Some(slot) = self.status_flags.get_mut(sub_index as usize) {
            *slot = value;
        }
    }
}

impl core::fmt::Debug for Extension {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Extension")
            .field("has_read_fn", &self.read_fn.is_some())
            .field("has_write_fn", &self.write_fn.is_some())
            .field("status_flags", &self.status_flags)
            .finish()
    }
}

impl PartialEq for Extension {
    fn eq(&self, other: &Self) -> bool {
        self.status_flags == other.status_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_callback_can_report_partial_for_domain_chunks() {
        let mut ext = Extension::new(0).with_write_fn(|_ctx, data| {
            if data.len() < 4 {
                Ok(ExtResult::Partial)
            } else {
                Ok(ExtResult::Ok)
            }
        });
        assert_eq!(ext.write(0x2300, 0, &[1, 2]).unwrap(), Some(ExtResult::Partial));
        assert_eq!(ext.write(0x2300, 0, &[1, 2, 3, 4]).unwrap(), Some(ExtResult::Ok));
    }

    #[test]
    fn status_flags_persist_across_calls() {
        let mut ext = Extension::new(1).with_write_fn(|ctx, _data| {
            ctx.status_flags[ctx.sub_index as usize] = 1;
            Ok(ExtResult::Ok)
        });
        ext.write(0x6000, 1, &[0]).unwrap();
        assert_eq!(ext.status_flag(1), 1);
    }
}
