//! Receive PDO: latches incoming process-data frames and scatters them into
//! the Object Dictionary on the SYNC boundary that owns them (spec.md §4.6,
//! `CO_RPDO_process`/`CO_RPDO_receive` in `CO_PDO.c`).

use super::{decode_cob_id, MappedVariables, MappingDirection, PdoMappingError};
use crate::emcy::{bit, code, Emcy};
use crate::hal::CanInterface;
use crate::od::ObjectDictionary;
use core::marker::PhantomData;
use log::warn;

/// One RPDO channel (OD 0x1400+communication / 0x1600+mapping).
pub struct Rpdo<H: CanInterface> {
    rx_cob_id: u16,
    valid: bool,
    transmission_type: u8,
    mapping: MappedVariables,
    /// Dual latch: a frame received before the next SYNC goes into
    /// `buffers[write_buf]`; the buffer not currently being written is the
    /// one `process` drains on the SYNC boundary.
    buffers: [[u8; 8]; 2],
    new_data: [bool; 2],
    write_buf: usize,
    consume_buf: Option<usize>,
    _hal: PhantomData<H>,
}

impl<H: CanInterface> Rpdo<H> {
    pub fn new() -> Self {
        Self {
            rx_cob_id: 0,
            valid: false,
            transmission_type: 254,
            mapping: MappedVariables::empty(),
            buffers: [[0; 8]; 2],
            new_data: [false; 2],
            // Toggle starts indeterminate; the source writes a pre-SYNC
            // frame to buffer[0] in that case (spec.md §9 Design Notes),
            // which falls out of leaving `write_buf` at its initial value.
            write_buf: 0,
            consume_buf: None,
            _hal: PhantomData,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn rx_cob_id(&self) -> u16 {
        self.rx_cob_id
    }

    /// Applies OD 0x1400/0x1600 at communication reset.
    pub fn communication_reset(
        &mut self,
        hal: &mut H,
        od: &ObjectDictionary,
        cob_id_raw: u32,
        transmission_type: u8,
        raw_mapping: &[u32],
    ) -> Result<(), PdoMappingError> {
        let (valid, rx_cob_id) = decode_cob_id(cob_id_raw);
        self.mapping = MappedVariables::configure(od, raw_mapping, MappingDirection::Rpdo)?;
        self.rx_cob_id = rx_cob_id;
        self.transmission_type = transmission_type;
        self.valid = valid;
        self.buffers = [[0; 8]; 2];
        self.new_data = [false; 2];
        self.write_buf = 0;
        self.consume_buf = None;
        if valid {
            hal.filter_install(rx_cob_id);
        }
        Ok(())
    }

    /// Latches a received frame matching this channel's COB-ID. Called from
    /// the receive context (spec.md §5): only copies bytes, sets a flag and,
    /// on a length mismatch, reports an EMCY; it never touches the Object
    /// Dictionary.
    pub fn on_frame(&mut self, emcy: &mut Emcy<H>, cob_id: u16, dlc: u8, data: &[u8; 8]) {
        if !self.valid || cob_id != self.rx_cob_id {
            return;
        }
        if dlc as usize != self.mapping.byte_length() as usize {
            warn!(
                "RPDO {:#05x} wrong length: expected {}, got {}",
                self.rx_cob_id,
                self.mapping.byte_length(),
                dlc
            );
            emcy.report(bit::RPDO_WRONG_LENGTH, code::PDO_LENGTH, 0);
            return;
        }
        self.buffers[self.write_buf] = *data;
        self.new_data[self.write_buf] = true;
    }

    /// Called once per SYNC reception, before `process`. Marks the
    /// currently-filling buffer as the one ready to be drained into the OD
    /// and flips the write side to the other buffer.
    pub fn on_sync(&mut self) {
        self.consume_buf = Some(self.write_buf);
        self.write_buf = 1 - self.write_buf;
    }

    /// Copies latched data into the mapped OD variables (spec.md §4.6:
    /// "if async or `sync_was`, copy the latched 8 bytes ... under the OD
    /// lock, then invoke any installed extension write callbacks" — the
    /// extension invocation itself happens inside `ObjectDictionary::write`).
    pub fn process(&mut self, od: &mut ObjectDictionary, sync_was: bool) {
        if !self.valid {
            return;
        }
        let is_async = self.transmission_type >= 254;
        if is_async {
            for buf in 0..2 {
                if self.new_data[buf] {
                    self.mapping.copy_into_od(od, &self.buffers[buf]);
                    self.new_data[buf] = false;
                }
            }
            return;
        }
        if sync_was {
            if let Some(buf) = self.consume_buf.take() {
                if self.new_data[buf] {
                    self.mapping.copy_into_od(od, &self.buffers[buf]);
                    self.new_data[buf] = false;
                }
            }
        }
    }
}

impl<H: CanInterface> Default for Rpdo<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emcy::Emcy;
    use crate::hal::{CanFrame, CanOpenError};
    use crate::od::{Attributes, ObjectEntry, ObjectValue};
    use alloc::vec::Vec;

    struct FakeHal {
        filters: Vec<u16>,
    }
    impl CanInterface for FakeHal {
        type TxHandle = ();
        fn tx_buffer_init(&mut self, _cob_id: u16) {}
        fn filter_install(&mut self, cob_id: u16) {
            self.filters.push(cob_id);
        }
        fn send(&mut self, _handle: (), _frame: &CanFrame) -> Result<(), CanOpenError> {
            Ok(())
        }
    }

    fn sample_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(
            0x6000,
            Attributes::read_write().with_rpdo_mappable(),
            ObjectValue::Unsigned16(0),
        ));
        od
    }

    #[test]
    fn async_rpdo_applies_on_next_process() {
        let mut hal = FakeHal { filters: Vec::new() };
        let od_template = sample_od();
        let mut rpdo: Rpdo<FakeHal> = Rpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 16 }.to_u32();
        rpdo.communication_reset(&mut hal, &od_template, 0x200, 255, &[raw]).unwrap();
        assert_eq!(hal.filters, [0x200]);

        let mut od = od_template;
        let mut emcy: Emcy<FakeHal> = Emcy::new(1);
        rpdo.on_frame(&mut emcy, 0x200, 2, &[0x34, 0x12, 0, 0, 0, 0, 0, 0]);
        rpdo.process(&mut od, false);
        let (value, _) = od.read(0x6000, 0).unwrap();
        assert_eq!(value, ObjectValue::Unsigned16(0x1234));
    }

    #[test]
    fn synchronous_rpdo_waits_for_sync_boundary() {
        let mut hal = FakeHal { filters: Vec::new() };
        let od_template = sample_od();
        let mut rpdo: Rpdo<FakeHal> = Rpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 16 }.to_u32();
        rpdo.communication_reset(&mut hal, &od_template, 0x200, 1, &[raw]).unwrap();

        let mut od = od_template;
        let mut emcy: Emcy<FakeHal> = Emcy::new(1);
        rpdo.on_frame(&mut emcy, 0x200, 2, &[0x34, 0x12, 0, 0, 0, 0, 0, 0]);
        rpdo.process(&mut od, false);
        assert_eq!(od.read(0x6000, 0).unwrap().0, ObjectValue::Unsigned16(0));

        rpdo.on_sync();
        rpdo.process(&mut od, true);
        assert_eq!(od.read(0x6000, 0).unwrap().0, ObjectValue::Unsigned16(0x1234));
    }

    #[test]
    fn wrong_length_frame_reports_emcy_and_is_dropped() {
        let mut hal = FakeHal { filters: Vec::new() };
        let od_template = sample_od();
        let mut rpdo: Rpdo<FakeHal> = Rpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 16 }.to_u32();
        rpdo.communication_reset(&mut hal, &od_template, 0x200, 255, &[raw]).unwrap();

        let mut od = od_template;
        let mut emcy: Emcy<FakeHal> = Emcy::new(1);
        // mapping expects 2 bytes; DLC of 4 is a length mismatch (spec.md §6).
        rpdo.on_frame(&mut emcy, 0x200, 4, &[0x34, 0x12, 0, 0, 0, 0, 0, 0]);
        rpdo.process(&mut od, false);
        assert_eq!(od.read(0x6000, 0).unwrap().0, ObjectValue::Unsigned16(0));
        assert_ne!(emcy.error_register(0) & 0x10, 0);
    }

    #[test]
    fn invalid_cob_id_disables_filter_and_processing() {
        let mut hal = FakeHal { filters: Vec::new() };
        let od_template = sample_od();
        let mut rpdo: Rpdo<FakeHal> = Rpdo::new();
        rpdo.communication_reset(&mut hal, &od_template, 0x8000_0200, 255, &[]).unwrap();
        assert!(hal.filters.is_empty());
        assert!(!rpdo.is_valid());
    }
}
