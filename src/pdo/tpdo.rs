//! Transmit PDO: gathers mapped OD variables into an 8-byte image and
//! decides when to emit it (spec.md §4.6, `CO_TPDO_process`/`CO_TPDOsend`
//! in `CO_PDO.c`).

use super::{decode_cob_id, MappedVariables, MappingDirection, PdoMappingError};
use crate::hal::{CanFrame, CanInterface, CanOpenError};
use crate::od::ObjectDictionary;
use log::trace;

/// Driver flag sentinel: no SYNC has been observed since the last
/// communication reset (spec.md §4.6 "`sync_counter` (255 = uninitialized)").
const SYNC_COUNTER_UNINITIALIZED: u8 = 255;

/// One TPDO channel (OD 0x1800+communication / 0x1A00+mapping).
pub struct Tpdo<H: CanInterface> {
    tx_cob_id: u16,
    valid: bool,
    transmission_type: u8,
    inhibit_time_us: u32,
    event_timer_ms: u32,
    sync_start_value: u8,
    mapping: MappedVariables,
    last_image: [u8; 8],
    send_request: bool,
    sync_counter: u8,
    inhibit_elapsed_us: u32,
    event_elapsed_ms: u32,
    tx_handle: Option<H::TxHandle>,
}

impl<H: CanInterface> Tpdo<H> {
    pub fn new() -> Self {
        Self {
            tx_cob_id: 0,
            valid: false,
            transmission_type: 254,
            inhibit_time_us: 0,
            event_timer_ms: 0,
            sync_start_value: 0,
            mapping: MappedVariables::empty(),
            last_image: [0; 8],
            send_request: true,
            sync_counter: SYNC_COUNTER_UNINITIALIZED,
            inhibit_elapsed_us: 0,
            event_elapsed_ms: 0,
            tx_handle: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Applies OD 0x1800/0x1A00 at communication reset. `inhibit_time_100us`
    /// is the raw OD value (×100 µs units, spec.md §4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn communication_reset(
        &mut self,
        hal: &mut H,
        od: &ObjectDictionary,
        cob_id_raw: u32,
        transmission_type: u8,
        inhibit_time_100us: u16,
        event_timer_ms: u16,
        sync_start_value: u8,
        raw_mapping: &[u32],
    ) -> Result<(), PdoMappingError> {
        let (valid, tx_cob_id) = decode_cob_id(cob_id_raw);
        self.mapping = MappedVariables::configure(od, raw_mapping, MappingDirection::Tpdo)?;
        self.tx_cob_id = tx_cob_id;
        self.valid = valid;
        self.transmission_type = transmission_type;
        self.inhibit_time_us = inhibit_time_100us as u32 * 100;
        self.event_timer_ms = event_timer_ms as u32;
        self.sync_start_value = sync_start_value;
        self.last_image = [0; 8];
        self.send_request = true;
        self.sync_counter = SYNC_COUNTER_UNINITIALIZED;
        self.inhibit_elapsed_us = 0;
        self.event_elapsed_ms = 0;
        self.tx_handle = if valid { Some(hal.tx_buffer_init(tx_cob_id)) } else { None };
        Ok(())
    }

    /// Requests an asynchronous/acyclic transmission on the next
    /// opportunity (application event, RTR equivalent, `event_timer`
    /// expiry).
    pub fn request_transmission(&mut self) {
        self.send_request = true;
    }

    /// Advances timers, detects change-of-state and emits the frame when
    /// due. `sync_was` and `sync_counter` reflect this cycle's SYNC
    /// reception and the producer/consumer's running SYNC counter
    /// (spec.md §4.6 selection rules).
    pub fn process(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        dt_us: u32,
        sync_was: bool,
        sync_counter: u8,
    ) -> Result<(), CanOpenError> {
        if !self.valid {
            return Ok(());
        }

        self.inhibit_elapsed_us = self.inhibit_elapsed_us.saturating_add(dt_us);
        if self.event_timer_ms > 0 {
            self.event_elapsed_ms = self.event_elapsed_ms.saturating_add(dt_us / 1000);
            if self.event_elapsed_ms >= self.event_timer_ms {
                self.send_request = true;
                self.event_elapsed_ms = 0;
            }
        }

        let mut image = [0u8; 8];
        self.mapping.copy_from_od(od, &mut image);
        if self.mapping.is_cos(&self.last_image, &image) {
            self.send_request = true;
        }
        self.last_image = image;

        let due = if self.transmission_type >= 254 {
            self.send_request && self.inhibit_elapsed_us >= self.inhibit_time_us
        } else if sync_was {
            self.synchronous_due(sync_counter)
        } else {
            false
        };

        if !due {
            return Ok(());
        }

        let handle = self
            .tx_handle
            .ok_or(CanOpenError::InternalError("TPDO not communication-reset"))?;
        let len = self.mapping.byte_length() as usize;
        hal.send(handle, &CanFrame::new(self.tx_cob_id, &image[..len]))?;
        self.send_request = false;
        self.inhibit_elapsed_us = 0;
        trace!("TPDO sent, cob_id {:#05x}", self.tx_cob_id);
        Ok(())
    }

    /// Type 0 is acyclic: send on the first SYNC after a request. Type
    /// `1..240` sends every Nth SYNC, counting from the SYNC whose counter
    /// matches `SYNC_start_value` when that field is non-zero.
    fn synchronous_due(&mut self, global_sync_counter: u8) -> bool {
        if self.transmission_type == 0 {
            return self.send_request;
        }
        if self.sync_counter == SYNC_COUNTER_UNINITIALIZED {
            if self.sync_start_value != 0 && global_sync_counter != self.sync_start_value {
                return false;
            }
            self.sync_counter = 0;
        }
        self.sync_counter += 1;
        if self.sync_counter >= self.transmission_type {
            self.sync_counter = 0;
            true
        } else {
            false
        }
    }
}

impl<H: CanInterface> Default for Tpdo<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Attributes, ObjectEntry, ObjectValue};
    use crate::pdo::PdoMappingEntry;
    use alloc::vec::Vec;

    struct FakeHal {
        sent: Vec<CanFrame>,
    }
    impl CanInterface for FakeHal {
        type TxHandle = ();
        fn tx_buffer_init(&mut self, _cob_id: u16) {}
        fn filter_install(&mut self, _cob_id: u16) {}
        fn send(&mut self, _handle: (), frame: &CanFrame) -> Result<(), CanOpenError> {
            self.sent.push(*frame);
            Ok(())
        }
    }

    fn sample_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(
            0x6000,
            Attributes::read_write().with_tpdo_mappable(),
            ObjectValue::Unsigned8(0),
        ));
        od
    }

    #[test]
    fn async_tpdo_sends_once_on_first_opportunity() {
        let mut hal = FakeHal { sent: Vec::new() };
        let od_template = sample_od();
        let mut tpdo: Tpdo<FakeHal> = Tpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 8 }.to_u32();
        tpdo.communication_reset(&mut hal, &od_template, 0x180, 255, 0, 0, 0, &[raw]).unwrap();

        let mut od = od_template;
        tpdo.process(&mut hal, &mut od, 0, false, 0).unwrap();
        assert_eq!(hal.sent.len(), 1);
        tpdo.process(&mut hal, &mut od, 0, false, 0).unwrap();
        assert_eq!(hal.sent.len(), 1);
    }

    #[test]
    fn inhibit_time_delays_repeated_async_transmission() {
        let mut hal = FakeHal { sent: Vec::new() };
        let od_template = sample_od();
        let mut tpdo: Tpdo<FakeHal> = Tpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 8 }.to_u32();
        tpdo.communication_reset(&mut hal, &od_template, 0x180, 255, 10, 0, 0, &[raw]).unwrap();

        let mut od = od_template;
        tpdo.process(&mut hal, &mut od, 0, false, 0).unwrap();
        assert_eq!(hal.sent.len(), 1);
        tpdo.request_transmission();
        tpdo.process(&mut hal, &mut od, 500, false, 0).unwrap();
        assert_eq!(hal.sent.len(), 1, "still inside the 1ms inhibit window");
        tpdo.process(&mut hal, &mut od, 600, false, 0).unwrap();
        assert_eq!(hal.sent.len(), 2);
    }

    #[test]
    fn synchronous_every_nth_sync_transmits_on_schedule() {
        let mut hal = FakeHal { sent: Vec::new() };
        let od_template = sample_od();
        let mut tpdo: Tpdo<FakeHal> = Tpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 8 }.to_u32();
        tpdo.communication_reset(&mut hal, &od_template, 0x180, 3, 0, 0, 0, &[raw]).unwrap();

        let mut od = od_template;
        for expected in [0, 0, 1] {
            tpdo.process(&mut hal, &mut od, 0, true, 0).unwrap();
            assert_eq!(hal.sent.len(), expected);
        }
    }

    #[test]
    fn cos_without_event_timer_requests_transmission() {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(
            0x6000,
            Attributes::read_write().with_tpdo_mappable().with_track_cos(),
            ObjectValue::Unsigned8(0),
        ));
        let mut tpdo: Tpdo<FakeHal> = Tpdo::new();
        let raw = PdoMappingEntry { index: 0x6000, sub_index: 0, bit_length: 8 }.to_u32();
        tpdo.communication_reset(&mut hal, &od, 0x180, 0, 0, 0, 0, &[raw]).unwrap();
        tpdo.send_request = false; // suppress the forced first transmission
        tpdo.process(&mut hal, &mut od, 0, true, 0).unwrap();
        assert!(hal.sent.is_empty());

        od.write(0x6000, 0, &[7]).unwrap();
        tpdo.process(&mut hal, &mut od, 0, true, 0).unwrap();
        assert_eq!(hal.sent.len(), 1);
        assert_eq!(hal.sent[0].payload(), &[7]);
    }
}
