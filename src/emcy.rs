//! Emergency error bookkeeping and EMCY frame emission (spec.md §4.3 —
//! component E), grounded in `CO_Emergency.c/h`.

use crate::hal::{CanFrame, CanInterface, CanOpenError};
use crate::od::{Attributes, Object, ObjectDictionary, ObjectEntry, ObjectValue};
use crate::types::{cob_id, NmtState};
use alloc::collections::VecDeque;
use log::{trace, warn};

/// Well-known error status bit numbers the core itself raises
/// (`CO_EM_errorStatusBits`, `CO_Emergency.h`). Device-profile/manufacturer
/// bits beyond these are free for the hosting application to use.
pub mod bit {
    pub const CAN_BUS_WARNING: u8 = 0x01;
    pub const RXMSG_WRONG_LENGTH: u8 = 0x02;
    pub const RXMSG_OVERFLOW: u8 = 0x03;
    pub const RPDO_WRONG_LENGTH: u8 = 0x04;
    pub const RPDO_OVERFLOW: u8 = 0x05;
    pub const CAN_RX_BUS_PASSIVE: u8 = 0x06;
    pub const CAN_TX_BUS_PASSIVE: u8 = 0x07;
    pub const NMT_WRONG_COMMAND: u8 = 0x08;
    pub const CAN_TX_BUS_OFF: u8 = 0x12;
    pub const CAN_RXB_OVERFLOW: u8 = 0x13;
    pub const CAN_TX_OVERFLOW: u8 = 0x14;
    pub const TPDO_OUTSIDE_WINDOW: u8 = 0x15;
    pub const SYNC_TIME_OUT: u8 = 0x18;
    pub const SYNC_LENGTH: u8 = 0x19;
    pub const PDO_WRONG_MAPPING: u8 = 0x1A;
    pub const HEARTBEAT_CONSUMER: u8 = 0x1B;
    pub const HB_CONSUMER_REMOTE_RESET: u8 = 0x1C;
    /// Supplemented feature: the core's own queue-overflow self-report bit
    /// (`CO_EM_EMERGENCY_BUFFER_FULL`).
    pub const EMERGENCY_BUFFER_FULL: u8 = 0x20;
}

/// Standard error codes, top byte of the 16-bit EMCY error code
/// (`CO_EM_errorCodes`, `CO_Emergency.h`).
pub mod code {
    pub const NO_ERROR: u16 = 0x0000;
    pub const GENERIC: u16 = 0x1000;
    pub const COMMUNICATION: u16 = 0x8100;
    pub const CAN_OVERRUN: u16 = 0x8110;
    pub const HEARTBEAT: u16 = 0x8130;
    pub const PROTOCOL_ERROR: u16 = 0x8200;
    pub const PDO_LENGTH: u16 = 0x8210;
    pub const SYNC_DATA_LENGTH: u16 = 0x8240;
    /// Self-report code for the pending-EMCY queue overflow condition
    /// (SPEC_FULL.md supplemented feature 1).
    pub const BUFFER_OVERFLOW: u16 = 0x6080;
}

/// Error register bit positions (OD 0x1001, `CO_errorRegisterBitmask_t`).
#[allow(dead_code)]
mod register_bit {
    pub const GENERIC: u8 = 0x01;
    pub const CURRENT: u8 = 0x02;
    pub const VOLTAGE: u8 = 0x04;
    pub const TEMPERATURE: u8 = 0x08;
    pub const COMMUNICATION: u8 = 0x10;
    pub const DEVICE_PROFILE: u8 = 0x20;
    pub const MANUFACTURER: u8 = 0x80;
}

const ERROR_STATUS_BYTES: usize = 32;
const PENDING_QUEUE_CAPACITY: usize = 10;
const PREDEFINED_ERROR_FIELD_LEN: usize = 8;

/// One queued-for-transmission (or already-recorded) EMCY event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEmcy {
    error_code: u16,
    error_register: u8,
    bit: u8,
    info: u32,
}

impl PendingEmcy {
    fn to_frame_payload(self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.error_code.to_le_bytes());
        data[2] = self.error_register;
        data[3] = self.bit;
        data[4..8].copy_from_slice(&self.info.to_le_bytes());
        data
    }
}

/// Error-bit bookkeeping, pending-frame queue and OD 0x1001/0x1003 upkeep
/// (spec.md §4.3).
pub struct Emcy<H: CanInterface> {
    node_id: u8,
    error_status_bits: [u8; ERROR_STATUS_BYTES],
    pending: VecDeque<PendingEmcy>,
    overflow_pending: bool,
    inhibit_time_us: u32,
    inhibit_elapsed_us: u32,
    tx_handle: Option<H::TxHandle>,
}

impl<H: CanInterface> Emcy<H> {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            error_status_bits: [0u8; ERROR_STATUS_BYTES],
            pending: VecDeque::with_capacity(PENDING_QUEUE_CAPACITY),
            overflow_pending: false,
            inhibit_time_us: 0,
            inhibit_elapsed_us: 0,
            tx_handle: None,
        }
    }

    pub fn cob_id(&self) -> u16 {
        cob_id::EMCY_BASE + self.node_id as u16
    }

    /// Reserves the EMCY transmit buffer slot; called once at communication
    /// reset (spec.md §3.5 ownership rules).
    pub fn communication_reset(&mut self, hal: &mut H, inhibit_time_us: u32) {
        self.tx_handle = Some(hal.tx_buffer_init(self.cob_id()));
        self.inhibit_time_us = inhibit_time_us;
        self.inhibit_elapsed_us = inhibit_time_us;
        self.pending.clear();
        self.overflow_pending = false;
    }

    fn bit_is_set(&self, bit: u8) -> bool {
        self.error_status_bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    fn set_bit(&mut self, bit: u8, value: bool) {
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        if value {
            self.error_status_bits[byte] |= mask;
        } else {
            self.error_status_bits[byte] &= !mask;
        }
    }

    /// OD 0x1001 error register, recomputed from the bits the core itself
    /// tracks each time a report/reset is processed (SPEC_FULL.md
    /// supplemented feature 2 — the source leaves device-profile and
    /// manufacturer bits to the application, which may OR its own bits in
    /// via `extra_register_bits` before reading this).
    pub fn error_register(&self, extra_register_bits: u8) -> u8 {
        let mut reg = extra_register_bits & (register_bit::DEVICE_PROFILE | register_bit::MANUFACTURER);
        let communication_bits = [
            bit::CAN_BUS_WARNING,
            bit::RXMSG_WRONG_LENGTH,
            bit::RXMSG_OVERFLOW,
            bit::RPDO_WRONG_LENGTH,
            bit::RPDO_OVERFLOW,
            bit::CAN_RX_BUS_PASSIVE,
            bit::CAN_TX_BUS_PASSIVE,
            bit::CAN_TX_BUS_OFF,
            bit::CAN_RXB_OVERFLOW,
            bit::CAN_TX_OVERFLOW,
            bit::SYNC_TIME_OUT,
            bit::SYNC_LENGTH,
            bit::HEARTBEAT_CONSUMER,
            bit::HB_CONSUMER_REMOTE_RESET,
        ];
        if communication_bits.iter().any(|&b| self.bit_is_set(b)) {
            reg |= register_bit::COMMUNICATION;
        }
        if self.bit_is_set(bit::EMERGENCY_BUFFER_FULL) {
            reg |= register_bit::GENERIC;
        }
        if reg != 0 {
            reg |= register_bit::GENERIC;
        }
        reg
    }

    /// Sets `bit` and queues an EMCY frame unless it was already set
    /// (spec.md §4.3 `report`, invariant: no-op if already recorded).
    pub fn report(&mut self, bit: u8, error_code: u16, info: u32) {
        if self.bit_is_set(bit) {
            return;
        }
        self.set_bit(bit, true);
        self.enqueue(PendingEmcy {
            error_code,
            error_register: 0,
            bit,
            info,
        });
    }

    /// Clears `bit` and queues a `code=0` reset frame (spec.md §4.3 `reset`).
    pub fn reset(&mut self, bit: u8, info: u32) {
        if !self.bit_is_set(bit) {
            return;
        }
        self.set_bit(bit, false);
        self.enqueue(PendingEmcy {
            error_code: code::NO_ERROR,
            error_register: 0,
            bit,
            info,
        });
    }

    fn enqueue(&mut self, frame: PendingEmcy) {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            if !self.overflow_pending && !self.bit_is_set(bit::EMERGENCY_BUFFER_FULL) {
                self.overflow_pending = true;
                warn!("EMCY pending queue full, dropping frame for bit {:#04x}", frame.bit);
            }
            return;
        }
        self.pending.push_back(frame);
    }

    /// Advances the inhibit timer and, once elapsed with a frame pending
    /// and the node listening, transmits the oldest frame and pushes it
    /// into OD 0x1003 (spec.md §4.3 `process`).
    pub fn process(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        dt_us: u32,
        nmt_state: NmtState,
        extra_register_bits: u8,
    ) -> Result<(), CanOpenError> {
        if self.overflow_pending && !self.bit_is_set(bit::EMERGENCY_BUFFER_FULL) {
            self.overflow_pending = false;
            self.report(bit::EMERGENCY_BUFFER_FULL, code::BUFFER_OVERFLOW, 0);
        }

        self.inhibit_elapsed_us = self.inhibit_elapsed_us.saturating_add(dt_us);
        if self.inhibit_elapsed_us < self.inhibit_time_us {
            return Ok(());
        }
        if !matches!(nmt_state, NmtState::PreOperational | NmtState::Operational) {
            return Ok(());
        }
        let Some(mut frame) = self.pending.pop_front() else {
            return Ok(());
        };
        frame.error_register = self.error_register(extra_register_bits);

        let handle = self
            .tx_handle
            .ok_or(CanOpenError::InternalError("EMCY not communication-reset"))?;
        let can_frame = CanFrame::new(self.cob_id(), &frame.to_frame_payload());
        hal.send(handle, &can_frame)?;
        self.inhibit_elapsed_us = 0;
        push_predefined_error_field(od, frame.error_code, frame.error_register, frame.bit);
        trace!(
            "EMCY tx code={:#06x} bit={:#04x} reg={:#04x}",
            frame.error_code,
            frame.bit,
            frame.error_register
        );
        Ok(())
    }
}

/// Seeds OD 0x1001 (error register, read-only) and 0x1003 (pre-defined
/// error field, an Array whose sub0 doubles as a reset command per
/// `ObjectDictionary::write`'s documented exception).
pub fn install_od_entries(od: &mut ObjectDictionary, ring_len: usize) {
    od.insert(ObjectEntry::variable(
        0x1001,
        Attributes::read_only(),
        ObjectValue::Unsigned8(0),
    ));
    let mut subs = alloc::vec::Vec::with_capacity(ring_len);
    for _ in 0..ring_len {
        subs.push(crate::od::SubEntry::new(
            Attributes::read_only(),
            ObjectValue::Unsigned32(0),
        ));
    }
    od.insert(ObjectEntry::array(0x1003, subs));
}

fn push_predefined_error_field(od: &mut ObjectDictionary, error_code: u16, error_register: u8, bit: u8) {
    let Some(entry) = od.find_mut(0x1003) else {
        return;
    };
    let Object::Array(subs) = &mut entry.object else {
        return;
    };
    let len = subs.len().min(PREDEFINED_ERROR_FIELD_LEN);
    let mut word = (error_code as u32) | ((error_register as u32) << 16) | ((bit as u32) << 24);
    for sub in subs.iter_mut().take(len) {
        if let ObjectValue::Unsigned32(slot) = &mut sub.value {
            core::mem::swap(slot, &mut word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::CanFrame as Frame;
    use alloc::vec::Vec;

    struct FakeHal {
        sent: Vec<Frame>,
    }
    impl CanInterface for FakeHal {
        type TxHandle = ();
        fn tx_buffer_init(&mut self, _cob_id: u16) {}
        fn filter_install(&mut self, _cob_id: u16) {}
        fn send(&mut self, _handle: (), frame: &Frame) -> Result<(), CanOpenError> {
            self.sent.push(*frame);
            Ok(())
        }
    }

    fn new_emcy() -> (Emcy<FakeHal>, FakeHal, ObjectDictionary) {
        let mut emcy = Emcy::new(4);
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        install_od_entries(&mut od, 8);
        emcy.communication_reset(&mut hal, 0);
        (emcy, hal, od)
    }

    #[test]
    fn repeated_report_without_reset_emits_one_frame() {
        let (mut emcy, mut hal, mut od) = new_emcy();
        emcy.report(bit::RXMSG_OVERFLOW, code::COMMUNICATION, 0);
        emcy.report(bit::RXMSG_OVERFLOW, code::COMMUNICATION, 0);
        emcy.process(&mut hal, &mut od, 0, NmtState::Operational, 0).unwrap();
        emcy.process(&mut hal, &mut od, 0, NmtState::Operational, 0).unwrap();
        assert_eq!(hal.sent.len(), 1);
    }

    #[test]
    fn report_then_reset_then_report_emits_two_frames() {
        let (mut emcy, mut hal, mut od) = new_emcy();
        emcy.report(bit::RPDO_OVERFLOW, code::COMMUNICATION, 0);
        emcy.reset(bit::RPDO_OVERFLOW, 0);
        emcy.report(bit::RPDO_OVERFLOW, code::COMMUNICATION, 0);
        for _ in 0..3 {
            emcy.process(&mut hal, &mut od, 0, NmtState::Operational, 0).unwrap();
        }
        assert_eq!(hal.sent.len(), 3);
    }

    #[test]
    fn silent_while_not_pre_op_or_operational() {
        let (mut emcy, mut hal, mut od) = new_emcy();
        emcy.report(bit::NMT_WRONG_COMMAND, code::COMMUNICATION, 0);
        emcy.process(&mut hal, &mut od, 0, NmtState::Initializing, 0).unwrap();
        assert!(hal.sent.is_empty());
        emcy.process(&mut hal, &mut od, 0, NmtState::PreOperational, 0).unwrap();
        assert_eq!(hal.sent.len(), 1);
    }

    #[test]
    fn overflow_self_reports_once_space_reopens() {
        let (mut emcy, mut hal, mut od) = new_emcy();
        for i in 0..PENDING_QUEUE_CAPACITY as u8 + 1 {
            emcy.report(i, code::GENERIC, 0);
        }
        assert!(emcy.overflow_pending);
        for _ in 0..(PENDING_QUEUE_CAPACITY + 2) {
            emcy.process(&mut hal, &mut od, 0, NmtState::Operational, 0).unwrap();
        }
        let overflow_frame = hal
            .sent
            .iter()
            .find(|f| u16::from_le_bytes([f.data[0], f.data[1]]) == code::BUFFER_OVERFLOW);
        assert!(overflow_frame.is_some());
    }

    #[test]
    fn predefined_error_field_receives_newest_first() {
        let (mut emcy, mut hal, mut od) = new_emcy();
        emcy.report(bit::SYNC_TIME_OUT, code::SYNC_DATA_LENGTH, 0);
        emcy.process(&mut hal, &mut od, 0, NmtState::Operational, 0).unwrap();
        let entry = od.find(0x1003).unwrap();
        let expected_register = register_bit::COMMUNICATION | register_bit::GENERIC;
        if let Object::Array(subs) = &entry.object {
            assert_eq!(
                subs[0].value,
                ObjectValue::Unsigned32(
                    (code::SYNC_DATA_LENGTH as u32)
                        | ((expected_register as u32) << 16)
                        | ((bit::SYNC_TIME_OUT as u32) << 24)
                )
            );
        } else {
            panic!("expected array");
        }
    }
}
