//! SYNC producer/consumer, window tracking and counter (spec.md §4.7 —
//! component G), grounded in `CO_SYNC.c/h`.

use crate::emcy::{bit, code, Emcy};
use crate::hal::{CanFrame, CanInterface, CanOpenError};
use crate::types::cob_id;

/// Whether this node produces SYNC, consumes it, or both (OD 0x1005 bit 30:
/// "this node is producer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Consumer,
    Producer,
}

/// SYNC timing reference: produces or consumes the periodic SYNC frame and
/// tracks the synchronous window that gates TPDO transmission.
pub struct Sync<H: CanInterface> {
    role: Role,
    cob_id: u16,
    period_us: u32,
    window_length_us: u32,
    counter_overflow: u8,
    elapsed_us: u32,
    counter: u8,
    window_open: bool,
    tx_handle: Option<H::TxHandle>,
}

impl<H: CanInterface> Sync<H> {
    pub fn new() -> Self {
        Self {
            role: Role::Consumer,
            cob_id: cob_id::SYNC,
            period_us: 0,
            window_length_us: 0,
            counter_overflow: 0,
            elapsed_us: 0,
            counter: 0,
            window_open: true,
            tx_handle: None,
        }
    }

    pub fn window_open(&self) -> bool {
        self.window_open
    }

    /// The COB-ID this object produces or consumes SYNC on.
    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// Applies OD 0x1005/0x1006/0x1007/0x1019 and reserves the transmit
    /// buffer slot if this node is the producer.
    pub fn communication_reset(
        &mut self,
        hal: &mut H,
        cob_id: u16,
        role: Role,
        period_us: u32,
        window_length_us: u32,
        counter_overflow: u8,
    ) {
        self.role = role;
        self.cob_id = cob_id;
        self.period_us = period_us;
        self.window_length_us = window_length_us;
        self.counter_overflow = counter_overflow;
        self.elapsed_us = 0;
        self.counter = 0;
        self.window_open = true;
        self.tx_handle = if matches!(role, Role::Producer) {
            hal.filter_install(cob_id);
            Some(hal.tx_buffer_init(cob_id))
        } else {
            hal.filter_install(cob_id);
            None
        };
    }

    fn has_counter_byte(&self) -> bool {
        (2..=240).contains(&self.counter_overflow)
    }

    fn advance_counter(&mut self) {
        if self.has_counter_byte() {
            self.counter += 1;
            if self.counter > self.counter_overflow {
                self.counter = 1;
            }
        }
    }

    /// A SYNC frame was received: resets the window timer and advances the
    /// counter.
    pub fn on_sync_received(&mut self) {
        self.elapsed_us = 0;
        self.window_open = self.window_length_us == 0;
        self.advance_counter();
    }

    /// Advances timers by `dt_us`. For a producer, emits SYNC once
    /// `elapsed_us >= period_us`; for a consumer, raises EMCY
    /// `0x8240`-class bit if `elapsed_us >= 1.5 * period_us` (spec.md §4.7).
    pub fn process(
        &mut self,
        hal: &mut H,
        emcy: &mut Emcy<H>,
        dt_us: u32,
    ) -> Result<(), CanOpenError> {
        if self.period_us == 0 {
            return Ok(());
        }
        self.elapsed_us = self.elapsed_us.saturating_add(dt_us);
        self.window_open = self.elapsed_us < self.window_length_us || self.window_length_us == 0;

        match self.role {
            Role::Producer => {
                if self.elapsed_us >= self.period_us {
                    self.elapsed_us = 0;
                    self.advance_counter();
                    let handle = self
                        .tx_handle
                        .ok_or(CanOpenError::InternalError("SYNC not communication-reset"))?;
                    let payload: &[u8] = if self.has_counter_byte() {
                        &[self.counter]
                    } else {
                        &[]
                    };
                    hal.send(handle, &CanFrame::new(self.cob_id, payload))?;
                    self.window_open = self.window_length_us == 0;
                }
            }
            Role::Consumer => {
                let threshold = self.period_us.saturating_mul(3) / 2;
                if self.elapsed_us >= threshold {
                    emcy.report(bit::SYNC_TIME_OUT, code::SYNC_DATA_LENGTH, 0);
                }
            }
        }
        Ok(())
    }
}

impl<H: CanInterface> Default for Sync<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn producer_emits_when_period_elapses() {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut sync: Sync<FakeHal> = Sync::new();
        sync.communication_reset(&mut hal, cob_id::SYNC, Role::Producer, 1000, 0, 0);
        let mut emcy = Emcy::new(1);
        emcy.communication_reset(&mut hal, 0);
        sync.process(&mut hal, &mut emcy, 999).unwrap();
        assert!(hal.sent.is_empty());
        sync.process(&mut hal, &mut emcy, 1).unwrap();
        assert_eq!(hal.sent.len(), 1);
    }

    #[test]
    fn consumer_raises_emcy_at_150_percent_period() {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut sync: Sync<FakeHal> = Sync::new();
        sync.communication_reset(&mut hal, cob_id::SYNC, Role::Consumer, 1000, 0, 0);
        let mut emcy = Emcy::new(1);
        emcy.communication_reset(&mut hal, 0);
        sync.process(&mut hal, &mut emcy, 1500).unwrap();
        let mut od = crate::od::ObjectDictionary::new();
        crate::emcy::install_od_entries(&mut od, 8);
        emcy.process(&mut hal, &mut od, 0, crate::types::NmtState::Operational, 0)
            .unwrap();
        assert_eq!(hal.sent.len(), 1);
    }

    #[test]
    fn window_closes_after_window_length_elapses() {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut sync: Sync<FakeHal> = Sync::new();
        sync.communication_reset(&mut hal, cob_id::SYNC, Role::Consumer, 10_000, 2_000, 0);
        sync.on_sync_received();
        let mut emcy = Emcy::new(1);
        emcy.communication_reset(&mut hal, 0);
        sync.process(&mut hal, &mut emcy, 1_000).unwrap();
        assert!(sync.window_open());
        sync.process(&mut hal, &mut emcy, 1_500).unwrap();
        assert!(!sync.window_open());
    }

    #[test]
    fn counter_wraps_at_overflow_value() {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut sync: Sync<FakeHal> = Sync::new();
        sync.communication_reset(&mut hal, cob_id::SYNC, Role::Producer, 1, 0, 3);
        let mut emcy = Emcy::new(1);
        emcy.communication_reset(&mut hal, 0);
        for _ in 0..4 {
            sync.process(&mut hal, &mut emcy, 1).unwrap();
        }
        assert_eq!(sync.counter(), 1);
    }
}
