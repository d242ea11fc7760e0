//! Node lifecycle state machine and heartbeat producer (spec.md §4.8 —
//! component F), grounded in `CO_NMT_Heartbeat.c/h`.

use crate::hal::{CanFrame, CanInterface, CanOpenError};
use crate::types::{cob_id, NmtCommand, NmtResetCmd, NmtState};
use core::convert::TryFrom;
use log::{debug, trace, warn};

/// Runs the NMT state machine and heartbeat producer for one node.
pub struct Nmt<H: CanInterface> {
    node_id: u8,
    state: NmtState,
    heartbeat_period_ms: u32,
    heartbeat_elapsed_ms: u32,
    tx_handle: Option<H::TxHandle>,
    /// True until the first heartbeat/bootup frame has been sent after a
    /// communication reset (spec.md §4.8: "self-bootup HB frame").
    bootup_pending: bool,
    /// Transmit slot for outgoing NMT commands this node itself issues
    /// (spec.md §4.10: the gateway's `start`/`stop`/`reset node` verbs are
    /// dispatched through here).
    control_tx_handle: Option<H::TxHandle>,
}

impl<H: CanInterface> Nmt<H> {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            state: NmtState::Initializing,
            heartbeat_period_ms: 0,
            heartbeat_elapsed_ms: 0,
            tx_handle: None,
            bootup_pending: true,
            control_tx_handle: None,
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn cob_id(&self) -> u16 {
        cob_id::HEARTBEAT_BASE + self.node_id as u16
    }

    /// Reserves the heartbeat transmit slot and resets to the lifecycle's
    /// entry state (spec.md §4.8: `INITIALIZING -> (bootup) -> PRE_OPERATIONAL
    /// | OPERATIONAL`, selected by OD 0x1F80).
    pub fn communication_reset(&mut self, hal: &mut H, heartbeat_period_ms: u32, auto_start: bool) {
        self.tx_handle = Some(hal.tx_buffer_init(self.cob_id()));
        self.control_tx_handle = Some(hal.tx_buffer_init(cob_id::NMT_CONTROL));
        self.heartbeat_period_ms = heartbeat_period_ms;
        self.heartbeat_elapsed_ms = 0;
        self.bootup_pending = true;
        self.state = if auto_start {
            NmtState::Operational
        } else {
            NmtState::PreOperational
        };
    }

    /// Transmits an NMT command addressed to `target_node_id` (`0` =
    /// broadcast), e.g. from the gateway's `start`/`stop`/`reset node`
    /// verbs (spec.md §4.10 dispatching into this component). This only
    /// puts the command on the wire; applying it to this node's own state
    /// happens through the normal receive path (`on_command`), exactly as
    /// for a command any other master would send.
    pub fn send_command(&mut self, hal: &mut H, command: NmtCommand, target_node_id: u8) -> Result<(), CanOpenError> {
        let handle = self
            .control_tx_handle
            .ok_or(CanOpenError::InternalError("NMT not communication-reset"))?;
        let frame = CanFrame::new(cob_id::NMT_CONTROL, &[command as u8, target_node_id]);
        hal.send(handle, &frame)
    }

    fn send_heartbeat_byte(&mut self, hal: &mut H, byte: u8) -> Result<(), CanOpenError> {
        let handle = self
            .tx_handle
            .ok_or(CanOpenError::InternalError("NMT not communication-reset"))?;
        let frame = CanFrame::new(self.cob_id(), &[byte]);
        hal.send(handle, &frame)
    }

    /// Applies a received NMT command byte (spec.md §4.8). `target_node_id`
    /// is the addressee byte from the frame; `0` means broadcast. Commands
    /// addressed elsewhere are ignored with no response (spec.md §8
    /// boundary behavior).
    pub fn on_command(&mut self, command_byte: u8, target_node_id: u8) -> NmtResetCmd {
        if target_node_id != 0 && target_node_id != self.node_id {
            return NmtResetCmd::None;
        }
        let Ok(command) = NmtCommand::try_from(command_byte) else {
            warn!("NMT wrong command byte {:#04x}", command_byte);
            return NmtResetCmd::None;
        };
        match command {
            NmtCommand::Start => {
                self.state = NmtState::Operational;
                NmtResetCmd::None
            }
            NmtCommand::Stop => {
                self.state = NmtState::Stopped;
                NmtResetCmd::None
            }
            NmtCommand::EnterPreOperational => {
                self.state = NmtState::PreOperational;
                NmtResetCmd::None
            }
            NmtCommand::ResetNode => NmtResetCmd::App,
            NmtCommand::ResetCommunication => NmtResetCmd::Comm,
        }
    }

    /// Advances the heartbeat producer timer and sends the bootup frame on
    /// the first call after a communication reset (spec.md §4.8: "Heartbeat
    /// producer: sends a single byte = state every OD 0x1017 milliseconds").
    pub fn process(&mut self, hal: &mut H, dt_ms: u32) -> Result<(), CanOpenError> {
        if self.bootup_pending {
            self.send_heartbeat_byte(hal, NmtState::Initializing.heartbeat_byte())?;
            self.bootup_pending = false;
            self.heartbeat_elapsed_ms = 0;
            debug!("NMT bootup frame sent, node {}", self.node_id);
            return Ok(());
        }

        if self.heartbeat_period_ms == 0 {
            return Ok(());
        }
        self.heartbeat_elapsed_ms = self.heartbeat_elapsed_ms.saturating_add(dt_ms);
        if self.heartbeat_elapsed_ms >= self.heartbeat_period_ms {
            self.heartbeat_elapsed_ms = 0;
            self.send_heartbeat_byte(hal, self.state.heartbeat_byte())?;
            trace!("NMT heartbeat, state {:?}", self.state);
        }
        Ok(())
    }
}
