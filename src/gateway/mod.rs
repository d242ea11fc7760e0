//! CiA 309-3 ASCII command gateway (spec.md §4.10 — component L), grounded
//! in `CO_gateway_ascii.c/h`.
//!
//! Parses `"[<seq>] [[<net>] <node>] <verb> ..."` command lines out of a
//! line buffer the host feeds with [`Gateway::write`], dispatches SDO
//! reads/writes through an [`SdoClient`] and NMT commands through an
//! [`Nmt`], and streams the formatted response back out through a
//! caller-supplied sink (`CO_GTWA_t.readCallback`'s role). `help`/`led`/`log`
//! are read-only diagnostics bridging the help text, the LED controller and
//! the EMCY pending queue (SPEC_FULL.md supplemented feature 4). LSS
//! commands are recognised syntactically and rejected with `ERROR:100`
//! since the LSS master's own state machine is out of scope (spec.md §1).

pub mod datatype;
pub mod state;

pub use datatype::Datatype;
pub use state::GatewayState;

use crate::emcy::Emcy;
use crate::fifo::ascii;
use crate::fifo::Fifo;
use crate::hal::CanInterface;
use crate::nmt::Nmt;
use crate::od::ObjectDictionary;
use crate::sdo::{SdoClient, SdoClientError, SdoClientReturn};
use crate::types::NmtCommand;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// Response error codes as specified by CiA 309-3 (`CO_GTWA_respErrorCode_t`).
/// Only the generic, network-topology-independent codes apply to this
/// single-bus implementation; the connection-monitoring (200s), CAN-state
/// (300s), PDO (400s) and LSS (500s) families are not reachable here.
mod error {
    pub const REQ_NOT_SUPPORTED: u32 = 100;
    pub const SYNTAX: u32 = 101;
    pub const INTERNAL_STATE: u32 = 102;
    pub const TIMEOUT: u32 = 103;
    pub const NO_DEFAULT_NODE: u32 = 105;

    /// Human-readable suffix for the generic 100-series codes, mirroring
    /// `CO_gateway_ascii.c`'s `errorDescs[]` table; falls back to `"-"` for
    /// any code not in that table, the same default the original uses.
    pub fn description(code: u32) -> &'static str {
        match code {
            REQ_NOT_SUPPORTED => "Request not supported.",
            SYNTAX => "Syntax error.",
            INTERNAL_STATE => "Request not processed due to internal state.",
            TIMEOUT => "Time-out.",
            NO_DEFAULT_NODE => "No default node set.",
            _ => "-",
        }
    }
}

const COMM_FIFO_CAPACITY: usize = 200;
const MAX_TOKEN_LEN: usize = 64;
/// Matches `SdoClient`'s own FIFO capacity: a read whose decoded value
/// exceeds this is reported as `ERROR:102`, never silently truncated
/// (spec.md §8 boundary behavior).
const MAX_VALUE_LEN: usize = 1024;

/// Command-line engine. Owns only its own line buffer, response queue and
/// configuration (`net`/`node` defaults, SDO timeout/block-transfer
/// settings); the collaborators it dispatches into (`SdoClient`, `Nmt`,
/// `Emcy`, `Led`) are borrowed from the host's [`crate::node::Node`] for the
/// duration of one `process` call.
pub struct Gateway {
    comm_fifo: Fifo,
    state: GatewayState,
    node_default: Option<u8>,
    sdo_timeout_ms: u16,
    sdo_block_enabled: bool,
    resp: Vec<u8>,
    resp_pos: usize,
    pending_seq: u32,
    pending_dtype: Datatype,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            comm_fifo: Fifo::new(COMM_FIFO_CAPACITY),
            state: GatewayState::Idle,
            node_default: None,
            sdo_timeout_ms: 500,
            sdo_block_enabled: false,
            resp: Vec::new(),
            resp_pos: 0,
            pending_seq: 0,
            pending_dtype: Datatype::Hex,
        }
    }

    /// Appends command bytes to the line buffer (`CO_GTWA_write`). Returns
    /// the number actually accepted; the caller is expected to retry the
    /// remainder once `write_space` reopens.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.comm_fifo.write(bytes, None)
    }

    pub fn write_space(&self) -> usize {
        self.comm_fifo.get_space()
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    fn flush_resp(&mut self, sink: &mut dyn FnMut(&[u8]) -> usize) {
        while self.resp_pos < self.resp.len() {
            let consumed = sink(&self.resp[self.resp_pos..]);
            if consumed == 0 {
                return;
            }
            self.resp_pos += consumed;
        }
        self.resp.clear();
        self.resp_pos = 0;
    }

    fn respond_ok(&mut self, seq: u32) {
        self.resp.extend_from_slice(format!("[{}] OK\r\n", seq).as_bytes());
    }

    fn respond_value(&mut self, seq: u32, value: &str) {
        self.resp.extend_from_slice(format!("[{}] {}\r\n", seq, value).as_bytes());
    }

    fn respond_error(&mut self, seq: u32, code: u32) {
        self.resp.extend_from_slice(
            format!("[{}] ERROR:{} #{}\r\n", seq, code, error::description(code)).as_bytes(),
        );
    }

    fn respond_sdo_abort(&mut self, seq: u32, code: crate::od::SdoAbortCode) {
        self.resp
            .extend_from_slice(format!("[{}] ERROR:{}\r\n", seq, code).as_bytes());
    }

    /// Discards the remainder of the current, already-partially-parsed
    /// command line (trailing garbage after a structurally complete
    /// command, spec.md §4.1 `comm_search`-adjacent cleanup).
    fn drain_line(&mut self) {
        loop {
            if self.comm_fifo.get_occupied() == 0 {
                return;
            }
            let b = self.comm_fifo.peek(0);
            self.comm_fifo.discard(1);
            if b == crate::fifo::DELIM_COMMAND {
                return;
            }
        }
    }

    fn next_token(&mut self, closed: &mut bool, max_len: usize) -> Result<Vec<u8>, ()> {
        let t = ascii::read_token(&mut self.comm_fifo, max_len);
        *closed = t.closed;
        if t.err {
            Err(())
        } else {
            Ok(t.token)
        }
    }

    fn resolve_node(&self, nums: &[u32]) -> Result<u8, u32> {
        let node = match nums.len() {
            2 => Some(nums[1] as u8),
            1 => Some(nums[0] as u8),
            _ => self.node_default,
        };
        node.ok_or(error::NO_DEFAULT_NODE)
    }

    /// Runs one tick: flushes any held response bytes, then either parses a
    /// new command line or advances an in-flight SDO transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn process<H: CanInterface>(
        &mut self,
        enable: bool,
        dt_ms: u32,
        hal: &mut H,
        od: &mut ObjectDictionary,
        sdo_client: &mut SdoClient<H>,
        nmt: &mut Nmt<H>,
        emcy: &Emcy<H>,
        led: &crate::led::Led,
        sink: &mut dyn FnMut(&[u8]) -> usize,
    ) {
        if !enable {
            return;
        }
        self.flush_resp(sink);
        if !self.resp.is_empty() {
            return;
        }

        match self.state {
            GatewayState::Idle => self.poll_idle(hal, sdo_client, nmt, emcy, led),
            GatewayState::Read => self.poll_read(hal, od, sdo_client, dt_ms),
            GatewayState::Write => self.poll_write(hal, od, sdo_client, dt_ms),
            GatewayState::WriteAborted => self.state = GatewayState::Idle,
        }

        self.flush_resp(sink);
    }

    fn poll_idle<H: CanInterface>(
        &mut self,
        hal: &mut H,
        sdo_client: &mut SdoClient<H>,
        nmt: &mut Nmt<H>,
        emcy: &Emcy<H>,
        led: &crate::led::Led,
    ) {
        if !ascii::comm_search(&mut self.comm_fifo, false) {
            return;
        }

        let seq_tok = ascii::read_token(&mut self.comm_fifo, 16);
        if seq_tok.err {
            // Blank or comment-only line: silently ignored per spec.md §4.10.
            return;
        }
        let Some(seq) = parse_seq(&seq_tok.token) else {
            self.respond_error(0, error::SYNTAX);
            return;
        };
        if seq_tok.closed {
            self.respond_error(seq, error::SYNTAX);
            return;
        }

        let mut nums: Vec<u32> = Vec::new();
        let mut closed = false;
        let verb_tok = loop {
            let t = ascii::read_token(&mut self.comm_fifo, MAX_TOKEN_LEN);
            if t.err {
                self.respond_error(seq, error::SYNTAX);
                return;
            }
            closed = t.closed;
            if nums.len() < 2 {
                if let Ok(text) = core::str::from_utf8(&t.token) {
                    if let Ok(n) = text.parse::<u32>() {
                        nums.push(n);
                        continue;
                    }
                }
            }
            break t.token;
        };

        let result = self.dispatch(hal, sdo_client, nmt, emcy, led, seq, &verb_tok, &nums, &mut closed);
        if !closed {
            self.drain_line();
        }
        if let Err(code) = result {
            self.respond_error(seq, code);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch<H: CanInterface>(
        &mut self,
        hal: &mut H,
        sdo_client: &mut SdoClient<H>,
        nmt: &mut Nmt<H>,
        emcy: &Emcy<H>,
        led: &crate::led::Led,
        seq: u32,
        verb: &[u8],
        nums: &[u32],
        closed: &mut bool,
    ) -> Result<(), u32> {
        let verb = core::str::from_utf8(verb).map_err(|_| error::SYNTAX)?;
        match verb {
            "r" | "read" => self.cmd_read(hal, sdo_client, seq, nums, closed),
            "w" | "write" => self.cmd_write(hal, sdo_client, seq, nums, closed),
            "start" => self.send_nmt(hal, nmt, seq, nums, NmtCommand::Start),
            "stop" => self.send_nmt(hal, nmt, seq, nums, NmtCommand::Stop),
            "preop" | "preoperational" => self.send_nmt(hal, nmt, seq, nums, NmtCommand::EnterPreOperational),
            "reset" => self.cmd_reset(hal, nmt, seq, nums, closed),
            "set" => self.cmd_set(seq, closed),
            "help" => {
                if !*closed {
                    let _ = self.next_token(closed, 16);
                }
                self.resp.extend_from_slice(HELP_TEXT.as_bytes());
                self.respond_ok(seq);
                Ok(())
            }
            "led" => {
                let text = format!("red=0x{:02X} green=0x{:02X}", led.red(), led.green());
                self.respond_value(seq, &text);
                Ok(())
            }
            "log" => {
                let text = format_log(emcy);
                self.respond_value(seq, &text);
                Ok(())
            }
            v if is_lss_verb(v) => {
                self.drain_line();
                *closed = true;
                Err(error::REQ_NOT_SUPPORTED)
            }
            _ => Err(error::SYNTAX),
        }
    }

    fn cmd_reset<H: CanInterface>(
        &mut self,
        hal: &mut H,
        nmt: &mut Nmt<H>,
        seq: u32,
        nums: &[u32],
        closed: &mut bool,
    ) -> Result<(), u32> {
        if *closed {
            return Err(error::SYNTAX);
        }
        let sub_tok = self.next_token(closed, 16).map_err(|_| error::SYNTAX)?;
        let sub = core::str::from_utf8(&sub_tok).map_err(|_| error::SYNTAX)?;
        let command = match sub {
            "node" => NmtCommand::ResetNode,
            "comm" | "communication" => NmtCommand::ResetCommunication,
            _ => return Err(error::SYNTAX),
        };
        self.send_nmt(hal, nmt, seq, nums, command)
    }

    fn send_nmt<H: CanInterface>(
        &mut self,
        hal: &mut H,
        nmt: &mut Nmt<H>,
        seq: u32,
        nums: &[u32],
        command: NmtCommand,
    ) -> Result<(), u32> {
        let node = self.resolve_node(nums)?;
        nmt.send_command(hal, command, node).map_err(|_| error::INTERNAL_STATE)?;
        self.respond_ok(seq);
        Ok(())
    }

    fn cmd_set(&mut self, seq: u32, closed: &mut bool) -> Result<(), u32> {
        if *closed {
            return Err(error::SYNTAX);
        }
        let sub_tok = self.next_token(closed, 16).map_err(|_| error::SYNTAX)?;
        let sub = String::from_utf8(sub_tok).map_err(|_| error::SYNTAX)?;
        if *closed {
            return Err(error::SYNTAX);
        }
        let value_tok = self.next_token(closed, 16).map_err(|_| error::SYNTAX)?;
        let value = String::from_utf8(value_tok).map_err(|_| error::SYNTAX)?;

        // The optional leading <net> addresses which gateway network to
        // configure; this crate models a single bus and ignores it.
        match sub.as_str() {
            "network" => { value.parse::<u16>().map_err(|_| error::SYNTAX)?; }
            "node" => self.node_default = Some(value.parse::<u8>().map_err(|_| error::SYNTAX)?),
            "sdo_timeout" => self.sdo_timeout_ms = value.parse::<u16>().map_err(|_| error::SYNTAX)?,
            "sdo_block" => self.sdo_block_enabled = value.parse::<u8>().map_err(|_| error::SYNTAX)? != 0,
            _ => return Err(error::SYNTAX),
        }
        self.respond_ok(seq);
        Ok(())
    }

    fn cmd_read<H: CanInterface>(
        &mut self,
        hal: &mut H,
        sdo_client: &mut SdoClient<H>,
        seq: u32,
        nums: &[u32],
        closed: &mut bool,
    ) -> Result<(), u32> {
        let node = self.resolve_node(nums)?;
        if *closed {
            return Err(error::SYNTAX);
        }
        let index = self.read_index(closed)?;
        if *closed {
            return Err(error::SYNTAX);
        }
        let sub_index = self.read_sub_index(closed)?;

        let dtype = if *closed {
            datatype::DEFAULT_READ_DATATYPE
        } else {
            let dt_tok = self.next_token(closed, 8).map_err(|_| error::SYNTAX)?;
            let dt_str = core::str::from_utf8(&dt_tok).map_err(|_| error::SYNTAX)?;
            Datatype::parse(dt_str).ok_or(error::SYNTAX)?
        };

        if !sdo_client.is_idle() {
            return Err(error::INTERNAL_STATE);
        }
        sdo_client.communication_reset(hal, node, self.sdo_timeout_ms as u32);
        sdo_client
            .upload_start(hal, index, sub_index, self.sdo_block_enabled)
            .map_err(|_| error::INTERNAL_STATE)?;

        self.pending_seq = seq;
        self.pending_dtype = dtype;
        self.state = GatewayState::Read;
        Ok(())
    }

    fn cmd_write<H: CanInterface>(
        &mut self,
        hal: &mut H,
        sdo_client: &mut SdoClient<H>,
        seq: u32,
        nums: &[u32],
        closed: &mut bool,
    ) -> Result<(), u32> {
        let node = self.resolve_node(nums)?;
        if *closed {
            return Err(error::SYNTAX);
        }
        let index = self.read_index(closed)?;
        if *closed {
            return Err(error::SYNTAX);
        }
        let sub_index = self.read_sub_index(closed)?;
        if *closed {
            return Err(error::SYNTAX);
        }
        let dt_tok = self.next_token(closed, 8).map_err(|_| error::SYNTAX)?;
        let dt_str = core::str::from_utf8(&dt_tok).map_err(|_| error::SYNTAX)?;
        let dtype = Datatype::parse(dt_str).ok_or(error::SYNTAX)?;
        if *closed {
            return Err(error::SYNTAX);
        }

        let mut value = vec![0u8; MAX_VALUE_LEN];
        let (n, flags) = ascii::cpy_tok_to_value(&mut self.comm_fifo, dtype, &mut value);
        *closed = flags.closed;
        if !flags.is_ok() {
            return Err(if flags.err_buf { error::INTERNAL_STATE } else { error::SYNTAX });
        }

        if !sdo_client.is_idle() {
            return Err(error::INTERNAL_STATE);
        }
        sdo_client.communication_reset(hal, node, self.sdo_timeout_ms as u32);
        sdo_client.download_fifo_mut().write(&value[..n], None);
        sdo_client.mark_download_complete();
        sdo_client
            .download_start(hal, index, sub_index, Some(n), self.sdo_block_enabled)
            .map_err(|_| error::INTERNAL_STATE)?;

        self.pending_seq = seq;
        self.state = GatewayState::Write;
        Ok(())
    }

    fn read_index(&mut self, closed: &mut bool) -> Result<u16, u32> {
        let tok = self.next_token(closed, 16).map_err(|_| error::SYNTAX)?;
        let text = core::str::from_utf8(&tok).map_err(|_| error::SYNTAX)?;
        parse_flex_u32(text).map(|v| v as u16).ok_or(error::SYNTAX)
    }

    fn read_sub_index(&mut self, closed: &mut bool) -> Result<u8, u32> {
        let tok = self.next_token(closed, 16).map_err(|_| error::SYNTAX)?;
        let text = core::str::from_utf8(&tok).map_err(|_| error::SYNTAX)?;
        parse_flex_u32(text).map(|v| v as u8).ok_or(error::SYNTAX)
    }

    fn poll_read<H: CanInterface>(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        sdo_client: &mut SdoClient<H>,
        dt_ms: u32,
    ) {
        match sdo_client.process(hal, od, dt_ms, None) {
            Ok(SdoClientReturn::Ok) => {
                let fifo = sdo_client.upload_fifo_mut();
                let occupied = fifo.get_occupied();
                if occupied > MAX_VALUE_LEN {
                    self.respond_error(self.pending_seq, error::INTERNAL_STATE);
                } else {
                    let mut raw = vec![0u8; occupied];
                    fifo.read(&mut raw, None);
                    let mut text = String::new();
                    if ascii::print_value(self.pending_dtype, &raw, &mut text) {
                        self.respond_value(self.pending_seq, &text);
                    } else {
                        self.respond_error(self.pending_seq, error::INTERNAL_STATE);
                    }
                }
                self.state = GatewayState::Idle;
            }
            Ok(_) => {}
            Err(err) => self.finish_with_error(err),
        }
    }

    fn poll_write<H: CanInterface>(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        sdo_client: &mut SdoClient<H>,
        dt_ms: u32,
    ) {
        match sdo_client.process(hal, od, dt_ms, None) {
            Ok(SdoClientReturn::Ok) => {
                self.respond_ok(self.pending_seq);
                self.state = GatewayState::Idle;
            }
            Ok(_) => {}
            Err(SdoClientError::EndedWithServerAbort(code)) => {
                self.respond_sdo_abort(self.pending_seq, code);
                self.state = GatewayState::WriteAborted;
            }
            Err(err) => self.finish_with_error(err),
        }
    }

    fn finish_with_error(&mut self, err: SdoClientError) {
        match err {
            SdoClientError::EndedWithServerAbort(code) => self.respond_sdo_abort(self.pending_seq, code),
            SdoClientError::EndedWithTimeout => self.respond_error(self.pending_seq, error::TIMEOUT),
            SdoClientError::EndedWithClientAbort | SdoClientError::WrongArguments => {
                self.respond_error(self.pending_seq, error::INTERNAL_STATE)
            }
        }
        self.state = GatewayState::Idle;
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_seq(tok: &[u8]) -> Option<u32> {
    let s = core::str::from_utf8(tok).ok()?;
    let inner = s.strip_prefix('[')?.strip_suffix(']')?;
    inner.parse().ok()
}

fn parse_flex_u32(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn is_lss_verb(v: &str) -> bool {
    v.starts_with("lss_") || v == "_lss_fastscan"
}

fn format_log<H: CanInterface>(emcy: &Emcy<H>) -> String {
    let mut text = String::new();
    for (i, code) in emcy.pending_codes().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        text.push_str(&format!("0x{:04X}", code));
    }
    if text.is_empty() {
        text.push_str("none");
    }
    text
}

const HELP_TEXT: &str = "\
[[<net>] <node>] r[ead] <index> <subindex> [<datatype>]\r\n\
[[<net>] <node>] w[rite] <index> <subindex> <datatype> <value>\r\n\
[[<net>] <node>] start|stop|preop[erational]\r\n\
[[<net>] <node>] reset node|reset comm[unication]\r\n\
[<net>] set network|node|sdo_timeout|sdo_block <value>\r\n\
help|led|log\r\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{CanFrame, CanOpenError};
    use crate::od::{Attributes, ObjectEntry, ObjectValue};
    use crate::types::NmtState;
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

    fn collect(resp: &mut Vec<u8>) -> impl FnMut(&[u8]) -> usize + '_ {
        move |bytes: &[u8]| {
            resp.extend_from_slice(bytes);
            bytes.len()
        }
    }

    fn server_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(0x2100, Attributes::read_write(), ObjectValue::Unsigned16(0)));
        od.insert(ObjectEntry::variable(
            0x1000,
            Attributes::read_only(),
            ObjectValue::Unsigned32(0x0002_0192),
        ));
        od
    }

    /// Drives one client-side command through to completion, bouncing
    /// frames through a locally constructed `SdoServer` to simulate node 4
    /// replying on the bus (the two-node bridge pattern used by
    /// `sdo::client`/`sdo::server`'s own tests).
    fn run_to_completion(
        gw: &mut Gateway,
        client_hal: &mut FakeHal,
        client_od: &mut ObjectDictionary,
        sdo_client: &mut SdoClient<FakeHal>,
        nmt: &mut Nmt<FakeHal>,
        emcy: &Emcy<FakeHal>,
        led: &crate::led::Led,
        server: &mut crate::sdo::SdoServer<FakeHal>,
        server_hal: &mut FakeHal,
        server_od: &mut ObjectDictionary,
    ) -> Vec<u8> {
        let mut resp = Vec::new();
        for _ in 0..20 {
            gw.process(
                true,
                10,
                client_hal,
                client_od,
                sdo_client,
                nmt,
                emcy,
                led,
                &mut collect(&mut resp),
            );
            if let Some(frame) = client_hal.sent.pop() {
                server
                    .process(server_hal, server_od, NmtState::Operational, 0, Some(&frame))
                    .unwrap();
            }
            if let Some(frame) = server_hal.sent.pop() {
                sdo_client.process(client_hal, client_od, 0, Some(&frame)).unwrap();
            }
            if !resp.is_empty() {
                break;
            }
        }
        resp
    }

    #[test]
    fn expedited_write_round_trips_to_ok() {
        let mut gw = Gateway::new();
        let mut client_hal = FakeHal { sent: Vec::new() };
        let mut client_od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut client_hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        let mut server_hal = FakeHal { sent: Vec::new() };
        let mut server_od = server_od();
        let mut server: crate::sdo::SdoServer<FakeHal> = crate::sdo::SdoServer::new();
        server.communication_reset(&mut server_hal, 4, 500);

        gw.write(b"[1] 4 write 0x2100 0 u16 0x1234\n");
        let resp = run_to_completion(
            &mut gw,
            &mut client_hal,
            &mut client_od,
            &mut sdo_client,
            &mut nmt,
            &emcy,
            &led,
            &mut server,
            &mut server_hal,
            &mut server_od,
        );
        assert_eq!(resp, b"[1] OK\r\n");
        assert_eq!(server_od.read(0x2100, 0).unwrap().0, ObjectValue::Unsigned16(0x1234));
    }

    #[test]
    fn expedited_read_prints_decoded_value() {
        let mut gw = Gateway::new();
        let mut client_hal = FakeHal { sent: Vec::new() };
        let mut client_od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut client_hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        let mut server_hal = FakeHal { sent: Vec::new() };
        let mut server_od = server_od();
        let mut server: crate::sdo::SdoServer<FakeHal> = crate::sdo::SdoServer::new();
        server.communication_reset(&mut server_hal, 4, 500);

        gw.write(b"[2] 4 read 0x1000 0 x32\n");
        let resp = run_to_completion(
            &mut gw,
            &mut client_hal,
            &mut client_od,
            &mut sdo_client,
            &mut nmt,
            &emcy,
            &led,
            &mut server,
            &mut server_hal,
            &mut server_od,
        );
        assert_eq!(resp, b"[2] 0x00020192\r\n");
    }

    #[test]
    fn write_to_read_only_object_reports_sdo_abort_code() {
        let mut gw = Gateway::new();
        let mut client_hal = FakeHal { sent: Vec::new() };
        let mut client_od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut client_hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        let mut server_hal = FakeHal { sent: Vec::new() };
        let mut server_od = server_od();
        let mut server: crate::sdo::SdoServer<FakeHal> = crate::sdo::SdoServer::new();
        server.communication_reset(&mut server_hal, 4, 500);

        gw.write(b"[3] 4 write 0x1000 0 u32 7\n");
        let resp = run_to_completion(
            &mut gw,
            &mut client_hal,
            &mut client_od,
            &mut sdo_client,
            &mut nmt,
            &emcy,
            &led,
            &mut server,
            &mut server_hal,
            &mut server_od,
        );
        assert_eq!(
            resp,
            b"[3] ERROR:0x06010002 #Attempt to write a read only object.\r\n"
        );
    }

    #[test]
    fn unknown_verb_reports_syntax_error() {
        let mut gw = Gateway::new();
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        gw.write(b"[4] 4 frobnicate\n");
        let mut resp = Vec::new();
        gw.process(true, 0, &mut hal, &mut od, &mut sdo_client, &mut nmt, &emcy, &led, &mut collect(&mut resp));
        assert_eq!(resp, b"[4] ERROR:101 #Syntax error.\r\n");
    }

    #[test]
    fn lss_command_reports_not_supported() {
        let mut gw = Gateway::new();
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        gw.write(b"[5] lss_switch_glob 1\n");
        let mut resp = Vec::new();
        gw.process(true, 0, &mut hal, &mut od, &mut sdo_client, &mut nmt, &emcy, &led, &mut collect(&mut resp));
        assert_eq!(resp, b"[5] ERROR:100 #Request not supported.\r\n");
    }

    #[test]
    fn read_without_default_node_reports_105() {
        let mut gw = Gateway::new();
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        gw.write(b"[6] read 0x1000 0 u32\n");
        let mut resp = Vec::new();
        gw.process(true, 0, &mut hal, &mut od, &mut sdo_client, &mut nmt, &emcy, &led, &mut collect(&mut resp));
        assert_eq!(resp, b"[6] ERROR:105 #No default node set.\r\n");
    }

    #[test]
    fn set_node_then_read_uses_default() {
        let mut gw = Gateway::new();
        let mut client_hal = FakeHal { sent: Vec::new() };
        let mut client_od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut client_hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        let mut server_hal = FakeHal { sent: Vec::new() };
        let mut server_od = server_od();
        let mut server: crate::sdo::SdoServer<FakeHal> = crate::sdo::SdoServer::new();
        server.communication_reset(&mut server_hal, 4, 500);

        gw.write(b"[7] set node 4\n");
        let mut resp = Vec::new();
        gw.process(
            true,
            0,
            &mut client_hal,
            &mut client_od,
            &mut sdo_client,
            &mut nmt,
            &emcy,
            &led,
            &mut collect(&mut resp),
        );
        assert_eq!(resp, b"[7] OK\r\n");

        gw.write(b"[8] read 0x1000 0 x32\n");
        let resp = run_to_completion(
            &mut gw,
            &mut client_hal,
            &mut client_od,
            &mut sdo_client,
            &mut nmt,
            &emcy,
            &led,
            &mut server,
            &mut server_hal,
            &mut server_od,
        );
        assert_eq!(resp, b"[8] 0x00020192\r\n");
    }

    #[test]
    fn led_command_dumps_current_bitfields() {
        let mut gw = Gateway::new();
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        gw.write(b"[9] led\n");
        let mut resp = Vec::new();
        gw.process(true, 0, &mut hal, &mut od, &mut sdo_client, &mut nmt, &emcy, &led, &mut collect(&mut resp));
        assert_eq!(resp, b"[9] red=0x00 green=0x00\r\n");
    }

    #[test]
    fn log_command_reports_none_when_no_pending_emcy() {
        let mut gw = Gateway::new();
        let mut hal = FakeHal { sent: Vec::new() };
        let mut od = ObjectDictionary::new();
        let mut sdo_client: SdoClient<FakeHal> = SdoClient::new(1);
        let mut nmt: Nmt<FakeHal> = Nmt::new(1);
        nmt.communication_reset(&mut hal, 0, false);
        let emcy: Emcy<FakeHal> = Emcy::new(1);
        let led = crate::led::Led::new();

        gw.write(b"[10] log\n");
        let mut resp = Vec::new();
        gw.process(true, 0, &mut hal, &mut od, &mut sdo_client, &mut nmt, &emcy, &led, &mut collect(&mut resp));
        assert_eq!(resp, b"[10] none\r\n");
    }
}
