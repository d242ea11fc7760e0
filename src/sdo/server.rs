//! Per-peer SDO responder state machine (spec.md §4.4 — component H),
//! grounded in `CO_SDO.c/h`.

use super::command::*;
use crate::crc;
use crate::hal::{CanFrame, CanInterface, CanOpenError};
use crate::od::{ExtResult, ObjectDictionary, OdError, SdoAbortCode};
use crate::types::{cob_id, NmtState};
use alloc::vec::Vec;
use log::{trace, warn};

const DEFAULT_TIMEOUT_MS: u32 = 500;
const MAX_BLKSIZE: u8 = 127;

#[derive(Debug, Clone, PartialEq)]
enum ServerState {
    Idle,
    DownloadSegmented {
        index: u16,
        sub_index: u8,
        toggle: bool,
        buffer: Vec<u8>,
    },
    UploadSegmented {
        index: u16,
        sub_index: u8,
        toggle: bool,
        data: Vec<u8>,
        offset: usize,
    },
    DownloadBlockSub {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        seqno_expected: u8,
        buffer: Vec<u8>,
        crc_acc: u16,
    },
    DownloadBlockEnd {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        buffer: Vec<u8>,
        crc_acc: u16,
    },
    UploadBlockSub {
        crc_enabled: bool,
        data: Vec<u8>,
        offset: usize,
        blksize: u8,
        seqno: u8,
    },
    UploadBlockEnd {
        crc: u16,
        no_data: u8,
    },
}

/// Serves one CAN-ID pair (client->server rx / server->client tx). Listens
/// only while the NMT state is pre-operational or operational.
pub struct SdoServer<H: CanInterface> {
    rx_cob_id: u16,
    tx_cob_id: u16,
    tx_handle: Option<H::TxHandle>,
    state: ServerState,
    timeout_ms: u32,
    elapsed_ms: u32,
}

impl<H: CanInterface> SdoServer<H> {
    pub fn new() -> Self {
        Self {
            rx_cob_id: 0,
            tx_cob_id: 0,
            tx_handle: None,
            state: ServerState::Idle,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            elapsed_ms: 0,
        }
    }

    pub fn communication_reset(&mut self, hal: &mut H, node_id: u8, timeout_ms: u32) {
        self.rx_cob_id = cob_id::SDO_SERVER_RX_BASE + node_id as u16;
        self.tx_cob_id = cob_id::SDO_SERVER_TX_BASE + node_id as u16;
        hal.filter_install(self.rx_cob_id);
        self.tx_handle = Some(hal.tx_buffer_init(self.tx_cob_id));
        self.state = ServerState::Idle;
        self.timeout_ms = timeout_ms;
        self.elapsed_ms = 0;
    }

    pub fn rx_cob_id(&self) -> u16 {
        self.rx_cob_id
    }

    fn send(&self, hal: &mut H, data: &[u8]) -> Result<(), CanOpenError> {
        let handle = self
            .tx_handle
            .ok_or(CanOpenError::InternalError("SDO server not communication-reset"))?;
        hal.send(handle, &CanFrame::new(self.tx_cob_id, data))
    }

    fn abort(&mut self, hal: &mut H, index: u16, sub_index: u8, code: SdoAbortCode) -> Result<(), CanOpenError> {
        warn!("SDO server abort {:#06x}:{:02x} {}", index, sub_index, code);
        let mut frame = [0u8; 8];
        frame[0] = cs::ABORT;
        frame[1..3].copy_from_slice(&index.to_le_bytes());
        frame[3] = sub_index;
        frame[4..8].copy_from_slice(&code.wire_bytes());
        self.state = ServerState::Idle;
        self.elapsed_ms = 0;
        self.send(hal, &frame)
    }

    /// Consumes the latched receive frame (if any), advances the timeout
    /// timer by `dt_ms`, and runs one state-machine step (spec.md §4.4).
    pub fn process(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        nmt_state: NmtState,
        dt_ms: u32,
        rx_frame: Option<&CanFrame>,
    ) -> Result<(), CanOpenError> {
        if !matches!(nmt_state, NmtState::PreOperational | NmtState::Operational) {
            return Ok(());
        }

        if !matches!(self.state, ServerState::Idle) {
            self.elapsed_ms = self.elapsed_ms.saturating_add(dt_ms);
            if self.elapsed_ms >= self.timeout_ms {
                let (index, sub_index) = self.current_target();
                return self.abort(hal, index, sub_index, SdoAbortCode::SdoProtocolTimedOut);
            }
        }

        let Some(frame) = rx_frame else {
            return Ok(());
        };
        if frame.cob_id != self.rx_cob_id {
            return Ok(());
        }
        self.elapsed_ms = 0;
        self.on_frame(hal, od, frame)
    }

    fn current_target(&self) -> (u16, u8) {
        match &self.state {
            ServerState::DownloadSegmented { index, sub_index, .. }
            | ServerState::UploadSegmented { index, sub_index, .. }
            | ServerState::DownloadBlockSub { index, sub_index, .. }
            | ServerState::DownloadBlockEnd { index, sub_index, .. } => (*index, *sub_index),
            _ => (0, 0),
        }
    }

    fn on_frame(&mut self, hal: &mut H, od: &mut ObjectDictionary, frame: &CanFrame) -> Result<(), CanOpenError> {
        let data = frame.payload();
        if data.is_empty() {
            return Ok(());
        }
        let cmd = data[0];

        match core::mem::replace(&mut self.state, ServerState::Idle) {
            ServerState::Idle => self.on_idle(hal, od, cmd, data),
            ServerState::DownloadSegmented { index, sub_index, toggle, buffer } => {
                self.on_download_segment(hal, od, cmd, data, index, sub_index, toggle, buffer)
            }
            ServerState::UploadSegmented { index, sub_index, toggle, data: payload, offset } => {
                self.on_upload_segment_ack(hal, cmd, index, sub_index, toggle, payload, offset)
            }
            ServerState::DownloadBlockSub {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno_expected,
                buffer,
                crc_acc,
            } => self.on_download_block_segment(
                hal, cmd, data, index, sub_index, crc_enabled, blksize, seqno_expected, buffer, crc_acc,
            ),
            ServerState::DownloadBlockEnd { index, sub_index, crc_enabled, buffer, crc_acc } => {
                self.on_download_block_end(hal, od, cmd, data, index, sub_index, crc_enabled, buffer, crc_acc)
            }
            ServerState::UploadBlockSub { crc_enabled, data: payload, offset, blksize, seqno } => {
                self.on_upload_block_ack(hal, cmd, data, crc_enabled, payload, offset, blksize, seqno)
            }
            ServerState::UploadBlockEnd { .. } => Ok(()),
        }
    }

    fn on_idle(&mut self, hal: &mut H, od: &mut ObjectDictionary, cmd: u8, data: &[u8]) -> Result<(), CanOpenError> {
        let index = u16::from_le_bytes([data[1], data[2]]);
        let sub_index = data[3];
        let top = cmd & 0xE0;

        match top {
            cs::INITIATE_DOWNLOAD => {
                let (expedited, size_indicated, unused_bytes) = parse_download_initiate_req(cmd);
                if expedited {
                    let len = if size_indicated { 4 - unused_bytes as usize } else { 4 };
                    match od.write(index, sub_index, &data[4..4 + len.min(4)]) {
                        Ok(_) => {
                            let mut rsp = [0u8; 8];
                            rsp[0] = DOWNLOAD_INITIATE_RSP;
                            rsp[1..3].copy_from_slice(&index.to_le_bytes());
                            rsp[3] = sub_index;
                            self.send(hal, &rsp)
                        }
                        Err(e) => self.abort(hal, index, sub_index, e.into()),
                    }
                } else {
                    let mut rsp = [0u8; 8];
                    rsp[0] = DOWNLOAD_INITIATE_RSP;
                    rsp[1..3].copy_from_slice(&index.to_le_bytes());
                    rsp[3] = sub_index;
                    self.send(hal, &rsp)?;
                    self.state = ServerState::DownloadSegmented {
                        index,
                        sub_index,
                        toggle: false,
                        buffer: Vec::new(),
                    };
                    Ok(())
                }
            }
            cs::INITIATE_UPLOAD => {
                match od.read(index, sub_index) {
                    Ok((value, _)) => {
                        let bytes = value.serialize();
                        if bytes.len() <= 4 {
                            let unused = 4 - bytes.len();
                            let mut rsp = [0u8; 8];
                            rsp[0] = upload_initiate_rsp(true, true, unused as u8);
                            rsp[1..3].copy_from_slice(&index.to_le_bytes());
                            rsp[3] = sub_index;
                            rsp[4..4 + bytes.len()].copy_from_slice(&bytes);
                            self.send(hal, &rsp)
                        } else {
                            let mut rsp = [0u8; 8];
                            rsp[0] = upload_initiate_rsp(false, true, 0);
                            rsp[1..3].copy_from_slice(&index.to_le_bytes());
                            rsp[3] = sub_index;
                            rsp[4..8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                            self.send(hal, &rsp)?;
                            self.state = ServerState::UploadSegmented {
                                index,
                                sub_index,
                                toggle: false,
                                data: bytes,
                                offset: 0,
                            };
                            Ok(())
                        }
                    }
                    Err(e) => self.abort(hal, index, sub_index, e.into()),
                }
            }
            cs::BLOCK_DOWNLOAD if cmd & 0x01 == 0 => {
                let (crc_enabled, _size_indicated) = parse_block_download_initiate_req(cmd);
                let blksize = MAX_BLKSIZE;
                let [b0, b1] = block_download_initiate_rsp(true, blksize);
                let mut rsp = [0u8; 8];
                rsp[0] = b0;
                rsp[1..3].copy_from_slice(&index.to_le_bytes());
                rsp[3] = sub_index;
                rsp[4] = b1;
                self.send(hal, &rsp)?;
                self.state = ServerState::DownloadBlockSub {
                    index,
                    sub_index,
                    crc_enabled,
                    blksize,
                    seqno_expected: 1,
                    buffer: Vec::new(),
                    crc_acc: 0,
                };
                Ok(())
            }
            cs::BLOCK_UPLOAD if cmd & 0x01 == 0 => {
                match od.read(index, sub_index) {
                    Ok((value, _)) => {
                        let bytes = value.serialize();
                        let blksize = MAX_BLKSIZE;
                        let mut rsp = [0u8; 8];
                        rsp[0] = cs::BLOCK_UPLOAD | 0x01; // crc-supported, size indicated
                        rsp[1..3].copy_from_slice(&index.to_le_bytes());
                        rsp[3] = sub_index;
                        rsp[4..8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                        self.send(hal, &rsp)?;
                        self.state = ServerState::UploadBlockSub {
                            crc_enabled: true,
                            data: bytes,
                            offset: 0,
                            blksize,
                            seqno: 0,
                        };
                        Ok(())
                    }
                    Err(e) => self.abort(hal, index, sub_index, e.into()),
                }
            }
            _ => self.abort(hal, index, sub_index, SdoAbortCode::CommandSpecifierUnknown),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_download_segment(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        cmd: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        toggle: bool,
        mut buffer: Vec<u8>,
    ) -> Result<(), CanOpenError> {
        let (recv_toggle, unused_bytes, last) = parse_download_segment_req(cmd);
        if recv_toggle != toggle {
            return self.abort(hal, index, sub_index, SdoAbortCode::ToggleBitNotAlternated);
        }
        let len = 7 - unused_bytes as usize;
        buffer.extend_from_slice(&data[1..1 + len]);

        let mut rsp = [0u8; 8];
        rsp[0] = download_segment_rsp(toggle);
        self.send(hal, &rsp)?;

        if last {
            match od.write(index, sub_index, &buffer) {
                Ok(_) => {
                    self.state = ServerState::Idle;
                    Ok(())
                }
                Err(e) => self.abort(hal, index, sub_index, e.into()),
            }
        } else {
            self.state = ServerState::DownloadSegmented {
                index,
                sub_index,
                toggle: !toggle,
                buffer,
            };
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_upload_segment_ack(
        &mut self,
        hal: &mut H,
        cmd: u8,
        index: u16,
        sub_index: u8,
        toggle: bool,
        data: Vec<u8>,
        offset: usize,
    ) -> Result<(), CanOpenError> {
        let recv_toggle = parse_upload_segment_req(cmd);
        if recv_toggle != toggle {
            return self.abort(hal, index, sub_index, SdoAbortCode::ToggleBitNotAlternated);
        }
        let remaining = data.len() - offset;
        let len = remaining.min(7);
        let last = remaining <= 7;

        let mut rsp = [0u8; 8];
        rsp[0] = upload_segment_rsp(toggle, (7 - len) as u8, last);
        rsp[1..1 + len].copy_from_slice(&data[offset..offset + len]);
        self.send(hal, &rsp)?;

        if last {
            self.state = ServerState::Idle;
        } else {
            self.state = ServerState::UploadSegmented {
                index,
                sub_index,
                toggle: !toggle,
                data,
                offset: offset + len,
            };
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_download_block_segment(
        &mut self,
        hal: &mut H,
        cmd: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        seqno_expected: u8,
        mut buffer: Vec<u8>,
        mut crc_acc: u16,
    ) -> Result<(), CanOpenError> {
        let (seqno, last) = parse_block_segment_header(cmd);
        if seqno != seqno_expected {
            // Sequence error: ack what we have and let the client re-window.
            return self.send_block_download_ack(hal, index, sub_index, crc_enabled, seqno_expected.wrapping_sub(1), blksize, buffer, crc_acc, false);
        }
        if crc_enabled {
            crc_acc = crc::update(crc_acc, &data[1..8]);
        }
        buffer.extend_from_slice(&data[1..8]);

        if last || seqno == blksize {
            self.send_block_download_ack(hal, index, sub_index, crc_enabled, seqno, blksize, buffer, crc_acc, last)
        } else {
            self.state = ServerState::DownloadBlockSub {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno_expected: seqno + 1,
                buffer,
                crc_acc,
            };
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_block_download_ack(
        &mut self,
        hal: &mut H,
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        last_good_seqno: u8,
        blksize: u8,
        buffer: Vec<u8>,
        crc_acc: u16,
        sub_block_ended: bool,
    ) -> Result<(), CanOpenError> {
        let mut rsp = [0u8; 8];
        rsp[0] = BLOCK_ACK_CMD;
        rsp[1] = last_good_seqno;
        rsp[2] = blksize;
        self.send(hal, &rsp)?;

        if sub_block_ended {
            self.state = ServerState::DownloadBlockEnd {
                index,
                sub_index,
                crc_enabled,
                buffer,
                crc_acc,
            };
        } else {
            self.state = ServerState::DownloadBlockSub {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno_expected: 1,
                buffer,
                crc_acc,
            };
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_download_block_end(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        cmd: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        mut buffer: Vec<u8>,
        crc_acc: u16,
    ) -> Result<(), CanOpenError> {
        if cmd & 0xE3 != 0xC1 {
            return self.abort(hal, index, sub_index, SdoAbortCode::CommandSpecifierUnknown);
        }
        let no_data = parse_block_end_req(cmd);
        buffer.truncate(buffer.len() - no_data as usize);
        let received_crc = u16::from_le_bytes([data[1], data[2]]);

        if crc_enabled && received_crc != crc_acc {
            return self.abort(hal, index, sub_index, SdoAbortCode::CrcError);
        }

        match od.write(index, sub_index, &buffer) {
            Ok(_) => {
                let rsp = [BLOCK_END_RSP, 0, 0, 0, 0, 0, 0, 0];
                self.send(hal, &rsp)?;
                self.state = ServerState::Idle;
                Ok(())
            }
            Err(e) => self.abort(hal, index, sub_index, e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_upload_block_ack(
        &mut self,
        hal: &mut H,
        cmd: u8,
        data: &[u8],
        crc_enabled: bool,
        payload: Vec<u8>,
        offset: usize,
        _blksize_unused: u8,
        _seqno_unused: u8,
    ) -> Result<(), CanOpenError> {
        if cmd != BLOCK_ACK_CMD {
            return Ok(());
        }
        let ackseq = data[1];
        let next_blksize = data[2].clamp(1, MAX_BLKSIZE);

        // Rewind to the first unacknowledged byte: ackseq segments of 7
        // bytes each were confirmed good.
        let acked_bytes = (ackseq as usize) * 7;
        let offset = acked_bytes.min(offset);

        self.emit_upload_sub_block(hal, crc_enabled, payload, offset, next_blksize, 1)
    }

    fn emit_upload_sub_block(
        &mut self,
        hal: &mut H,
        crc_enabled: bool,
        data: Vec<u8>,
        mut offset: usize,
        blksize: u8,
        mut seqno: u8,
    ) -> Result<(), CanOpenError> {
        loop {
            let remaining = data.len() - offset;
            let last = remaining <= 7;
            let chunk_len = remaining.min(7);
            let mut frame = [0u8; 8];
            frame[0] = block_segment_header(seqno, last);
            frame[1..1 + chunk_len].copy_from_slice(&data[offset..offset + chunk_len]);
            self.send(hal, &frame)?;
            offset += chunk_len;

            if last {
                let crc = if crc_enabled { crc::compute(&data) } else { 0 };
                let no_data = (7 - chunk_len) as u8;
                let mut end = [0u8; 8];
                end[0] = block_end_req(no_data);
                end[1..3].copy_from_slice(&crc.to_le_bytes());
                self.send(hal, &end)?;
                self.state = ServerState::UploadBlockEnd { crc, no_data };
                return Ok(());
            }
            if seqno == blksize {
                self.state = ServerState::UploadBlockSub {
                    crc_enabled,
                    data,
                    offset,
                    blksize,
                    seqno,
                };
                return Ok(());
            }
            seqno += 1;
        }
    }
}

impl<H: CanInterface> Default for SdoServer<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Attributes, ObjectEntry, ObjectValue};
    use alloc::vec::Vec as AVec;

    struct FakeHal {
        sent: AVec<CanFrame>,
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

    fn setup() -> (SdoServer<FakeHal>, FakeHal, ObjectDictionary) {
        let mut server = SdoServer::new();
        let mut hal = FakeHal { sent: AVec::new() };
        server.communication_reset(&mut hal, 4, 500);
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(0x2100, Attributes::read_write(), ObjectValue::Unsigned16(0)));
        od.insert(ObjectEntry::variable(0x1000, Attributes::read_only(), ObjectValue::Unsigned32(0x0002_0192)));
        od.insert(ObjectEntry::variable(0x2200, Attributes::read_write(), ObjectValue::VisibleString(alloc::string::String::new())));
        (server, hal, od)
    }

    #[test]
    fn expedited_download_matches_seed_scenario() {
        let (mut server, mut hal, mut od) = setup();
        let req = CanFrame::new(0x604, &[0x22, 0x00, 0x21, 0x00, 0x34, 0x12, 0x00, 0x00]);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&req)).unwrap();
        assert_eq!(hal.sent[0].data, [0x60, 0x00, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let (value, _) = od.read(0x2100, 0).unwrap();
        assert_eq!(value, ObjectValue::Unsigned16(0x1234));
    }

    #[test]
    fn expedited_upload_matches_seed_scenario() {
        let (mut server, mut hal, mut od) = setup();
        let req = CanFrame::new(0x604, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&req)).unwrap();
        assert_eq!(hal.sent[0].data, [0x43, 0x00, 0x10, 0x00, 0x92, 0x01, 0x02, 0x00]);
    }

    #[test]
    fn write_to_read_only_aborts_with_documented_code() {
        let (mut server, mut hal, mut od) = setup();
        let req = CanFrame::new(0x604, &[0x23, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&req)).unwrap();
        assert_eq!(hal.sent[0].data[0], cs::ABORT);
        let code = u32::from_le_bytes(hal.sent[0].data[4..8].try_into().unwrap());
        assert_eq!(code, SdoAbortCode::AttemptToWriteReadOnly.code());
    }

    #[test]
    fn segmented_download_assembles_full_string() {
        let (mut server, mut hal, mut od) = setup();
        let init = CanFrame::new(0x604, &[0x21, 0x00, 0x22, 0x00, 11, 0, 0, 0]);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&init)).unwrap();

        let seg1 = CanFrame::new(0x604, &[0x00, b'h', b'e', b'l', b'l', b'o', b' ', b'w']);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&seg1)).unwrap();

        let seg2 = CanFrame::new(0x604, &[0x1D, b'o', b'r', b'l', b'd', 0, 0, 0]);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&seg2)).unwrap();

        let (value, _) = od.read(0x2200, 0).unwrap();
        assert_eq!(value, ObjectValue::VisibleString("hello world".into()));
    }

    #[test]
    fn timeout_mid_transfer_sends_timeout_abort() {
        let (mut server, mut hal, mut od) = setup();
        let init = CanFrame::new(0x604, &[0x21, 0x00, 0x22, 0x00, 11, 0, 0, 0]);
        server.process(&mut hal, &mut od, NmtState::Operational, 0, Some(&init)).unwrap();
        server.process(&mut hal, &mut od, NmtState::Operational, 600, None).unwrap();
        let abort_frame = hal.sent.last().unwrap();
        assert_eq!(abort_frame.data[0], cs::ABORT);
        let code = u32::from_le_bytes(abort_frame.data[4..8].try_into().unwrap());
        assert_eq!(code, SdoAbortCode::SdoProtocolTimedOut.code());
    }

    #[test]
    fn silent_while_nmt_is_initializing() {
        let (mut server, mut hal, mut od) = setup();
        let req = CanFrame::new(0x604, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
        server.process(&mut hal, &mut od, NmtState::Initializing, 0, Some(&req)).unwrap();
        assert!(hal.sent.is_empty());
    }
}
