//! Per-peer SDO initiator state machine (spec.md §4.5 — component I),
//! grounded in `CO_SDOclient.c/h` and mirroring [`super::server::SdoServer`]
//! with the roles reversed.
//!
//! Download/upload payloads do not travel as a single in-memory buffer:
//! the caller (typically the gateway, spec.md §4.10) streams bytes into
//! [`SdoClient::download_fifo_mut`] as they become available and drains
//! [`SdoClient::upload_fifo_mut`] as they arrive, exactly as the FIFO
//! abstraction (component C) is shared between the two protocols.

use super::command::*;
use crate::crc;
use crate::fifo::Fifo;
use crate::hal::{CanFrame, CanInterface, CanOpenError};
use crate::od::{ExtResult, ObjectDictionary, SdoAbortCode};
use crate::types::cob_id;
use log::warn;

const DEFAULT_TIMEOUT_MS: u32 = 500;
const DEFAULT_PST: usize = 21;
const MAX_BLKSIZE: u8 = 127;
const FIFO_CAPACITY: usize = 1024;

/// Non-terminal and terminal outcomes of [`SdoClient::process`] (spec.md
/// §4.5 "Flow control return codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoClientReturn {
    Idle,
    WaitingResponse,
    BlockDownloadInProgress,
    BlockUploadInProgress,
    UploadDataBufferFull,
    TransmitBufferFull,
    WaitingLocalTransfer,
    /// `ok_communicationEnd`: the transfer finished successfully.
    Ok,
}

/// Terminal failure outcomes (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoClientError {
    WrongArguments,
    EndedWithTimeout,
    EndedWithClientAbort,
    EndedWithServerAbort(SdoAbortCode),
}

impl From<SdoClientError> for CanOpenError {
    fn from(err: SdoClientError) -> Self {
        match err {
            SdoClientError::WrongArguments => CanOpenError::WrongArguments,
            SdoClientError::EndedWithTimeout => CanOpenError::InternalError("SDO client timeout"),
            SdoClientError::EndedWithClientAbort => {
                CanOpenError::InternalError("SDO client abort")
            }
            SdoClientError::EndedWithServerAbort(code) => CanOpenError::SdoAborted(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClientState {
    Idle,
    DownloadExpeditedWait {
        index: u16,
        sub_index: u8,
    },
    DownloadSegmentInitWait {
        index: u16,
        sub_index: u8,
    },
    DownloadSegmentWait {
        index: u16,
        sub_index: u8,
        toggle: bool,
        last_sent: bool,
    },
    DownloadBlockInitWait {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
    },
    DownloadBlockSending {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        seqno: u8,
        crc_acc: u16,
    },
    DownloadBlockAckWait {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        crc_acc: u16,
    },
    DownloadBlockEndWait {
        index: u16,
        sub_index: u8,
    },
    UploadInitiateWait {
        index: u16,
        sub_index: u8,
    },
    UploadSegmentWait {
        index: u16,
        sub_index: u8,
        toggle: bool,
    },
    UploadBlockInitWait {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
    },
    UploadBlockSubRecv {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        seqno_expected: u8,
        last_good: u8,
        crc_acc: u16,
        pending_last: Option<([u8; 7], u8)>,
    },
    UploadBlockEndWait {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        crc_acc: u16,
        pending_last: Option<([u8; 7], u8)>,
    },
    DownloadLocal {
        index: u16,
        sub_index: u8,
    },
    UploadLocal {
        index: u16,
        sub_index: u8,
    },
}

/// Drives one SDO conversation as the initiator. Download source bytes and
/// upload destination bytes flow through the two internal FIFOs rather
/// than a single owned buffer (spec.md §4.5).
pub struct SdoClient<H: CanInterface> {
    node_id: u8,
    target_node_id: u8,
    rx_cob_id: u16,
    tx_cob_id: u16,
    tx_handle: Option<H::TxHandle>,
    state: ClientState,
    timeout_ms: u32,
    elapsed_ms: u32,
    sub_block_timeout_ms: u32,
    sub_elapsed_ms: u32,
    pst: usize,
    download_complete: bool,
    download_fifo: Fifo,
    upload_fifo: Fifo,
}

impl<H: CanInterface> SdoClient<H> {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            target_node_id: 0,
            rx_cob_id: 0,
            tx_cob_id: 0,
            tx_handle: None,
            state: ClientState::Idle,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            elapsed_ms: 0,
            sub_block_timeout_ms: DEFAULT_TIMEOUT_MS / 2,
            sub_elapsed_ms: 0,
            pst: DEFAULT_PST,
            download_complete: false,
            download_fifo: Fifo::new(FIFO_CAPACITY),
            upload_fifo: Fifo::new(FIFO_CAPACITY),
        }
    }

    pub fn communication_reset(&mut self, hal: &mut H, target_node_id: u8, timeout_ms: u32) {
        self.target_node_id = target_node_id;
        self.rx_cob_id = cob_id::SDO_SERVER_TX_BASE + target_node_id as u16;
        self.tx_cob_id = cob_id::SDO_SERVER_RX_BASE + target_node_id as u16;
        hal.filter_install(self.rx_cob_id);
        self.tx_handle = Some(hal.tx_buffer_init(self.tx_cob_id));
        self.state = ClientState::Idle;
        self.timeout_ms = timeout_ms;
        self.sub_block_timeout_ms = timeout_ms / 2;
        self.elapsed_ms = 0;
        self.sub_elapsed_ms = 0;
        self.download_fifo.reset();
        self.upload_fifo.reset();
        self.download_complete = false;
    }

    pub fn set_pst(&mut self, pst: usize) {
        self.pst = pst;
    }

    /// The COB-ID this client listens on (server -> client direction of
    /// whichever peer it is currently bound to).
    pub fn rx_cob_id(&self) -> u16 {
        self.rx_cob_id
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ClientState::Idle)
    }

    /// Source bytes for an in-progress or about-to-start download. The
    /// caller writes data here, then calls [`Self::mark_download_complete`]
    /// once no more bytes are coming (spec.md §4.10: data is pulled from
    /// `commFifo` through the scanner directly into the SDO client's FIFO).
    pub fn download_fifo_mut(&mut self) -> &mut Fifo {
        &mut self.download_fifo
    }

    /// Signals that no further bytes will be written to the download FIFO;
    /// the state machine treats the FIFO draining empty as end-of-transfer.
    pub fn mark_download_complete(&mut self) {
        self.download_complete = true;
    }

    /// Destination bytes for an in-progress or finished upload, drained by
    /// the caller through a datatype printer (spec.md §4.10).
    pub fn upload_fifo_mut(&mut self) -> &mut Fifo {
        &mut self.upload_fifo
    }

    fn send(&self, hal: &mut H, data: &[u8]) -> Result<(), CanOpenError> {
        let handle = self
            .tx_handle
            .ok_or(CanOpenError::InternalError("SDO client not communication-reset"))?;
        hal.send(handle, &CanFrame::new(self.tx_cob_id, data))
    }

    fn is_local(&self) -> bool {
        self.target_node_id == self.node_id
    }

    /// Starts a download (spec.md §4.5 "Protocol selection"). Bytes must
    /// already be queued (or queued incrementally, draining as segments go
    /// out) in [`Self::download_fifo_mut`]; `size_indicated` is an
    /// optional declared total used to choose the sub-protocol.
    pub fn download_start(
        &mut self,
        hal: &mut H,
        index: u16,
        sub_index: u8,
        size_indicated: Option<usize>,
        block_enable: bool,
    ) -> Result<SdoClientReturn, SdoClientError> {
        if !self.is_idle() {
            // Documented bug-fix (spec.md Design Notes §9, "Open questions"):
            // clear to Idle before returning the argument error, not after.
            self.state = ClientState::Idle;
            return Err(SdoClientError::WrongArguments);
        }
        self.elapsed_ms = 0;
        self.sub_elapsed_ms = 0;

        if self.is_local() {
            self.state = ClientState::DownloadLocal { index, sub_index };
            return Ok(SdoClientReturn::WaitingLocalTransfer);
        }

        let attempt_block =
            block_enable && (size_indicated.is_none() || size_indicated.unwrap() > self.pst);

        if attempt_block {
            let mut req = [0u8; 8];
            req[0] = block_download_initiate_req(true, size_indicated.is_some());
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            if let Some(size) = size_indicated {
                req[4..8].copy_from_slice(&(size as u32).to_le_bytes());
            }
            self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.state = ClientState::DownloadBlockInitWait {
                index,
                sub_index,
                crc_enabled: true,
            };
            return Ok(SdoClientReturn::WaitingResponse);
        }

        if size_indicated.map_or(false, |s| s <= 4) {
            let mut bytes = [0u8; 4];
            let n = self.download_fifo.read(&mut bytes, None);
            let mut req = [0u8; 8];
            req[0] = download_initiate_req(true, true, (4 - n) as u8);
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            req[4..4 + n].copy_from_slice(&bytes[..n]);
            self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.state = ClientState::DownloadExpeditedWait { index, sub_index };
        } else {
            let mut req = [0u8; 8];
            req[0] = download_initiate_req(false, size_indicated.is_some(), 0);
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            if let Some(size) = size_indicated {
                req[4..8].copy_from_slice(&(size as u32).to_le_bytes());
            }
            self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.state = ClientState::DownloadSegmentInitWait { index, sub_index };
        }
        Ok(SdoClientReturn::WaitingResponse)
    }

    /// Starts an upload (spec.md §4.5). Received bytes accumulate in
    /// [`Self::upload_fifo_mut`].
    pub fn upload_start(
        &mut self,
        hal: &mut H,
        index: u16,
        sub_index: u8,
        block_enable: bool,
    ) -> Result<SdoClientReturn, SdoClientError> {
        if !self.is_idle() {
            self.state = ClientState::Idle;
            return Err(SdoClientError::WrongArguments);
        }
        self.elapsed_ms = 0;
        self.sub_elapsed_ms = 0;

        if self.is_local() {
            self.state = ClientState::UploadLocal { index, sub_index };
            return Ok(SdoClientReturn::WaitingLocalTransfer);
        }

        if block_enable {
            let mut req = [0u8; 8];
            req[0] = block_upload_initiate_req(true);
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            req[4] = MAX_BLKSIZE;
            req[5] = self.pst.min(255) as u8;
            self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.state = ClientState::UploadBlockInitWait {
                index,
                sub_index,
                crc_enabled: true,
            };
        } else {
            let mut req = [0u8; 8];
            req[0] = UPLOAD_INITIATE_REQ;
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.state = ClientState::UploadInitiateWait { index, sub_index };
        }
        Ok(SdoClientReturn::WaitingResponse)
    }

    /// Aborts the current transfer immediately (spec.md §5 "Cancellation /
    /// timeout": callers abort by calling `download(abort=true)` /
    /// `upload(abort=true)` on the next tick).
    pub fn abort(&mut self, hal: &mut H) -> Result<(), CanOpenError> {
        if let Some((index, sub_index)) = self.current_target() {
            let mut frame = [0u8; 8];
            frame[0] = cs::ABORT;
            frame[1..3].copy_from_slice(&index.to_le_bytes());
            frame[3] = sub_index;
            frame[4..8].copy_from_slice(&SdoAbortCode::GeneralError.wire_bytes());
            self.send(hal, &frame)?;
        }
        self.state = ClientState::Idle;
        Ok(())
    }

    fn current_target(&self) -> Option<(u16, u8)> {
        match self.state {
            ClientState::DownloadExpeditedWait { index, sub_index }
            | ClientState::DownloadSegmentInitWait { index, sub_index }
            | ClientState::DownloadSegmentWait { index, sub_index, .. }
            | ClientState::DownloadBlockInitWait { index, sub_index, .. }
            | ClientState::DownloadBlockSending { index, sub_index, .. }
            | ClientState::DownloadBlockAckWait { index, sub_index, .. }
            | ClientState::DownloadBlockEndWait { index, sub_index }
            | ClientState::UploadInitiateWait { index, sub_index }
            | ClientState::UploadSegmentWait { index, sub_index, .. }
            | ClientState::UploadBlockInitWait { index, sub_index, .. }
            | ClientState::UploadBlockSubRecv { index, sub_index, .. }
            | ClientState::UploadBlockEndWait { index, sub_index, .. } => Some((index, sub_index)),
            ClientState::DownloadLocal { .. } | ClientState::UploadLocal { .. } | ClientState::Idle => None,
        }
    }

    /// Runs one state-machine step: advances timers, processes a latched
    /// received frame (if any), and drives local-transfer/block-sending
    /// progress that isn't gated on wire traffic (spec.md §4.5).
    pub fn process(
        &mut self,
        hal: &mut H,
        od: &mut ObjectDictionary,
        dt_ms: u32,
        rx_frame: Option<&CanFrame>,
    ) -> Result<SdoClientReturn, SdoClientError> {
        match core::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Idle => Ok(SdoClientReturn::Idle),
            ClientState::DownloadLocal { index, sub_index } => {
                self.step_download_local(od, index, sub_index)
            }
            ClientState::UploadLocal { index, sub_index } => {
                self.step_upload_local(od, index, sub_index)
            }
            ClientState::DownloadBlockSending {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno,
                crc_acc,
            } => self.step_download_block_send(hal, index, sub_index, crc_enabled, blksize, seqno, crc_acc),
            other => {
                self.state = other;
                self.elapsed_ms = self.elapsed_ms.saturating_add(dt_ms);
                if matches!(self.state, ClientState::UploadBlockSubRecv { .. }) {
                    self.sub_elapsed_ms = self.sub_elapsed_ms.saturating_add(dt_ms);
                    if self.sub_elapsed_ms >= self.sub_block_timeout_ms {
                        return self.close_upload_sub_block_on_timeout(hal);
                    }
                }
                if self.elapsed_ms >= self.timeout_ms {
                    self.state = ClientState::Idle;
                    warn!("SDO client transfer timed out");
                    return Err(SdoClientError::EndedWithTimeout);
                }
                let Some(frame) = rx_frame else {
                    return Ok(self.waiting_return());
                };
                if frame.cob_id != self.rx_cob_id {
                    return Ok(self.waiting_return());
                }
                self.elapsed_ms = 0;
                self.sub_elapsed_ms = 0;
                self.on_frame(hal, frame)
            }
        }
    }

    fn waiting_return(&self) -> SdoClientReturn {
        match self.state {
            ClientState::DownloadBlockInitWait { .. }
            | ClientState::DownloadBlockAckWait { .. }
            | ClientState::DownloadBlockEndWait { .. } => SdoClientReturn::BlockDownloadInProgress,
            ClientState::UploadBlockInitWait { .. }
            | ClientState::UploadBlockSubRecv { .. }
            | ClientState::UploadBlockEndWait { .. } => SdoClientReturn::BlockUploadInProgress,
            _ => SdoClientReturn::WaitingResponse,
        }
    }

    fn on_frame(&mut self, hal: &mut H, frame: &CanFrame) -> Result<SdoClientReturn, SdoClientError> {
        let data = frame.payload();
        if data.is_empty() {
            return Ok(self.waiting_return());
        }
        let cmd = data[0];

        if cmd == cs::ABORT {
            let code_bytes: [u8; 4] = data[4..8].try_into().unwrap_or([0; 4]);
            let code = u32::from_le_bytes(code_bytes);
            self.state = ClientState::Idle;
            let abort_code = abort_code_from_wire(code);
            warn!("SDO client received server abort {:#010x}", code);
            return Err(SdoClientError::EndedWithServerAbort(abort_code));
        }

        match core::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::DownloadExpeditedWait { .. } => {
                if cmd == DOWNLOAD_INITIATE_RSP {
                    Ok(SdoClientReturn::Ok)
                } else {
                    Err(SdoClientError::EndedWithClientAbort)
                }
            }
            ClientState::DownloadSegmentInitWait { index, sub_index } => {
                if cmd != DOWNLOAD_INITIATE_RSP {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                self.send_next_download_segment(hal, index, sub_index, None)
            }
            ClientState::DownloadSegmentWait {
                index,
                sub_index,
                toggle,
                last_sent,
            } => {
                if cmd != download_segment_rsp(toggle) {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                if last_sent {
                    Ok(SdoClientReturn::Ok)
                } else {
                    self.send_next_download_segment(hal, index, sub_index, Some(toggle))
                }
            }
            ClientState::DownloadBlockInitWait { index, sub_index, crc_enabled } => {
                if cmd & 0xE0 != cs::BLOCK_UPLOAD {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                let blksize = data[4].clamp(1, MAX_BLKSIZE);
                self.state = ClientState::DownloadBlockSending {
                    index,
                    sub_index,
                    crc_enabled,
                    blksize,
                    seqno: 1,
                    crc_acc: 0,
                };
                Ok(SdoClientReturn::BlockDownloadInProgress)
            }
            ClientState::DownloadBlockAckWait { index, sub_index, crc_enabled, blksize: _, crc_acc } => {
                if cmd != BLOCK_ACK_CMD {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                let next_blksize = data[2].clamp(1, MAX_BLKSIZE);
                self.state = ClientState::DownloadBlockSending {
                    index,
                    sub_index,
                    crc_enabled,
                    blksize: next_blksize,
                    seqno: 1,
                    crc_acc,
                };
                Ok(SdoClientReturn::BlockDownloadInProgress)
            }
            ClientState::DownloadBlockEndWait { .. } => {
                if cmd != BLOCK_END_RSP {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                Ok(SdoClientReturn::Ok)
            }
            ClientState::UploadInitiateWait { index, sub_index } => {
                let (expedited, _size_indicated, unused_bytes) = parse_upload_initiate_rsp(cmd);
                if expedited {
                    let len = 4 - unused_bytes as usize;
                    self.upload_fifo.write(&data[4..4 + len], None);
                    Ok(SdoClientReturn::Ok)
                } else {
                    self.state = ClientState::UploadSegmentWait {
                        index,
                        sub_index,
                        toggle: false,
                    };
                    self.send_upload_segment_req(hal, false)
                }
            }
            ClientState::UploadSegmentWait { index, sub_index, toggle } => {
                let (recv_toggle, unused_bytes, last) = parse_upload_segment_rsp(cmd);
                if recv_toggle != toggle {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                let len = 7 - unused_bytes as usize;
                if self.upload_fifo.get_space() < len {
                    self.state = ClientState::UploadSegmentWait { index, sub_index, toggle };
                    return Ok(SdoClientReturn::UploadDataBufferFull);
                }
                self.upload_fifo.write(&data[1..1 + len], None);
                if last {
                    Ok(SdoClientReturn::Ok)
                } else {
                    self.state = ClientState::UploadSegmentWait {
                        index,
                        sub_index,
                        toggle: !toggle,
                    };
                    self.send_upload_segment_req(hal, !toggle)
                }
            }
            ClientState::UploadBlockInitWait { index, sub_index, crc_enabled } => {
                if !is_block_upload_initiate_rsp(cmd) {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                self.state = ClientState::UploadBlockSubRecv {
                    index,
                    sub_index,
                    crc_enabled,
                    blksize: MAX_BLKSIZE,
                    seqno_expected: 1,
                    last_good: 0,
                    crc_acc: 0,
                    pending_last: None,
                };
                let ack = [BLOCK_ACK_CMD, 0, MAX_BLKSIZE, 0, 0, 0, 0, 0];
                self.send(hal, &ack).map_err(|_| SdoClientError::EndedWithClientAbort)?;
                Ok(SdoClientReturn::BlockUploadInProgress)
            }
            ClientState::UploadBlockSubRecv {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno_expected,
                last_good,
                mut crc_acc,
                mut pending_last,
            } => {
                let (seqno, last) = parse_block_segment_header(cmd);
                if seqno == seqno_expected {
                    if let Some((bytes, _)) = pending_last.take() {
                        if crc_enabled {
                            crc_acc = crc::update(crc_acc, &bytes);
                        }
                        self.upload_fifo.write(&bytes, None);
                    }
                    if last {
                        let mut bytes = [0u8; 7];
                        bytes.copy_from_slice(&data[1..8]);
                        // Bytes are parked until block-end carries the
                        // unused-byte count (spec.md §4.5 "stash 7 bytes
                        // aside").
                        self.state = ClientState::UploadBlockEndWait {
                            index,
                            sub_index,
                            crc_enabled,
                            crc_acc,
                            pending_last: Some((bytes, seqno)),
                        };
                        return Ok(SdoClientReturn::BlockUploadInProgress);
                    }
                    if !crc_enabled {
                        self.upload_fifo.write(&data[1..8], None);
                    } else {
                        crc_acc = crc::update(crc_acc, &data[1..8]);
                        self.upload_fifo.write(&data[1..8], None);
                    }
                    let new_last_good = seqno;
                    if seqno == blksize {
                        let next_blksize = MAX_BLKSIZE;
                        let ack = [BLOCK_ACK_CMD, new_last_good, next_blksize, 0, 0, 0, 0, 0];
                        self.send(hal, &ack).map_err(|_| SdoClientError::EndedWithClientAbort)?;
                        self.state = ClientState::UploadBlockSubRecv {
                            index,
                            sub_index,
                            crc_enabled,
                            blksize: next_blksize,
                            seqno_expected: 1,
                            last_good: 0,
                            crc_acc,
                            pending_last: None,
                        };
                    } else {
                        self.state = ClientState::UploadBlockSubRecv {
                            index,
                            sub_index,
                            crc_enabled,
                            blksize,
                            seqno_expected: seqno + 1,
                            last_good: new_last_good,
                            crc_acc,
                            pending_last: None,
                        };
                    }
                    Ok(SdoClientReturn::BlockUploadInProgress)
                } else if seqno == seqno_expected.wrapping_sub(1) {
                    // Duplicate of the last accepted segment: ignore.
                    self.state = ClientState::UploadBlockSubRecv {
                        index,
                        sub_index,
                        crc_enabled,
                        blksize,
                        seqno_expected,
                        last_good,
                        crc_acc,
                        pending_last,
                    };
                    Ok(SdoClientReturn::BlockUploadInProgress)
                } else {
                    // Out-of-sequence: close the sub-block early and NACK
                    // at the last good segment (spec.md §4.5).
                    let ack = [BLOCK_ACK_CMD, last_good, MAX_BLKSIZE, 0, 0, 0, 0, 0];
                    self.send(hal, &ack).map_err(|_| SdoClientError::EndedWithClientAbort)?;
                    self.state = ClientState::UploadBlockSubRecv {
                        index,
                        sub_index,
                        crc_enabled,
                        blksize: MAX_BLKSIZE,
                        seqno_expected: 1,
                        last_good: 0,
                        crc_acc,
                        pending_last: None,
                    };
                    Ok(SdoClientReturn::BlockUploadInProgress)
                }
            }
            ClientState::UploadBlockEndWait {
                crc_enabled,
                crc_acc,
                pending_last,
                ..
            } => {
                if cmd & 0xE3 != 0xC1 {
                    return Err(SdoClientError::EndedWithClientAbort);
                }
                let no_data = parse_block_end_req(cmd);
                if let Some((bytes, _)) = pending_last {
                    let keep = 7usize.saturating_sub(no_data as usize);
                    self.upload_fifo.write(&bytes[..keep], None);
                }
                let received_crc = u16::from_le_bytes([data[1], data[2]]);
                if crc_enabled && received_crc != crc_acc {
                    return Err(SdoClientError::EndedWithServerAbort(SdoAbortCode::CrcError));
                }
                self.send(hal, &[BLOCK_END_RSP, 0, 0, 0, 0, 0, 0, 0])
                    .map_err(|_| SdoClientError::EndedWithClientAbort)?;
                Ok(SdoClientReturn::Ok)
            }
            ClientState::Idle
            | ClientState::DownloadLocal { .. }
            | ClientState::UploadLocal { .. }
            | ClientState::DownloadBlockSending { .. } => Ok(SdoClientReturn::Idle),
        }
    }

    /// Sends the next 7-byte segment, `prev_toggle` being the toggle used
    /// by the segment just acknowledged (`None` for the very first segment,
    /// which always goes out with toggle `0`).
    fn send_next_download_segment(
        &mut self,
        hal: &mut H,
        index: u16,
        sub_index: u8,
        prev_toggle: Option<bool>,
    ) -> Result<SdoClientReturn, SdoClientError> {
        let toggle = match prev_toggle {
            None => false,
            Some(t) => !t,
        };
        let mut chunk = [0u8; 7];
        let n = self.download_fifo.read(&mut chunk, None);
        let last = self.download_complete && self.download_fifo.get_occupied() == 0;
        let mut req = [0u8; 8];
        req[0] = download_segment_req(toggle, (7 - n) as u8, last);
        req[1..1 + n].copy_from_slice(&chunk[..n]);
        self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
        self.state = ClientState::DownloadSegmentWait {
            index,
            sub_index,
            toggle,
            last_sent: last,
        };
        Ok(SdoClientReturn::WaitingResponse)
    }

    fn send_upload_segment_req(&mut self, hal: &mut H, toggle: bool) -> Result<SdoClientReturn, SdoClientError> {
        let req = [upload_segment_req(toggle), 0, 0, 0, 0, 0, 0, 0];
        self.send(hal, &req).map_err(|_| SdoClientError::EndedWithClientAbort)?;
        Ok(SdoClientReturn::WaitingResponse)
    }

    #[allow(clippy::too_many_arguments)]
    fn step_download_block_send(
        &mut self,
        hal: &mut H,
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        seqno: u8,
        mut crc_acc: u16,
    ) -> Result<SdoClientReturn, SdoClientError> {
        let mut chunk = [0u8; 7];
        let available = self.download_fifo.get_occupied();
        if available == 0 && !self.download_complete {
            self.state = ClientState::DownloadBlockSending {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno,
                crc_acc,
            };
            return Ok(SdoClientReturn::BlockDownloadInProgress);
        }
        let n = self.download_fifo.read(&mut chunk, None);
        let last = self.download_complete && self.download_fifo.get_occupied() == 0;
        if crc_enabled {
            crc_acc = crc::update(crc_acc, &chunk[..n]);
        }
        let mut frame = [0u8; 8];
        frame[0] = block_segment_header(seqno, last);
        frame[1..1 + n].copy_from_slice(&chunk[..n]);
        self.send(hal, &frame).map_err(|_| SdoClientError::EndedWithClientAbort)?;

        if last {
            let no_data = (7 - n) as u8;
            let mut end = [0u8; 8];
            end[0] = block_end_req(no_data);
            end[1..3].copy_from_slice(&crc_acc.to_le_bytes());
            self.send(hal, &end).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.state = ClientState::DownloadBlockEndWait { index, sub_index };
        } else if seqno == blksize {
            self.state = ClientState::DownloadBlockAckWait {
                index,
                sub_index,
                crc_enabled,
                blksize,
                crc_acc,
            };
        } else {
            self.state = ClientState::DownloadBlockSending {
                index,
                sub_index,
                crc_enabled,
                blksize,
                seqno: seqno + 1,
                crc_acc,
            };
        }
        Ok(SdoClientReturn::BlockDownloadInProgress)
    }

    fn close_upload_sub_block_on_timeout(&mut self, hal: &mut H) -> Result<SdoClientReturn, SdoClientError> {
        if let ClientState::UploadBlockSubRecv {
            index,
            sub_index,
            crc_enabled,
            last_good,
            crc_acc,
            ..
        } = self.state
        {
            let ack = [BLOCK_ACK_CMD, last_good, MAX_BLKSIZE, 0, 0, 0, 0, 0];
            self.send(hal, &ack).map_err(|_| SdoClientError::EndedWithClientAbort)?;
            self.sub_elapsed_ms = 0;
            self.state = ClientState::UploadBlockSubRecv {
                index,
                sub_index,
                crc_enabled,
                blksize: MAX_BLKSIZE,
                seqno_expected: 1,
                last_good: 0,
                crc_acc,
                pending_last: None,
            };
            Ok(SdoClientReturn::BlockUploadInProgress)
        } else {
            Ok(SdoClientReturn::Idle)
        }
    }

    fn step_download_local(
        &mut self,
        od: &mut ObjectDictionary,
        index: u16,
        sub_index: u8,
    ) -> Result<SdoClientReturn, SdoClientError> {
        let mut chunk = [0u8; 256];
        let n = self.download_fifo.read(&mut chunk, None);
        match od.write(index, sub_index, &chunk[..n]) {
            Ok(ExtResult::Partial) => {
                self.state = ClientState::DownloadLocal { index, sub_index };
                Ok(SdoClientReturn::WaitingLocalTransfer)
            }
            Ok(ExtResult::Ok) => Ok(SdoClientReturn::Ok),
            Err(e) => Err(SdoClientError::EndedWithServerAbort(e.into())),
        }
    }

    fn step_upload_local(
        &mut self,
        od: &mut ObjectDictionary,
        index: u16,
        sub_index: u8,
    ) -> Result<SdoClientReturn, SdoClientError> {
        match od.read(index, sub_index) {
            Ok((value, ExtResult::Partial)) => {
                self.upload_fifo.write(&value.serialize(), None);
                self.state = ClientState::UploadLocal { index, sub_index };
                Ok(SdoClientReturn::WaitingLocalTransfer)
            }
            Ok((value, ExtResult::Ok)) => {
                self.upload_fifo.write(&value.serialize(), None);
                Ok(SdoClientReturn::Ok)
            }
            Err(e) => Err(SdoClientError::EndedWithServerAbort(e.into())),
        }
    }
}

/// Maps a wire abort code back to the closed [`SdoAbortCode`] set,
/// defaulting to `GeneralError` for any value outside spec.md §6's
/// exhaustive list (a peer is free to send codes this core doesn't model).
fn abort_code_from_wire(code: u32) -> SdoAbortCode {
    use SdoAbortCode::*;
    match code {
        0x0503_0000 => ToggleBitNotAlternated,
        0x0504_0000 => SdoProtocolTimedOut,
        0x0504_0001 => CommandSpecifierUnknown,
        0x0504_0002 => InvalidBlockSize,
        0x0504_0003 => InvalidSequenceNumber,
        0x0504_0004 => CrcError,
        0x0504_0005 => OutOfMemory,
        0x0601_0000 => UnsupportedAccess,
        0x0601_0001 => AttemptToReadWriteOnly,
        0x0601_0002 => AttemptToWriteReadOnly,
        0x0602_0000 => ObjectDoesNotExist,
        0x0604_0041 => ObjectCannotBeMapped,
        0x0604_0042 => PdoLengthExceeded,
        0x0604_0043 => ParameterIncompatibility,
        0x0604_0047 => InternalIncompatibility,
        0x0606_0000 => HardwareError,
        0x0607_0010 => DataTypeMismatchLengthMismatch,
        0x0607_0012 => DataTypeMismatchLengthTooHigh,
        0x0607_0013 => DataTypeMismatchLengthTooLow,
        0x0609_0011 => SubIndexDoesNotExist,
        0x0609_0030 => ValueRangeExceeded,
        0x0609_0031 => ValueTooHigh,
        0x0609_0032 => ValueTooLow,
        0x0609_0036 => MaxLessThanMin,
        0x060A_0023 => ResourceNotAvailable,
        0x0800_0020 => DataCannotBeStored,
        0x0800_0021 => DataCannotBeStoredLocalControl,
        0x0800_0022 => DataCannotBeStoredDeviceState,
        0x0800_0023 => ObjectDictionaryGenerationFailed,
        0x0800_0024 => NoDataAvailable,
        _ => GeneralError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Attributes, ObjectEntry, ObjectValue};
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

    fn new_client() -> (SdoClient<FakeHal>, FakeHal, ObjectDictionary) {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut client: SdoClient<FakeHal> = SdoClient::new(1);
        client.communication_reset(&mut hal, 2, 500);
        (client, hal, ObjectDictionary::new())
    }

    #[test]
    fn expedited_download_completes_on_matching_initiate_rsp() {
        let (mut client, mut hal, mut od) = new_client();
        client.download_fifo_mut().write(&0x1234u16.to_le_bytes(), None);
        let ret = client
            .download_start(&mut hal, 0x2000, 0, Some(2), false)
            .unwrap();
        assert_eq!(ret, SdoClientReturn::WaitingResponse);
        assert_eq!(hal.sent.len(), 1);

        let rsp = CanFrame::new(client.rx_cob_id, &[DOWNLOAD_INITIATE_RSP, 0, 0x20, 0, 0, 0, 0, 0]);
        let ret = client.process(&mut hal, &mut od, 10, Some(&rsp)).unwrap();
        assert_eq!(ret, SdoClientReturn::Ok);
        assert!(client.is_idle());
    }

    #[test]
    fn segmented_download_sends_initiate_then_one_segment_per_ack() {
        let (mut client, mut hal, mut od) = new_client();
        client.download_fifo_mut().write(b"hello world this is long", None);
        client.mark_download_complete();
        client
            .download_start(&mut hal, 0x2001, 0, Some(25), false)
            .unwrap();
        assert_eq!(hal.sent.len(), 1);

        // Initiate ack -> first segment (toggle 0).
        let rsp = CanFrame::new(client.rx_cob_id, &[DOWNLOAD_INITIATE_RSP, 0, 0, 0, 0, 0, 0, 0]);
        client.process(&mut hal, &mut od, 0, Some(&rsp)).unwrap();
        assert_eq!(hal.sent.len(), 2);
        assert_eq!(hal.sent[1].payload()[0] & 0x10, 0);

        // Segment ack toggle 0 -> next segment toggle 1.
        let rsp2 = CanFrame::new(client.rx_cob_id, &[download_segment_rsp(false), 0, 0, 0, 0, 0, 0, 0]);
        client.process(&mut hal, &mut od, 0, Some(&rsp2)).unwrap();
        assert_eq!(hal.sent.len(), 3);
        assert_eq!(hal.sent[2].payload()[0] & 0x10, 0x10);
    }

    #[test]
    fn upload_expedited_copies_payload_into_upload_fifo() {
        let (mut client, mut hal, mut od) = new_client();
        client.upload_start(&mut hal, 0x1018, 1, false).unwrap();
        assert_eq!(hal.sent[0].payload()[0], UPLOAD_INITIATE_REQ);

        let rsp = CanFrame::new(
            client.rx_cob_id,
            &[upload_initiate_rsp(true, true, 0), 0x18, 0x10, 1, 0xAA, 0xBB, 0xCC, 0xDD],
        );
        let ret = client.process(&mut hal, &mut od, 0, Some(&rsp)).unwrap();
        assert_eq!(ret, SdoClientReturn::Ok);
        let mut out = [0u8; 4];
        let n = client.upload_fifo_mut().read(&mut out, None);
        assert_eq!(&out[..n], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn local_loopback_download_writes_directly_to_od() {
        let mut hal = FakeHal { sent: Vec::new() };
        let mut client: SdoClient<FakeHal> = SdoClient::new(5);
        client.communication_reset(&mut hal, 5, 500);
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::variable(
            0x2100,
            Attributes::read_write(),
            ObjectValue::Unsigned16(0),
        ));

        client.download_fifo_mut().write(&0x4321u16.to_le_bytes(), None);
        client.mark_download_complete();
        let ret = client
            .download_start(&mut hal, 0x2100, 0, Some(2), false)
            .unwrap();
        assert_eq!(ret, SdoClientReturn::WaitingLocalTransfer);
        assert!(hal.sent.is_empty());

        let ret = client.process(&mut hal, &mut od, 0, None).unwrap();
        assert_eq!(ret, SdoClientReturn::Ok);
        let (value, _) = od.read(0x2100, 0).unwrap();
        assert_eq!(value, ObjectValue::Unsigned16(0x4321));
    }

    #[test]
    fn starting_a_transfer_while_busy_clears_state_and_reports_wrong_arguments() {
        let (mut client, mut hal, _od) = new_client();
        client
            .download_start(&mut hal, 0x2000, 0, Some(2), false)
            .unwrap();
        let err = client
            .download_start(&mut hal, 0x2001, 0, Some(2), false)
            .unwrap_err();
        assert_eq!(err, SdoClientError::WrongArguments);
        assert!(client.is_idle());
    }

    #[test]
    fn no_response_within_timeout_ends_with_timeout_error() {
        let (mut client, mut hal, mut od) = new_client();
        client
            .download_start(&mut hal, 0x2000, 0, Some(2), false)
            .unwrap();
        let err = client.process(&mut hal, &mut od, 500, None).unwrap_err();
        assert_eq!(err, SdoClientError::EndedWithTimeout);
        assert!(client.is_idle());
    }

    #[test]
    fn server_abort_frame_maps_to_documented_abort_code() {
        let (mut client, mut hal, mut od) = new_client();
        client
            .download_start(&mut hal, 0x2000, 0, Some(2), false)
            .unwrap();
        let mut bytes = [0u8; 8];
        bytes[0] = cs::ABORT;
        bytes[4..8].copy_from_slice(&SdoAbortCode::ObjectDoesNotExist.wire_bytes());
        let abort = CanFrame::new(client.rx_cob_id, &bytes);
        let err = client.process(&mut hal, &mut od, 0, Some(&abort)).unwrap_err();
        assert_eq!(err, SdoClientError::EndedWithServerAbort(SdoAbortCode::ObjectDoesNotExist));
        assert!(client.is_idle());
    }
}
