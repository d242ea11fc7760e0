//! CiA 301 SDO command-byte wire framing (spec.md §4.4), shared by the
//! server and client state machines. Bit layouts are reproduced bit-for-bit
//! from the specification and must not be "cleaned up".

/// Command-byte high nibble / top bits identifying the SDO sub-protocol.
pub mod cs {
    pub const DOWNLOAD_SEGMENT: u8 = 0x00;
    pub const INITIATE_DOWNLOAD: u8 = 0x20;
    pub const INITIATE_UPLOAD: u8 = 0x40;
    pub const UPLOAD_SEGMENT: u8 = 0x60;
    pub const ABORT: u8 = 0x80;
    pub const BLOCK_UPLOAD: u8 = 0xA0;
    pub const BLOCK_DOWNLOAD: u8 = 0xC0;
}

/// Client download-initiate command byte: `0x20 | e<<1 | s | n<<2`.
pub fn download_initiate_req(expedited: bool, size_indicated: bool, unused_bytes: u8) -> u8 {
    cs::INITIATE_DOWNLOAD | ((expedited as u8) << 1) | (size_indicated as u8) | (unused_bytes << 2)
}

pub fn parse_download_initiate_req(cmd: u8) -> (bool, bool, u8) {
    let expedited = cmd & 0x02 != 0;
    let size_indicated = cmd & 0x01 != 0;
    let unused_bytes = (cmd >> 2) & 0x03;
    (expedited, size_indicated, unused_bytes)
}

/// Server download-initiate response: fixed `0x60`.
pub const DOWNLOAD_INITIATE_RSP: u8 = 0x60;

/// Client segment-download command byte: `0x00 | t<<4 | n<<1 | c`.
pub fn download_segment_req(toggle: bool, unused_bytes: u8, last: bool) -> u8 {
    cs::DOWNLOAD_SEGMENT | ((toggle as u8) << 4) | (unused_bytes << 1) | (last as u8)
}

pub fn parse_download_segment_req(cmd: u8) -> (bool, u8, bool) {
    let toggle = cmd & 0x10 != 0;
    let unused_bytes = (cmd >> 1) & 0x07;
    let last = cmd & 0x01 != 0;
    (toggle, unused_bytes, last)
}

/// Server segment-download response: `0x20 | t<<4`.
pub fn download_segment_rsp(toggle: bool) -> u8 {
    cs::INITIATE_DOWNLOAD | ((toggle as u8) << 4)
}

pub fn parse_download_segment_rsp(cmd: u8) -> bool {
    cmd & 0x10 != 0
}

/// Client upload-initiate command byte: fixed `0x40`.
pub const UPLOAD_INITIATE_REQ: u8 = cs::INITIATE_UPLOAD;

/// Server upload-initiate response: `0x40 | e<<1 | s | n<<2`.
pub fn upload_initiate_rsp(expedited: bool, size_indicated: bool, unused_bytes: u8) -> u8 {
    cs::INITIATE_UPLOAD | ((expedited as u8) << 1) | (size_indicated as u8) | (unused_bytes << 2)
}

pub fn parse_upload_initiate_rsp(cmd: u8) -> (bool, bool, u8) {
    let expedited = cmd & 0x02 != 0;
    let size_indicated = cmd & 0x01 != 0;
    let unused_bytes = (cmd >> 2) & 0x03;
    (expedited, size_indicated, unused_bytes)
}

/// Client segment-upload command byte: `0x60 | t<<4`.
pub fn upload_segment_req(toggle: bool) -> u8 {
    cs::UPLOAD_SEGMENT | ((toggle as u8) << 4)
}

pub fn parse_upload_segment_req(cmd: u8) -> bool {
    cmd & 0x10 != 0
}

/// Server segment-upload response: `0x00 | t<<4 | n<<1 | c`.
pub fn upload_segment_rsp(toggle: bool, unused_bytes: u8, last: bool) -> u8 {
    cs::DOWNLOAD_SEGMENT | ((toggle as u8) << 4) | (unused_bytes << 1) | (last as u8)
}

pub fn parse_upload_segment_rsp(cmd: u8) -> (bool, u8, bool) {
    let toggle = cmd & 0x10 != 0;
    let unused_bytes = (cmd >> 1) & 0x07;
    let last = cmd & 0x01 != 0;
    (toggle, unused_bytes, last)
}

/// Block-download-initiate request: `0xC0 | cc<<2 | s<<1`.
pub fn block_download_initiate_req(crc_enabled: bool, size_indicated: bool) -> u8 {
    cs::BLOCK_DOWNLOAD | ((crc_enabled as u8) << 2) | ((size_indicated as u8) << 1)
}

pub fn parse_block_download_initiate_req(cmd: u8) -> (bool, bool) {
    let crc_enabled = cmd & 0x04 != 0;
    let size_indicated = cmd & 0x02 != 0;
    (crc_enabled, size_indicated)
}

/// Block-download-initiate response: `0xA0 | sc<<2 | blksize` — per spec.md
/// this packs the server's CRC-support flag into bit 2 alongside the
/// negotiated block size in the low bits, mirrored at the client.
pub fn block_download_initiate_rsp(crc_supported: bool, blksize: u8) -> [u8; 2] {
    [cs::BLOCK_UPLOAD | ((crc_supported as u8) << 2), blksize]
}

/// Sub-block download segment command byte: `b7=last, b6..b0=seqno`.
pub fn block_segment_header(seqno: u8, last: bool) -> u8 {
    (seqno & 0x7F) | ((last as u8) << 7)
}

pub fn parse_block_segment_header(cmd: u8) -> (u8, bool) {
    (cmd & 0x7F, cmd & 0x80 != 0)
}

/// Sub-block ack: `0xA2, ackseq, next_blksize`.
pub const BLOCK_ACK_CMD: u8 = 0xA2;

/// Block-download-end request: `0xC1 | noData<<2`, followed by CRC16 LE.
pub fn block_end_req(no_data: u8) -> u8 {
    0xC1 | (no_data << 2)
}

pub fn parse_block_end_req(cmd: u8) -> u8 {
    (cmd >> 2) & 0x07
}

/// Block-download-end response: fixed `0xA1`.
pub const BLOCK_END_RSP: u8 = 0xA1;

/// Client block-upload-initiate request: top bits `0xA0`, `cc<<2` CRC
/// support flag. `blksize`/`pst` travel in bytes 4/5 of the frame (spec.md
/// §4.5 "block_enable ... PST (default 21)").
pub fn block_upload_initiate_req(crc_enabled: bool) -> u8 {
    cs::BLOCK_UPLOAD | ((crc_enabled as u8) << 2)
}

pub fn is_block_upload_initiate_rsp(cmd: u8) -> bool {
    cmd & 0xE0 == cs::BLOCK_UPLOAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_initiate_roundtrips() {
        let cmd = download_initiate_req(true, true, 2);
        assert_eq!(parse_download_initiate_req(cmd), (true, true, 2));
    }

    #[test]
    fn segment_download_roundtrips() {
        let cmd = download_segment_req(true, 3, true);
        assert_eq!(parse_download_segment_req(cmd), (true, 3, true));
    }

    #[test]
    fn block_segment_header_roundtrips() {
        let cmd = block_segment_header(42, true);
        assert_eq!(parse_block_segment_header(cmd), (42, true));
    }

    #[test]
    fn expedited_download_req_matches_formula_in_spec() {
        // 0x20 | e<<1 | s | n<<2, e=1, s=1, n=0.
        let cmd = download_initiate_req(true, true, 0);
        assert_eq!(cmd, 0x23);
    }
}
