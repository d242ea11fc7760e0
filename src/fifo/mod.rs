//! Single-producer/single-consumer byte ring buffer (spec.md §3.4, §4.1).
//!
//! This is the buffer abstraction SDO block transfer and the gateway's line
//! parser are both built on. Capacity is fixed at construction time and
//! usable capacity is one byte less than the backing storage, the classic
//! ring-buffer trick that lets `read_ptr == write_ptr` mean "empty" without
//! a separate length field (mirrors `CO_fifo_getSpace`/`CO_fifo_getOccupied`
//! in `CO_fifo.c`).

pub mod ascii;

use alloc::vec;
use alloc::vec::Vec;

/// ASCII command terminator recognised by `comm_search`/`read`'s `eof` mode.
pub const DELIM_COMMAND: u8 = b'\n';
/// ASCII comment marker recognised by `trim_spaces`.
pub const DELIM_COMMENT: u8 = b'#';

/// A circular byte buffer over an internally-owned `Vec<u8>` of capacity
/// `bufSize`; usable capacity is `bufSize - 1`.
pub struct Fifo {
    buf: Vec<u8>,
    write_ptr: usize,
    read_ptr: usize,
    alt_read_ptr: Option<usize>,
}

impl Fifo {
    /// Creates a fifo backed by `capacity` bytes (usable space is
    /// `capacity - 1`). `capacity` must be at least 2.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "FIFO capacity must be at least 2");
        Self {
            buf: vec![0u8; capacity],
            write_ptr: 0,
            read_ptr: 0,
            alt_read_ptr: None,
        }
    }

    fn buf_size(&self) -> usize {
        self.buf.len()
    }

    /// Empties the fifo, discarding any buffered data.
    pub fn reset(&mut self) {
        self.read_ptr = 0;
        self.write_ptr = 0;
        self.alt_read_ptr = None;
    }

    /// Free space available to `write`.
    pub fn get_space(&self) -> usize {
        let mut size_left = self.read_ptr as isize - self.write_ptr as isize - 1;
        if size_left < 0 {
            size_left += self.buf_size() as isize;
        }
        size_left as usize
    }

    /// Bytes available to `read`.
    pub fn get_occupied(&self) -> usize {
        let mut occ = self.write_ptr as isize - self.read_ptr as isize;
        if occ < 0 {
            occ += self.buf_size() as isize;
        }
        occ as usize
    }

    /// Bytes available to `alt_read`, measured from `alt_read_ptr` (falls
    /// back to `read_ptr` if no alternate cursor is active).
    pub fn alt_get_occupied(&self) -> usize {
        let alt = self.alt_read_ptr.unwrap_or(self.read_ptr);
        let mut occ = self.write_ptr as isize - alt as isize;
        if occ < 0 {
            occ += self.buf_size() as isize;
        }
        occ as usize
    }

    /// Copies up to `buf.len()` bytes in, never blocking. Returns the number
    /// of bytes actually written. If `crc` is given, the copied bytes are
    /// folded into it.
    pub fn write(&mut self, data: &[u8], mut crc: Option<&mut u16>) -> usize {
        let n = data.len().min(self.get_space());
        let size = self.buf_size();
        for &byte in &data[..n] {
            self.buf[self.write_ptr] = byte;
            self.write_ptr = (self.write_ptr + 1) % size;
        }
        if let Some(crc) = crc.as_deref_mut() {
            *crc = crate::crc::update(*crc, &data[..n]);
        }
        n
    }

    /// Copies up to `buf.len()` bytes out. If `eof` is given, stops on (and
    /// consumes) `DELIM_COMMAND` and sets `*eof = true`; otherwise `*eof` is
    /// left `false`.
    pub fn read(&mut self, out: &mut [u8], mut eof: Option<&mut bool>) -> usize {
        if let Some(e) = eof.as_deref_mut() {
            *e = false;
        }
        let size = self.buf_size();
        let available = self.get_occupied();
        let limit = out.len().min(available);
        let mut n = 0;
        while n < limit {
            let byte = self.buf[self.read_ptr];
            self.read_ptr = (self.read_ptr + 1) % size;
            out[n] = byte;
            n += 1;
            if eof.is_some() && byte == DELIM_COMMAND {
                if let Some(e) = eof.as_deref_mut() {
                    *e = true;
                }
                break;
            }
        }
        n
    }

    /// Positions the alternate read cursor `offset` bytes ahead of
    /// `read_ptr`, saturating at `write_ptr`. Returns the actual offset
    /// applied.
    pub fn alt_begin(&mut self, offset: usize) -> usize {
        let occupied = self.get_occupied();
        let actual = offset.min(occupied);
        self.alt_read_ptr = Some((self.read_ptr + actual) % self.buf_size());
        actual
    }

    /// Reads via the alternate cursor without advancing `read_ptr`, used to
    /// re-transmit block-download segments after a server NACK.
    pub fn alt_read(&mut self, out: &mut [u8]) -> usize {
        let size = self.buf_size();
        let mut alt = self.alt_read_ptr.unwrap_or(self.read_ptr);
        let available = self.alt_get_occupied();
        let n = out.len().min(available);
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[alt];
            alt = (alt + 1) % size;
        }
        self.alt_read_ptr = Some(alt);
        n
    }

    /// Peeks the byte `offset` positions ahead of `read_ptr` without
    /// consuming anything. `offset` must be `< get_occupied()`.
    pub(crate) fn peek(&self, offset: usize) -> u8 {
        self.buf[(self.read_ptr + offset) % self.buf_size()]
    }

    /// True if the fifo holds no free space at all (used by the ASCII
    /// command scanner to detect an over-long, undelimited command).
    pub(crate) fn is_full(&self) -> bool {
        self.get_space() == 0
    }

    /// Discards `n` bytes from the front of the fifo without copying them
    /// anywhere (used by the ASCII layer to drop a scanned-but-unwanted
    /// command/comment).
    pub(crate) fn discard(&mut self, n: usize) {
        let n = n.min(self.get_occupied());
        self.read_ptr = (self.read_ptr + n) % self.buf_size();
    }

    /// Advances `read_ptr` to the current alternate cursor, optionally
    /// folding the newly-consumed bytes into `crc`.
    pub fn alt_finish(&mut self, mut crc: Option<&mut u16>) {
        let alt = self.alt_read_ptr.unwrap_or(self.read_ptr);
        if let Some(crc) = crc.as_deref_mut() {
            let size = self.buf_size();
            let mut p = self.read_ptr;
            while p != alt {
                *crc = crate::crc::update(*crc, &self.buf[p..p + 1]);
                p = (p + 1) % size;
            }
        }
        self.read_ptr = alt;
        self.alt_read_ptr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip_respects_capacity() {
        let mut fifo = Fifo::new(8);
        assert_eq!(fifo.get_space(), 7);
        let written = fifo.write(b"abcdefg", None);
        assert_eq!(written, 7);
        assert_eq!(fifo.get_space(), 0);
        assert_eq!(fifo.write(b"x", None), 0); // full

        let mut out = [0u8; 7];
        let n = fifo.read(&mut out, None);
        assert_eq!(n, 7);
        assert_eq!(&out, b"abcdefg");
        assert_eq!(fifo.get_occupied(), 0);
    }

    #[test]
    fn interleaved_write_read_preserves_total_bytes() {
        let mut fifo = Fifo::new(4);
        let mut total_written = 0usize;
        let mut total_read = 0usize;
        let mut src = 0u8;
        for round in 0..50 {
            let chunk = [src, src.wrapping_add(1)];
            total_written += fifo.write(&chunk, None);
            src = src.wrapping_add(2);
            if round % 2 == 0 {
                let mut out = [0u8; 3];
                total_read += fifo.read(&mut out, None);
            }
        }
        let mut out = [0u8; 16];
        total_read += fifo.read(&mut out, None);
        assert_eq!(total_written, total_read);
    }

    #[test]
    fn eof_stops_on_command_terminator() {
        let mut fifo = Fifo::new(16);
        fifo.write(b"hello\nworld", None);
        let mut out = [0u8; 16];
        let mut eof = false;
        let n = fifo.read(&mut out, Some(&mut eof));
        assert!(eof);
        assert_eq!(&out[..n], b"hello\n");
        let mut eof2 = false;
        let n2 = fifo.read(&mut out, Some(&mut eof2));
        assert!(!eof2);
        assert_eq!(&out[..n2], b"world");
    }

    #[test]
    fn alt_read_then_finish_advances_read_ptr_by_consumed_bytes() {
        let mut fifo = Fifo::new(16);
        fifo.write(b"0123456789", None);
        fifo.alt_begin(0);
        let mut out = [0u8; 4];
        let n = fifo.alt_read(&mut out);
        assert_eq!(n, 4);
        assert_eq!(&out, b"0123");
        // read_ptr must not have moved yet.
        assert_eq!(fifo.get_occupied(), 10);
        fifo.alt_finish(None);
        assert_eq!(fifo.get_occupied(), 6);
        let mut rest = [0u8; 6];
        fifo.read(&mut rest, None);
        assert_eq!(&rest, b"456789");
    }

    #[test]
    fn alt_begin_saturates_at_write_ptr() {
        let mut fifo = Fifo::new(16);
        fifo.write(b"abc", None);
        let actual = fifo.alt_begin(100);
        assert_eq!(actual, 3);
    }
}
