//! ASCII token and typed-value services built on top of [`super::Fifo`],
//! used only by the gateway (spec.md §4.1, §4.10).
//!
//! Implements the CiA 309-3 textual encodings: decimal/hex integers,
//! floats, double-quoted visible strings (with `""`-escaping) and
//! single-line RFC 2045 base64 for octet/unicode strings and domains.

use super::{Fifo, DELIM_COMMAND, DELIM_COMMENT};
use alloc::string::String;
use alloc::vec::Vec;

/// Bitmask result returned by the typed "ascii -> binary" copy helpers
/// (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenFlags {
    /// The command terminator followed this token.
    pub closed: bool,
    /// More data is expected (token was cut by a still-open domain/string).
    pub partial: bool,
    /// No token was found where one was expected.
    pub err_tok: bool,
    /// Token was found but failed to parse as the requested datatype.
    pub err_val: bool,
    /// The caller's buffer was too small for the decoded value.
    pub err_buf: bool,
    /// The decoded integer value does not fit the requested width.
    pub err_int: bool,
}

impl TokenFlags {
    pub fn is_ok(&self) -> bool {
        !(self.err_tok || self.err_val || self.err_buf || self.err_int)
    }
}

/// The closed set of CiA 309-3 wire datatypes (spec.md §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    B,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    X8,
    X16,
    X32,
    X64,
    R32,
    R64,
    Vs,
    Os,
    Us,
    D,
    Hex,
}

impl Datatype {
    /// Parses the gateway's lower-case datatype name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "b" => Self::B,
            "i8" => Self::I8,
            "i16" => Self::I16,
            "i32" => Self::I32,
            "i64" => Self::I64,
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u32" => Self::U32,
            "u64" => Self::U64,
            "x8" => Self::X8,
            "x16" => Self::X16,
            "x32" => Self::X32,
            "x64" => Self::X64,
            "r32" => Self::R32,
            "r64" => Self::R64,
            "vs" => Self::Vs,
            "os" => Self::Os,
            "us" => Self::Us,
            "d" => Self::D,
            "hex" => Self::Hex,
            _ => return None,
        })
    }

    /// Fixed wire length in bytes, or `None` for variable-length types.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Self::B | Self::I8 | Self::U8 | Self::X8 => Some(1),
            Self::I16 | Self::U16 | Self::X16 => Some(2),
            Self::I32 | Self::U32 | Self::X32 | Self::R32 => Some(4),
            Self::I64 | Self::U64 | Self::X64 | Self::R64 => Some(8),
            Self::Vs | Self::Os | Self::Us | Self::D | Self::Hex => None,
        }
    }
}

/// Detects a complete command in the fifo: the terminator is present, or
/// the buffer is full with no terminator (spec.md §4.1 `comm_search`). If
/// `clear`, a found command (terminator-delimited, or the whole buffer if
/// full-without-delimiter) is discarded from the fifo.
pub fn comm_search(fifo: &mut Fifo, clear: bool) -> bool {
    let occupied = fifo.get_occupied();
    let mut delim_at = None;
    for i in 0..occupied {
        if fifo.peek(i) == DELIM_COMMAND {
            delim_at = Some(i);
            break;
        }
    }
    match delim_at {
        Some(pos) => {
            if clear {
                fifo.discard(pos + 1);
            }
            true
        }
        None => {
            if fifo.is_full() {
                if clear {
                    fifo.discard(occupied);
                }
                true
            } else {
                false
            }
        }
    }
}

fn is_graphical(b: u8) -> bool {
    b > 0x20 && b < 0x7F
}

/// Skips non-graphical bytes and `#`…`\n` comments. Returns true if the
/// command terminator was consumed while skipping. `inside_comment` is
/// input/output: pass `true` in to resume skipping an already-open comment;
/// it is set `true` on return if the fifo ran dry still inside a comment.
pub fn trim_spaces(fifo: &mut Fifo, inside_comment: &mut bool) -> bool {
    loop {
        if fifo.get_occupied() == 0 {
            return false;
        }
        let b = fifo.peek(0);
        if *inside_comment {
            fifo.discard(1);
            if b == DELIM_COMMAND {
                *inside_comment = false;
                return true;
            }
            continue;
        }
        if b == DELIM_COMMENT {
            *inside_comment = true;
            fifo.discard(1);
            continue;
        }
        if b == DELIM_COMMAND {
            fifo.discard(1);
            return true;
        }
        if is_graphical(b) {
            return false;
        }
        fifo.discard(1);
    }
}

/// Result of [`read_token`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenResult {
    pub token: Vec<u8>,
    pub closed: bool,
    pub err: bool,
}

/// Extracts the next whitespace-delimited graphical token, honoring `#`
/// comments. Tokens exceeding `max_len` set `err` and are discarded.
pub fn read_token(fifo: &mut Fifo, max_len: usize) -> TokenResult {
    let mut inside_comment = false;
    trim_spaces(fifo, &mut inside_comment);

    let occupied = fifo.get_occupied();
    let mut len = 0;
    while len < occupied && is_graphical(fifo.peek(len)) {
        len += 1;
    }

    if len == 0 {
        return TokenResult {
            token: Vec::new(),
            closed: false,
            err: true,
        };
    }

    if len > max_len {
        fifo.discard(len);
        return TokenResult {
            token: Vec::new(),
            closed: false,
            err: true,
        };
    }

    let mut token = Vec::with_capacity(len);
    for i in 0..len {
        token.push(fifo.peek(i));
    }
    fifo.discard(len);

    // Token must be followed by at least one non-graphical delimiter.
    let mut closed = false;
    if fifo.get_occupied() > 0 && fifo.peek(0) == DELIM_COMMAND {
        fifo.discard(1);
        closed = true;
    }

    TokenResult {
        token,
        closed,
        err: false,
    }
}

// --- Typed "ascii -> binary" decoding -------------------------------------

fn parse_unsigned(text: &str, hex: bool, bits: u32) -> Result<u64, ()> {
    let value = if hex {
        u64::from_str_radix(text.trim_start_matches("0x").trim_start_matches("0X"), 16)
    } else {
        text.parse::<u64>()
    }
    .map_err(|_| ())?;
    if bits < 64 && value >= (1u64 << bits) {
        return Err(());
    }
    Ok(value)
}

fn parse_signed(text: &str, bits: u32) -> Result<i64, ()> {
    let value: i64 = text.parse().map_err(|_| ())?;
    if bits < 64 {
        let lo = -(1i64 << (bits - 1));
        let hi = (1i64 << (bits - 1)) - 1;
        if value < lo || value > hi {
            return Err(());
        }
    }
    Ok(value)
}

/// Decodes one token of datatype `dtype` from `fifo` into `out`, returning
/// the number of bytes written and a `TokenFlags` result. `out` must be at
/// least as large as `dtype.fixed_len()` for fixed-width types.
pub fn cpy_tok_to_value(fifo: &mut Fifo, dtype: Datatype, out: &mut [u8]) -> (usize, TokenFlags) {
    let mut flags = TokenFlags::default();

    if let Some(fixed) = dtype.fixed_len() {
        if out.len() < fixed {
            flags.err_buf = true;
            return (0, flags);
        }
    }

    match dtype {
        Datatype::Vs => return cpy_tok_to_vs(fifo, out),
        Datatype::Os | Datatype::Us | Datatype::D => return cpy_tok_to_b64(fifo, out),
        Datatype::Hex => return cpy_tok_to_hex(fifo, out),
        _ => {}
    }

    let result = read_token(fifo, 32);
    if result.err {
        flags.err_tok = true;
        return (0, flags);
    }
    flags.closed = result.closed;

    let text = match core::str::from_utf8(&result.token) {
        Ok(t) => t,
        Err(_) => {
            flags.err_val = true;
            return (0, flags);
        }
    };

    let write_le = |out: &mut [u8], bytes: &[u8]| {
        out[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    };

    let parsed = match dtype {
        Datatype::B => match text {
            "0" | "false" => Ok((0u64, 1)),
            "1" | "true" => Ok((1u64, 1)),
            _ => Err(()),
        },
        Datatype::I8 => parse_signed(text, 8).map(|v| (v as u8 as u64, 1)),
        Datatype::I16 => parse_signed(text, 16).map(|v| (v as u16 as u64, 2)),
        Datatype::I32 => parse_signed(text, 32).map(|v| (v as u32 as u64, 4)),
        Datatype::I64 => parse_signed(text, 64).map(|v| (v as u64, 8)),
        Datatype::U8 => parse_unsigned(text, false, 8).map(|v| (v, 1)),
        Datatype::U16 => parse_unsigned(text, false, 16).map(|v| (v, 2)),
        Datatype::U32 => parse_unsigned(text, false, 32).map(|v| (v, 4)),
        Datatype::U64 => parse_unsigned(text, false, 64).map(|v| (v, 8)),
        Datatype::X8 => parse_unsigned(text, true, 8).map(|v| (v, 1)),
        Datatype::X16 => parse_unsigned(text, true, 16).map(|v| (v, 2)),
        Datatype::X32 => parse_unsigned(text, true, 32).map(|v| (v, 4)),
        Datatype::X64 => parse_unsigned(text, true, 64).map(|v| (v, 8)),
        _ => unreachable!("variable-length datatypes handled above"),
    };

    match parsed {
        Ok((value, len)) => {
            let n = write_le(out, &value.to_le_bytes()[..len]);
            (n, flags)
        }
        Err(()) => match dtype {
            Datatype::R32 | Datatype::R64 => {
                let n = cpy_tok_float(text, dtype, out, &mut flags);
                (n, flags)
            }
            _ => {
                flags.err_val = true;
                (0, flags)
            }
        },
    }
}

fn cpy_tok_float(text: &str, dtype: Datatype, out: &mut [u8], flags: &mut TokenFlags) -> usize {
    match dtype {
        Datatype::R32 => match text.parse::<f32>() {
            Ok(v) => {
                out[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            Err(_) => {
                flags.err_val = true;
                0
            }
        },
        Datatype::R64 => match text.parse::<f64>() {
            Ok(v) => {
                out[..8].copy_from_slice(&v.to_le_bytes());
                8
            }
            Err(_) => {
                flags.err_val = true;
                0
            }
        },
        _ => {
            flags.err_val = true;
            0
        }
    }
}

/// Decodes a double-quoted, `""`-escaped visible string token. NUL and CR
/// bytes are rejected (they are stripped on the print side instead).
pub fn cpy_tok_to_vs(fifo: &mut Fifo, out: &mut [u8]) -> (usize, TokenFlags) {
    let mut flags = TokenFlags::default();
    let mut inside_comment = false;
    trim_spaces(fifo, &mut inside_comment);

    if fifo.get_occupied() == 0 || fifo.peek(0) != b'"' {
        flags.err_tok = true;
        return (0, flags);
    }
    fifo.discard(1);

    let mut decoded: Vec<u8> = Vec::new();
    let occupied = fifo.get_occupied();
    let mut i = 0;
    let mut terminated = false;
    while i < occupied {
        let b = fifo.peek(i);
        if b == b'"' {
            // Doubled quote is an escaped literal quote.
            if i + 1 < occupied && fifo.peek(i + 1) == b'"' {
                decoded.push(b'"');
                i += 2;
                continue;
            }
            terminated = true;
            i += 1;
            break;
        }
        decoded.push(b);
        i += 1;
    }

    if !terminated {
        flags.err_tok = true;
        return (0, flags);
    }
    fifo.discard(i);

    if decoded.len() > out.len() {
        flags.err_buf = true;
        return (0, flags);
    }
    out[..decoded.len()].copy_from_slice(&decoded);

    if fifo.get_occupied() > 0 && fifo.peek(0) == DELIM_COMMAND {
        fifo.discard(1);
        flags.closed = true;
    }
    (decoded.len(), flags)
}

/// Decodes a space-separated, two-digit hex byte token sequence (e.g.
/// `"DE AD BE EF"`) in one shot (the gateway reads `hex` as a single token
/// containing embedded spaces is not valid per spec.md — each byte pair is
/// itself whitespace-free, so a normal token boundary applies here too).
pub fn cpy_tok_to_hex(fifo: &mut Fifo, out: &mut [u8]) -> (usize, TokenFlags) {
    let mut flags = TokenFlags::default();
    let result = read_token(fifo, out.len() * 2);
    if result.err {
        flags.err_tok = true;
        return (0, flags);
    }
    flags.closed = result.closed;
    if result.token.len() % 2 != 0 {
        flags.err_val = true;
        return (0, flags);
    }
    let n = result.token.len() / 2;
    if n > out.len() {
        flags.err_buf = true;
        return (0, flags);
    }
    for i in 0..n {
        let hi = (result.token[i * 2] as char).to_digit(16);
        let lo = (result.token[i * 2 + 1] as char).to_digit(16);
        match (hi, lo) {
            (Some(h), Some(l)) => out[i] = ((h << 4) | l) as u8,
            _ => {
                flags.err_val = true;
                return (0, flags);
            }
        }
    }
    (n, flags)
}

const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// RFC 2045 base64 encode, no line breaks.
pub fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let n = (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32;
        out.push(B64_ALPHABET[(n >> 18 & 0x3F) as usize] as char);
        out.push(B64_ALPHABET[(n >> 12 & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 {
            B64_ALPHABET[(n >> 6 & 0x3F) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            B64_ALPHABET[(n & 0x3F) as usize] as char
        } else {
            '='
        });
    }
    out
}

fn b64_val(c: u8) -> Option<u32> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u32),
        b'a'..=b'z' => Some((c - b'a') as u32 + 26),
        b'0'..=b'9' => Some((c - b'0') as u32 + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// RFC 2045 base64 decode, no line breaks expected.
pub fn base64_decode(text: &str) -> Result<Vec<u8>, ()> {
    let bytes: Vec<u8> = text.bytes().filter(|b| *b != b'=').collect();
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3 + 3);
    for chunk in bytes.chunks(4) {
        let mut vals = [0u32; 4];
        for (i, &b) in chunk.iter().enumerate() {
            vals[i] = b64_val(b).ok_or(())?;
        }
        let n = vals[0] << 18 | vals[1] << 12 | vals[2] << 6 | vals[3];
        out.push((n >> 16) as u8);
        if chunk.len() > 2 {
            out.push((n >> 8) as u8);
        }
        if chunk.len() > 3 {
            out.push(n as u8);
        }
    }
    Ok(out)
}

/// Decodes a base64 token (used for `os`/`us`/`d` datatypes) directly into
/// `out`.
pub fn cpy_tok_to_b64(fifo: &mut Fifo, out: &mut [u8]) -> (usize, TokenFlags) {
    let mut flags = TokenFlags::default();
    let result = read_token(fifo, out.len() * 2);
    if result.err {
        flags.err_tok = true;
        return (0, flags);
    }
    flags.closed = result.closed;
    let text = match core::str::from_utf8(&result.token) {
        Ok(t) => t,
        Err(_) => {
            flags.err_val = true;
            return (0, flags);
        }
    };
    match base64_decode(text) {
        Ok(decoded) if decoded.len() <= out.len() => {
            out[..decoded.len()].copy_from_slice(&decoded);
            (decoded.len(), flags)
        }
        Ok(_) => {
            flags.err_buf = true;
            (0, flags)
        }
        Err(()) => {
            flags.err_val = true;
            (0, flags)
        }
    }
}

// --- Typed "binary -> ascii" printing -------------------------------------

/// Formats `data` (interpreted as `dtype`, little-endian) to ASCII,
/// appending the result to `out`. Returns `false` (and appends nothing) if
/// `data` is shorter than `dtype`'s fixed width.
pub fn print_value(dtype: Datatype, data: &[u8], out: &mut String) -> bool {
    if let Some(fixed) = dtype.fixed_len() {
        if data.len() < fixed {
            return false;
        }
    }
    match dtype {
        Datatype::B => out.push_str(if data[0] != 0 { "1" } else { "0" }),
        Datatype::I8 => out.push_str(&(data[0] as i8).to_string()),
        Datatype::I16 => out.push_str(&i16::from_le_bytes([data[0], data[1]]).to_string()),
        Datatype::I32 => out.push_str(
            &i32::from_le_bytes([data[0], data[1], data[2], data[3]]).to_string(),
        ),
        Datatype::I64 => out.push_str(
            &i64::from_le_bytes(data[..8].try_into().unwrap()).to_string(),
        ),
        Datatype::U8 => out.push_str(&data[0].to_string()),
        Datatype::U16 => out.push_str(&u16::from_le_bytes([data[0], data[1]]).to_string()),
        Datatype::U32 => out.push_str(
            &u32::from_le_bytes([data[0], data[1], data[2], data[3]]).to_string(),
        ),
        Datatype::U64 => out.push_str(
            &u64::from_le_bytes(data[..8].try_into().unwrap()).to_string(),
        ),
        Datatype::X8 => {
            out.push_str("0x");
            out.push_str(&alloc::format!("{:02X}", data[0]));
        }
        Datatype::X16 => {
            out.push_str("0x");
            out.push_str(&alloc::format!("{:04X}", u16::from_le_bytes([data[0], data[1]])));
        }
        Datatype::X32 => {
            out.push_str("0x");
            out.push_str(&alloc::format!(
                "{:08X}",
                u32::from_le_bytes([data[0], data[1], data[2], data[3]])
            ));
        }
        Datatype::X64 => {
            out.push_str("0x");
            out.push_str(&alloc::format!(
                "{:016X}",
                u64::from_le_bytes(data[..8].try_into().unwrap())
            ));
        }
        Datatype::R32 => out.push_str(
            &f32::from_le_bytes([data[0], data[1], data[2], data[3]]).to_string(),
        ),
        Datatype::R64 => out.push_str(
            &f64::from_le_bytes(data[..8].try_into().unwrap()).to_string(),
        ),
        Datatype::Vs => print_vs(data, out),
        Datatype::Os | Datatype::Us | Datatype::D => out.push_str(&base64_encode(data)),
        Datatype::Hex => print_hex(data, out),
    }
    true
}

fn print_vs(data: &[u8], out: &mut String) {
    out.push('"');
    for &b in data {
        // CRLF-stripped in, doubled-quote escaped out.
        if b == 0 || b == b'\r' {
            continue;
        }
        if b == b'"' {
            out.push('"');
            out.push('"');
        } else {
            out.push(b as char);
        }
    }
    out.push('"');
}

fn print_hex(data: &[u8], out: &mut String) {
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&alloc::format!("{:02X}", b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo_from(bytes: &[u8]) -> Fifo {
        let mut f = Fifo::new(bytes.len() + 2);
        f.write(bytes, None);
        f
    }

    #[test]
    fn read_token_splits_on_whitespace_and_marks_closed() {
        let mut f = fifo_from(b"read 0x2000 0 u16\n");
        let t1 = read_token(&mut f, 32);
        assert_eq!(t1.token, b"read");
        assert!(!t1.closed);
        let t2 = read_token(&mut f, 32);
        assert_eq!(t2.token, b"0x2000");
        let t3 = read_token(&mut f, 32);
        assert_eq!(t3.token, b"0");
        let t4 = read_token(&mut f, 32);
        assert_eq!(t4.token, b"u16");
        assert!(t4.closed);
    }

    #[test]
    fn read_token_oversized_is_err_tok() {
        let mut f = fifo_from(b"abcdefghij \n");
        let t = read_token(&mut f, 4);
        assert!(t.err);
    }

    #[test]
    fn comments_are_skipped() {
        let mut f = fifo_from(b"# a comment\nactual\n");
        let t = read_token(&mut f, 32);
        assert_eq!(t.token, b"actual");
    }

    #[test]
    fn u16_roundtrip() {
        let mut f = fifo_from(b"4660\n"); // 0x1234
        let mut out = [0u8; 2];
        let (n, flags) = cpy_tok_to_value(&mut f, Datatype::U16, &mut out);
        assert!(flags.is_ok());
        assert_eq!(n, 2);
        assert_eq!(out, 0x1234u16.to_le_bytes());

        let mut printed = String::new();
        assert!(print_value(Datatype::U16, &out, &mut printed));
        assert_eq!(printed, "4660");
    }

    #[test]
    fn x32_hex_roundtrip() {
        let mut f = fifo_from(b"0x00020192\n");
        let mut out = [0u8; 4];
        let (_, flags) = cpy_tok_to_value(&mut f, Datatype::X32, &mut out);
        assert!(flags.is_ok());
        assert_eq!(out, 0x00020192u32.to_le_bytes());
    }

    #[test]
    fn visible_string_escapes_inner_quotes() {
        let mut out = String::new();
        print_vs(b"hello \"world\"", &mut out);
        assert_eq!(out, "\"hello \"\"world\"\"\"");

        let mut f = fifo_from(b"\"hello \"\"world\"\"\"\n");
        let mut buf = [0u8; 32];
        let (n, flags) = cpy_tok_to_vs(&mut f, &mut buf);
        assert!(flags.is_ok());
        assert_eq!(&buf[..n], b"hello \"world\"");
    }

    #[test]
    fn base64_roundtrip() {
        let data = b"hello world, this is a domain transfer payload!";
        let encoded = base64_encode(data);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn oversized_token_is_err_tok_not_silent_truncation() {
        // Mirrors spec.md §8: oversized tokens must error, never truncate silently.
        let mut f = fifo_from(b"123456789012345678901234567890123\n");
        let mut out = [0u8; 8];
        let (_, flags) = cpy_tok_to_value(&mut f, Datatype::U64, &mut out);
        assert!(flags.err_tok || flags.err_val);
    }
}
