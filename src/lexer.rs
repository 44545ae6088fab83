//! Lexical layer: a byte cursor over the source plus the keyword probes and
//! literal readers the statement compiler drives directly.
//!
//! There is no token stream. The compiler peeks at raw bytes, probes for
//! keywords without advancing, and consumes exactly what it recognises. End
//! of input reads as a sentinel zero byte so callers never index past the
//! buffer.

use thiserror::Error;

/// Identifiers keep at most this many meaningful bytes; the rest of the
/// lexeme is consumed but discarded. Equality over the truncated bytes is
/// part of the language contract.
pub const MAX_IDENT_LEN: usize = 31;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid hex escape: \\x{0}")]
    InvalidHexEscape(String),
}

pub fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

pub fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

pub fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Character-level scanner over an immutable source buffer.
pub struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    /// Byte at the cursor, or 0 at end of input.
    pub fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    /// Byte `n` positions past the cursor, or 0 past end of input.
    pub fn peek_at(&self, n: usize) -> u8 {
        self.src.get(self.pos + n).copied().unwrap_or(0)
    }

    /// Return the current byte and step past it.
    pub fn advance(&mut self) -> u8 {
        let b = self.peek();
        if self.pos < self.src.len() {
            self.pos += 1;
        }
        b
    }

    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.src.len());
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Rewind to the start of the source for the second pass.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn skip_ws(&mut self) {
        while is_ws(self.peek()) {
            self.pos += 1;
        }
    }

    /// Skip spaces and tabs only, stopping at a line break.
    pub fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), b' ' | b'\t') {
            self.pos += 1;
        }
    }

    /// Consume through the next line feed (or to end of input).
    pub fn skip_line(&mut self) {
        while !self.at_eof() {
            if self.advance() == b'\n' {
                break;
            }
        }
    }

    /// True when the bytes at the cursor match `kw`. Does not advance.
    pub fn probe(&self, kw: &str) -> bool {
        let kw = kw.as_bytes();
        self.src.len() - self.pos >= kw.len() && &self.src[self.pos..self.pos + kw.len()] == kw
    }

    /// Keyword probe demanding a whitespace delimiter after the match, for
    /// keywords that are also valid identifier prefixes.
    pub fn probe_kw_ws(&self, kw: &str) -> bool {
        self.probe(kw) && is_ws(self.peek_at(kw.len()))
    }

    /// Read an identifier. The caller has already checked `is_ident_start`;
    /// bytes past `MAX_IDENT_LEN` are consumed and dropped.
    pub fn parse_ident(&mut self) -> String {
        let mut name = String::new();
        while is_ident_char(self.peek()) {
            let b = self.advance();
            if name.len() < MAX_IDENT_LEN {
                name.push(b as char);
            }
        }
        name
    }

    /// Read a decimal integer with an optional leading minus. Overflow wraps,
    /// matching two's-complement accumulation.
    pub fn parse_number(&mut self) -> i64 {
        let negative = self.peek() == b'-';
        if negative {
            self.advance();
        }
        let mut value: i64 = 0;
        while self.peek().is_ascii_digit() {
            let d = (self.advance() - b'0') as i64;
            value = value.wrapping_mul(10).wrapping_add(d);
        }
        if negative {
            value.wrapping_neg()
        } else {
            value
        }
    }

    /// Read `int[.frac]` as a value scaled by 1000. Fractional digits past
    /// the third are consumed and ignored.
    pub fn parse_float_fixed(&mut self) -> i64 {
        let mut value: i64 = 0;
        while self.peek().is_ascii_digit() {
            let d = (self.advance() - b'0') as i64;
            value = value.wrapping_mul(10).wrapping_add(d);
        }
        value = value.wrapping_mul(1000);
        if self.peek() == b'.' && self.peek_at(1).is_ascii_digit() {
            self.advance();
            let mut scale: i64 = 100;
            while self.peek().is_ascii_digit() {
                let d = (self.advance() - b'0') as i64;
                value = value.wrapping_add(d * scale);
                scale /= 10;
            }
        }
        value
    }

    /// Read a quoted string literal, decoding the escape set: `\n`, `\t`,
    /// `\r`, `\0`, `\xHH`, and any other escaped byte verbatim. The cursor
    /// must be on the opening quote.
    pub fn parse_string(&mut self) -> Result<Vec<u8>, ScanError> {
        debug_assert_eq!(self.peek(), b'"');
        self.advance();
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                0 if self.at_eof() => return Err(ScanError::UnterminatedString),
                b'"' => return Ok(bytes),
                b'\\' => {
                    let esc = self.advance();
                    if esc == 0 && self.at_eof() {
                        return Err(ScanError::UnterminatedString);
                    }
                    match esc {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'0' => bytes.push(0),
                        b'x' => {
                            let hi = self.advance();
                            let lo = self.advance();
                            match (hex_value(hi), hex_value(lo)) {
                                (Some(h), Some(l)) => bytes.push((h << 4) | l),
                                _ => {
                                    return Err(ScanError::InvalidHexEscape(format!(
                                        "{}{}",
                                        hi as char, lo as char
                                    )))
                                }
                            }
                        }
                        other => bytes.push(other),
                    }
                }
                b => bytes.push(b),
            }
        }
    }

    /// Skip over a quoted literal without decoding it. Used by the pre-scan
    /// so a `fn` inside a string is not taken for a declaration.
    pub fn skip_string_raw(&mut self) -> Result<(), ScanError> {
        debug_assert_eq!(self.peek(), b'"');
        self.advance();
        loop {
            match self.advance() {
                0 if self.at_eof() => return Err(ScanError::UnterminatedString),
                b'"' => return Ok(()),
                b'\\' => {
                    if self.advance() == 0 && self.at_eof() {
                        return Err(ScanError::UnterminatedString);
                    }
                }
                _ => {}
            }
        }
    }
}
