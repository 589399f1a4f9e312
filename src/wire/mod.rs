//! Little-endian wire framing shared by every message domain.
//!
//! Every message on every connection begins with a 4-byte unsigned length
//! prefix followed by a domain-specific code and payload. This module
//! implements that shared envelope plus the primitive readers/writers the
//! domain modules ([`server`], [`peer`], [`distributed`], [`init`]) build
//! their message types on top of — the wire-layer analogue of
//! cratetorrent's `peer::codec` module (trimmed from this pack, but its
//! role is the same: turn a byte stream into typed messages via
//! `tokio_util::codec`).

pub mod codec;
pub mod distributed;
pub mod init;
pub mod peer;
pub mod server;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frames larger than this are rejected outright: a malformed or hostile
/// peer claiming a multi-gigabyte message should not be allowed to make us
/// allocate that much memory.
pub const MAX_MESSAGE_LEN: u32 = 256 * 1024 * 1024;

/// How many bytes the length prefix itself occupies.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug)]
pub enum Error {
    /// Not enough bytes were available to satisfy a read.
    Truncated,
    /// The advertised message length exceeds [`MAX_MESSAGE_LEN`]. Fatal for
    /// the connection it was read on.
    Oversize { len: u32, max: u32 },
    /// A known message code's payload didn't parse.
    Decode(String),
    /// The underlying I/O operation failed.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "message truncated"),
            Error::Oversize { len, max } => {
                write!(f, "message of {} bytes exceeds the {} byte limit", len, max)
            }
            Error::Decode(reason) => write!(f, "decode error: {}", reason),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// Validates a length prefix read off the wire, converting it to a
/// [`Error::Oversize`] failure when it would blow the configured limit.
pub fn check_message_len(len: u32) -> Result<(), Error> {
    if len > MAX_MESSAGE_LEN {
        Err(Error::Oversize {
            len,
            max: MAX_MESSAGE_LEN,
        })
    } else {
        Ok(())
    }
}

/// A cursor over a decoded message's payload bytes.
///
/// All integers are little-endian; strings are a 4-byte length prefix
/// followed by bytes, decoded as UTF-8 with a lossless ISO-8859-1 fallback
/// (every byte 0..=255 is a valid Latin-1 codepoint and therefore a valid
/// Rust `char`, so the fallback never itself fails).
#[derive(Clone, Debug)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn require(&self, n: usize) -> Result<(), Error> {
        if self.buf.remaining() < n {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        self.require(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        self.require(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        self.require(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        self.require(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        self.require(8)?;
        Ok(self.buf.get_i64_le())
    }

    /// Takes `n` raw bytes off the front of the cursor.
    pub fn read_raw(&mut self, n: usize) -> Result<Bytes, Error> {
        self.require(n)?;
        let out = self.buf.slice(0..n);
        self.buf.advance(n);
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let raw = self.read_raw(len)?;
        Ok(decode_string(&raw))
    }

    /// Skips a string without allocating it, returning the number of bytes
    /// consumed (4-byte length prefix plus payload). Used by
    /// [`peer::SlimSearchResponse`] to walk past file entries it doesn't
    /// need to fully decode yet.
    pub fn skip_string(&mut self) -> Result<(), Error> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)?;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn into_inner(self) -> Bytes {
        self.buf
    }
}

fn decode_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Builds up a message payload (code and length prefix are added
/// separately by [`frame`]).
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_u32(s.len() as u32);
        self.write_raw(s.as_bytes())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Prefixes `code` + `payload` with their combined length, producing a
/// complete frame ready to write to a socket.
pub fn frame(code: &[u8], payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + code.len() + payload.len());
    out.put_u32_le((code.len() + payload.len()) as u32);
    out.extend_from_slice(code);
    out.extend_from_slice(payload);
    out.freeze()
}
