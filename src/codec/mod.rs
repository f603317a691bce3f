//! MQTT Packet Codec
//!
//! Client-side MQTT v5.0 codec: encodes what a session sends to a broker
//! and decodes what the broker sends back.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest packet MQTT can frame: 1 byte header, 4 byte length, body
pub const MAX_PACKET_SIZE: usize = 1 + 4 + MAX_REMAINING_LENGTH;

/// Default cap on inbound packets, advertised to brokers in CONNECT
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a Variable Byte Integer from the start of `buf`.
/// Returns (value, bytes_consumed).
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;
    let mut shift = 0;

    for (pos, byte) in buf.iter().enumerate() {
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, pos + 1));
        }
        shift += 7;
    }

    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Write a Variable Byte Integer. Returns bytes written.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            return Ok(count);
        }
    }
}

/// Number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Write a length-prefixed UTF-8 string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Forward-only reader over a packet body.
///
/// Every read is bounds-checked; running off the end is a malformed packet
/// because the fixed header already promised the full body was present.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::InsufficientData);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_variable_int(&mut self) -> Result<u32, DecodeError> {
        let (value, len) = read_variable_int(&self.buf[self.pos..])?;
        self.pos += len;
        Ok(value)
    }

    pub fn read_binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let raw = self.read_binary()?;
        let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        if s.contains('\0') {
            return Err(DecodeError::MalformedPacket(
                "string contains null character",
            ));
        }
        Ok(s)
    }
}
