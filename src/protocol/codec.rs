//! MQTT 3.1.1 framing primitives
//!
//! Pure functions for the fixed header and the variable-length
//! "remaining length" integer. Nothing in this module performs I/O.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Largest value representable in four remaining-length bytes.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Control packet types of MQTT 3.1.1 (high nibble of the fixed header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// Encoding and decoding failures. An incomplete frame is not an error, see [`decode_remaining_length`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed remaining length: more than 4 bytes")]
    MalformedRemainingLength,
    #[error("Remaining length {0} exceeds the MQTT maximum")]
    RemainingLengthTooLarge(usize),
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),
    #[error("Unsupported packet type: {0:?}")]
    UnsupportedPacketType(PacketType),
    #[error("Field of {0} bytes does not fit a 16-bit length prefix")]
    FieldTooLong(usize),
    #[error("Malformed {packet:?} packet: {reason}")]
    Malformed {
        packet: PacketType,
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn malformed<S: Into<String>>(packet: PacketType, reason: S) -> Self {
        Self::Malformed {
            packet,
            reason: reason.into(),
        }
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    /// Byte length of variable header plus payload
    pub remaining_length: usize,
    /// Byte length of the fixed header itself (1 + length bytes)
    pub header_length: usize,
}

impl FixedHeader {
    /// Total frame length on the wire
    pub fn frame_length(&self) -> usize {
        self.header_length + self.remaining_length
    }
}

/// Encode `length` as a base-128 varint (1 to 4 bytes, continuation bit 0x80)
pub fn encode_remaining_length(length: usize, out: &mut BytesMut) -> Result<(), CodecError> {
    if length > MAX_REMAINING_LENGTH as usize {
        return Err(CodecError::RemainingLengthTooLarge(length));
    }

    let mut value = length;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes `length` occupies once encoded
pub fn remaining_length_size(length: usize) -> usize {
    match length {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Decode a remaining-length varint from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the terminating byte,
/// `Ok(Some((value, bytes_used)))` otherwise.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (index, byte) in buf.iter().enumerate() {
        if index >= 4 {
            return Err(CodecError::MalformedRemainingLength);
        }
        value += (*byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        // Four continuation bytes: a fifth would be required
        return Err(CodecError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Parse the fixed header at the start of `buf`; `Ok(None)` if more input is needed
pub fn decode_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>, CodecError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let packet_type = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;

    match decode_remaining_length(&buf[1..])? {
        Some((remaining_length, used)) => Ok(Some(FixedHeader {
            packet_type,
            flags,
            remaining_length,
            header_length: 1 + used,
        })),
        None => Ok(None),
    }
}

/// Write the fixed header for a packet with the given body length
pub fn encode_fixed_header(
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
    out: &mut BytesMut,
) -> Result<(), CodecError> {
    out.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    encode_remaining_length(remaining_length, out)
}

/// Longest string or binary field a 16-bit length prefix can describe
pub const MAX_FIELD_LENGTH: usize = u16::MAX as usize;

/// Write a length-prefixed UTF-8 string
pub(crate) fn put_string(out: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    put_binary(out, value.as_bytes())
}

/// Write length-prefixed binary data
pub(crate) fn put_binary(out: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let length = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong(value.len()))?;
    out.put_u16(length);
    out.put_slice(value);
    Ok(())
}

/// Cursor over a packet body used by the decoders
pub(crate) struct Reader<'a> {
    packet: PacketType,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(packet: PacketType, buf: &'a [u8]) -> Self {
        Self { packet, buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| CodecError::malformed(self.packet, "truncated body"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        let high = self.u8()? as u16;
        let low = self.u8()? as u16;
        Ok((high << 8) | low)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::malformed(self.packet, "truncated body"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::malformed(self.packet, "invalid UTF-8 string"))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
