// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TURN channel framing: a 4-byte `(channel: u16 BE, length: u16 BE)`
//! prefix ahead of each payload. Channel 0 carries an embedded STUN
//! message; everything else is peer data on that channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::StunError;

/// Size of the channel framing prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Channel number framing an embedded STUN message.
pub const STUN_CHANNEL: u16 = 0;

/// A decoded channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u16,
    pub payload: Bytes,
}

/// Prefixes `payload` with the channel framing header.
pub fn encode_frame(channel: u16, payload: &[u8]) -> Result<Bytes, StunError> {
    if payload.len() > u16::MAX as usize {
        return Err(StunError::FrameTooLong);
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u16(channel);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Splits a framed datagram into channel and payload.
///
/// The length field must be covered by the buffer; a datagram shorter
/// than (or exactly) the header is an error, matching the engine's
/// `FrameError` drop rule.
pub fn decode_frame(data: &Bytes) -> Result<Frame, StunError> {
    if data.len() <= FRAME_HEADER_LEN {
        return Err(StunError::Truncated);
    }
    let mut header = &data[..FRAME_HEADER_LEN];
    let channel = header.get_u16();
    let length = header.get_u16() as usize;
    if FRAME_HEADER_LEN + length > data.len() {
        return Err(StunError::Truncated);
    }
    Ok(Frame {
        channel,
        payload: data.slice(FRAME_HEADER_LEN..FRAME_HEADER_LEN + length),
    })
}

/// When framing is disabled, a first byte of 0x00 or 0x01 marks a
/// possible STUN message (the class bits of the header); anything else
/// is raw data.
pub fn looks_like_stun(first_byte: u8) -> bool {
    first_byte == 0x00 || first_byte == 0x01
}
