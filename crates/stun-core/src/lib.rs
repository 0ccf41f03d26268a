// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed STUN/TURN message model (RFC 3489-bis / behave-turn drafts).
//!
//! Wire-level attribute encoding is an external collaborator behind the
//! [`codec::StunCodec`] seam; this crate models messages as values,
//! implements the 4-byte channel framing, and carries the long-term
//! credential arithmetic.
//!
//! # Channel framing
//!
//! In channel mode every datagram carries a `(channel: u16, length:
//! u16)` big-endian prefix. Channel 0 frames an embedded STUN message;
//! anything else is peer data on that channel:
//!
//! ```rust
//! use stun_core::{decode_frame, encode_frame, STUN_CHANNEL};
//!
//! let framed = encode_frame(0x4000, b"payload").unwrap();
//! let frame = decode_frame(&framed).unwrap();
//! assert_eq!(frame.channel, 0x4000);
//! assert_eq!(frame.payload.as_ref(), b"payload");
//! assert_ne!(frame.channel, STUN_CHANNEL);
//! ```
//!
//! With framing disabled, a first byte of `0x00` or `0x01` (the class
//! bits of the STUN header) marks a possible STUN message and anything
//! else is raw data; see [`framing::looks_like_stun`].

use std::net::{IpAddr, Ipv4Addr};

use smol_str::SmolStr;

pub mod codec;
pub mod framing;
pub mod integrity;
pub mod message;

pub use codec::StunCodec;
pub use framing::{decode_frame, encode_frame, looks_like_stun, Frame, FRAME_HEADER_LEN, STUN_CHANNEL};
pub use integrity::long_term_key;
pub use message::StunMessage;

/// Sentinel meaning "do not encode a LIFETIME attribute".
pub const UNSPECIFIED_LIFETIME: u32 = 0xFFFF_FFFF;
/// Sentinel meaning "do not encode a BANDWIDTH attribute".
pub const UNSPECIFIED_BANDWIDTH: u32 = 0xFFFF_FFFF;
/// Sentinel meaning "do not encode a requested port".
pub const UNSPECIFIED_PORT: u16 = 0;
/// Sentinel meaning "no port properties requested".
pub const PORT_PROPS_NONE: u16 = 0;

/// First channel number handed out by the channel manager; everything
/// below is reserved by the TURN drafts (0 frames embedded STUN).
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;

/// Sentinel meaning "do not encode a REQUESTED-IP attribute".
pub fn unspecified_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Transport protocols a STUN tuple can ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    /// Stream transports retransmit in the kernel, not here.
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportProtocol::Tcp | TransportProtocol::Tls)
    }
}

/// A (protocol, address, port) triple naming one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StunTuple {
    pub protocol: TransportProtocol,
    pub address: IpAddr,
    pub port: u16,
}

impl StunTuple {
    pub fn new(protocol: TransportProtocol, address: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            address,
            port,
        }
    }
}

impl std::fmt::Display for StunTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}:{}", self.protocol, self.address, self.port)
    }
}

/// STUN message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// STUN/TURN methods the client engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunMethod {
    Bind,
    SharedSecret,
    Allocate,
    Refresh,
    Send,
    Data,
    ChannelConfirmation,
}

/// 128-bit STUN transaction id (magic cookie included, opaque here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u128);

impl TransactionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// STUN error-code attribute: class and number, `code()` is the usual
/// `class * 100 + number` form (401, 438, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub class: u8,
    pub number: u8,
    pub reason: SmolStr,
}

impl ErrorCode {
    pub fn from_code(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            class: (code / 100) as u8,
            number: (code % 100) as u8,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> u16 {
        self.class as u16 * 100 + self.number as u16
    }
}

/// Errors produced while interpreting STUN wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Message bytes did not decode to a valid STUN message.
    Malformed(SmolStr),
    /// Frame or message shorter than its header claims.
    Truncated,
    /// Channel-frame payload exceeds the u16 length field.
    FrameTooLong,
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed STUN message: {}", detail),
            Self::Truncated => write!(f, "truncated STUN frame"),
            Self::FrameTooLong => write!(f, "frame payload exceeds u16 length"),
        }
    }
}

impl std::error::Error for StunError {}
