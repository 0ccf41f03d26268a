// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Errors surfaced through the [`crate::TurnHandler`] failure callbacks
/// or logged on the drop paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnError {
    NotConnected,
    NoAllocation,
    AlreadyAllocated,
    InvalidRequestedTransport,
    MissingAttributes,
    BadMessageIntegrity,
    ErrorParsingMessage,
    FrameError,
    UnknownRemoteAddress,
    InvalidChannelNumberReceived,
    /// The per-allocation channel number range is spent; the counter
    /// is monotonic and never reissues a number.
    ChannelsExhausted,
    StrayResponse,
    ResponseTimeout,
    /// STUN error response passed through as `class * 100 + number`.
    ServerError(u16),
}

impl std::fmt::Display for TurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "socket is not connected"),
            Self::NoAllocation => write!(f, "no allocation exists"),
            Self::AlreadyAllocated => write!(f, "an allocation already exists"),
            Self::InvalidRequestedTransport => write!(f, "invalid requested relay transport"),
            Self::MissingAttributes => write!(f, "message is missing required attributes"),
            Self::BadMessageIntegrity => write!(f, "message integrity check failed"),
            Self::ErrorParsingMessage => write!(f, "could not parse message"),
            Self::FrameError => write!(f, "channel frame too short"),
            Self::UnknownRemoteAddress => write!(f, "data from unknown remote peer"),
            Self::InvalidChannelNumberReceived => write!(f, "channel number does not match peer"),
            Self::ChannelsExhausted => write!(f, "no channel numbers remain"),
            Self::StrayResponse => write!(f, "response matches no outstanding request"),
            Self::ResponseTimeout => write!(f, "request timed out"),
            Self::ServerError(code) => write!(f, "server error {}", code),
        }
    }
}

impl std::error::Error for TurnError {}
