// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;

use crate::{message::StunMessage, StunError};

/// Attribute-level wire codec, supplied by the embedding application.
///
/// `encode` must honor `StunMessage::hmac_key` by appending a
/// MESSAGE-INTEGRITY attribute; the engine sets `raw` on decoded
/// messages itself before verification.
pub trait StunCodec: Send + Sync + 'static {
    fn decode(&self, data: &[u8]) -> Result<StunMessage, StunError>;
    fn encode(&self, msg: &StunMessage) -> Bytes;
}
