// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::IpAddr;

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    integrity, ErrorCode, StunClass, StunMethod, StunTuple, TransactionId, TransportProtocol,
};

/// A STUN/TURN message as typed values.
///
/// Absent attributes are `None`; the codec encodes only what is set.
/// `hmac_key` instructs the codec to append MESSAGE-INTEGRITY on
/// encode; `message_integrity`/`raw` carry the received digest and the
/// bytes it covers for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct StunMessage {
    pub class: StunClass,
    pub method: StunMethod,
    pub tid: TransactionId,

    pub username: Option<SmolStr>,
    pub password: Option<SmolStr>,
    pub realm: Option<SmolStr>,
    pub nonce: Option<SmolStr>,
    pub error_code: Option<ErrorCode>,

    pub mapped_address: Option<StunTuple>,
    pub xor_mapped_address: Option<StunTuple>,
    pub relay_address: Option<StunTuple>,
    pub peer_address: Option<StunTuple>,

    pub channel_number: Option<u16>,
    pub lifetime: Option<u32>,
    pub bandwidth: Option<u32>,
    pub requested_transport: Option<TransportProtocol>,
    pub requested_ip: Option<IpAddr>,
    /// `(props, port)` of the REQUESTED-PORT-PROPS attribute.
    pub requested_port_props: Option<(u16, u16)>,

    pub data: Option<Bytes>,

    pub hmac_key: Option<SmolStr>,
    pub message_integrity: Option<[u8; 20]>,
    pub raw: Option<Bytes>,
}

impl StunMessage {
    fn bare(class: StunClass, method: StunMethod, tid: TransactionId) -> Self {
        Self {
            class,
            method,
            tid,
            username: None,
            password: None,
            realm: None,
            nonce: None,
            error_code: None,
            mapped_address: None,
            xor_mapped_address: None,
            relay_address: None,
            peer_address: None,
            channel_number: None,
            lifetime: None,
            bandwidth: None,
            requested_transport: None,
            requested_ip: None,
            requested_port_props: None,
            data: None,
            hmac_key: None,
            message_integrity: None,
            raw: None,
        }
    }

    /// New request with a fresh transaction id.
    pub fn request(method: StunMethod) -> Self {
        Self::bare(StunClass::Request, method, TransactionId::generate())
    }

    /// New indication with a fresh transaction id.
    pub fn indication(method: StunMethod) -> Self {
        Self::bare(StunClass::Indication, method, TransactionId::generate())
    }

    /// Success response correlated to the given transaction id.
    pub fn success_response(method: StunMethod, tid: TransactionId) -> Self {
        Self::bare(StunClass::SuccessResponse, method, tid)
    }

    /// Error response correlated to the given transaction id.
    pub fn error_response(
        method: StunMethod,
        tid: TransactionId,
        code: u16,
        reason: &str,
    ) -> Self {
        let mut msg = Self::bare(StunClass::ErrorResponse, method, tid);
        msg.error_code = Some(ErrorCode::from_code(code, reason));
        msg
    }

    pub fn is_request(&self) -> bool {
        self.class == StunClass::Request
    }

    pub fn is_success(&self) -> bool {
        self.class == StunClass::SuccessResponse
    }

    /// Re-keys the message under a new transaction id. Used when an
    /// authentication challenge turns one request into a new one.
    pub fn refresh_tid(&mut self) {
        self.tid = TransactionId::generate();
    }

    /// Verifies MESSAGE-INTEGRITY against `key`.
    ///
    /// Messages without the attribute pass: challenge traffic predates
    /// the key. A message carrying the attribute must have its raw
    /// encoding available and match.
    pub fn verify_integrity(&self, key: &str) -> bool {
        let Some(digest) = &self.message_integrity else {
            return true;
        };
        if key.is_empty() {
            return true;
        }
        match &self.raw {
            Some(raw) => integrity::verify(raw, key.as_bytes(), digest),
            None => false,
        }
    }
}
