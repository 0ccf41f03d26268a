// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Response and ACK construction from prior messages.
//!
//! Only the header fields the transaction layer is responsible for are
//! copied; everything else is the TU's business.

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    headers::Headers,
    method::Method,
    msg::{Request, RequestLine, Response, StatusLine},
};

/// Builds a response to `request` with the given status code.
///
/// Copies all Via headers plus From, To, Call-ID, and CSeq, per RFC 3261
/// §8.2.6.2. Used for the pre-formed 100 Trying and for synthetic
/// responses (408, 503) delivered to the TU.
pub fn make_response(request: &Request, code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = request.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    Response::new(StatusLine::new(code, SmolStr::new(reason)), headers, Bytes::new())
}

/// Builds the ACK for a non-2xx final response to `invite`, per RFC 3261
/// §17.1.1.3.
///
/// The ACK reuses the INVITE's Request-URI, top Via (same branch),
/// From, and Call-ID; the To comes from the response (it carries the
/// tag); CSeq keeps the INVITE's sequence number with method ACK.
pub fn make_failure_ack(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(from) = invite.headers.get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = response.headers.get("To").or_else(|| invite.headers.get("To")) {
        headers.push("To", to.clone());
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(cseq) = invite.headers.get("CSeq") {
        let number = cseq.split_whitespace().next().unwrap_or("1");
        headers.push("CSeq", format!("{number} ACK"));
    }
    Request::new(
        RequestLine::new(Method::Ack, invite.start.uri.clone()),
        headers,
        Bytes::new(),
    )
}
