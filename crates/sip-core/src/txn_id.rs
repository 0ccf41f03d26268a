// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction id derivation.
//!
//! A transaction id names one request/response exchange. It is derived
//! from the branch parameter of the top Via together with the method
//! (from the request line, or from CSeq for responses), so a CANCEL and
//! the INVITE it targets get distinct ids even though they share a
//! branch.

use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, msg::SipMessage};

/// Opaque identifier for a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(SmolStr);

impl TransactionId {
    /// Builds an id from a Via branch and a method.
    pub fn new(branch: &str, method: &Method) -> Self {
        Self(SmolStr::new(format!("{};{}", branch, method.as_str())))
    }

    /// Returns the id of the sibling transaction with the given method
    /// (same branch). Used to route a CANCEL or ACK to the INVITE
    /// transaction it targets, and to key an INVITE's CANCEL child.
    pub fn sibling(&self, method: &Method) -> Self {
        let branch = self.0.split(';').next().unwrap_or(self.0.as_str());
        Self::new(branch, method)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the method carried in the CSeq header, e.g. `"1 INVITE"`.
pub fn cseq_method(headers: &Headers) -> Option<Method> {
    let cseq = headers.get("CSeq")?;
    let token = cseq.split_whitespace().nth(1)?;
    Some(Method::from_token(token))
}

/// Derives the transaction id for a message, if it carries enough
/// context (top Via branch, plus CSeq for responses).
pub fn transaction_id(msg: &SipMessage) -> Option<TransactionId> {
    let via = msg.headers().get("Via")?;
    let branch = branch_from_via(via)?;
    let method = match msg {
        SipMessage::Request(req) => req.method().clone(),
        SipMessage::Response(res) => cseq_method(&res.headers)?,
    };
    Some(TransactionId::new(branch, &method))
}
