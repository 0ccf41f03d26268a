// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal SIP message model for the transaction layer.
//!
//! Full parsing and serialization live outside this workspace; the
//! transaction machines only need methods, status codes, a handful of
//! headers, and the transaction id derived from the top Via branch.

pub mod builders;
pub mod headers;
pub mod method;
pub mod msg;
pub mod txn_id;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, SipMessage, StatusLine};
pub use txn_id::{branch_from_via, cseq_method, transaction_id, TransactionId};
