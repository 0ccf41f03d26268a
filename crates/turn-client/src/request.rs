// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outstanding STUN request tracking and retransmission schedules
//! (RFC 3489-bis).
//!
//! Every outgoing request gets one [`RequestEntry`] keyed by its
//! 128-bit transaction id, carrying the retransmission state. The
//! schedule depends on the transport:
//! - **UDP**: start at RT0 and double on every expiry, except that the
//!   final transmission's window is pinned to RT0·16. With the default
//!   values that is 100, 200, 400, 800, 1600, 3200, 1600 ms: seven
//!   transmissions and 7.9 s total before the request is reported as
//!   `ResponseTimeout`.
//! - **TCP/TLS**: the kernel retransmits, so a single transmission
//!   waits out the full 7.9 s response time.
//!
//! # RFC 3489-bis-11 §7.2.1 - Retransmission over UDP
//!
//! > A client SHOULD retransmit a STUN request message starting with an
//! > interval of RTO, doubling after each retransmission. [...]
//! > Retransmissions continue until a response is received, or until a
//! > total of 7 requests have been sent. If, after the last request, a
//! > duration equal to 16 times the RTO passes without a response, the
//! > client SHOULD consider the transaction to have failed.
//!
//! An RTO of 100 ms is the recommended starting point for fixed-line
//! transports; estimating it on the fly from observed round trips is a
//! possible refinement the drafts allow.
//!
//! # Usage
//!
//! ```rust
//! use turn_client::{udp_timeout_schedule, StunTimers};
//!
//! let schedule = udp_timeout_schedule(&StunTimers::default());
//! let millis: Vec<u128> = schedule.iter().map(|d| d.as_millis()).collect();
//!
//! // One entry per transmission, the last pinned to RT0*16.
//! assert_eq!(millis, vec![100, 200, 400, 800, 1600, 3200, 1600]);
//!
//! // Total elapsed before ResponseTimeout.
//! assert_eq!(millis.iter().sum::<u128>(), 7900);
//! ```

use std::time::Duration;

use stun_core::{StunMessage, TransportProtocol};
use tokio::sync::oneshot;

/// Retransmission timing, all configurable.
///
/// # Examples
///
/// ```
/// use turn_client::StunTimers;
/// use std::time::Duration;
///
/// let timers = StunTimers::default();
/// assert_eq!(timers.rt0, Duration::from_millis(100));
/// assert_eq!(timers.max_retransmits, 7);
/// assert_eq!(timers.tcp_timeout, Duration::from_millis(7900));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunTimers {
    /// Initial UDP retransmission timeout.
    pub rt0: Duration,
    /// Maximum number of transmissions of one UDP request.
    pub max_retransmits: u32,
    /// Single-shot response timeout on stream transports.
    pub tcp_timeout: Duration,
}

impl Default for StunTimers {
    fn default() -> Self {
        Self {
            rt0: Duration::from_millis(100),
            max_retransmits: 7,
            tcp_timeout: Duration::from_millis(7900),
        }
    }
}

impl StunTimers {
    /// Timeout armed when a request is first transmitted.
    ///
    /// ```
    /// use turn_client::StunTimers;
    /// use stun_core::TransportProtocol;
    /// use std::time::Duration;
    ///
    /// let timers = StunTimers::default();
    /// assert_eq!(timers.initial_timeout(TransportProtocol::Udp), Duration::from_millis(100));
    /// assert_eq!(timers.initial_timeout(TransportProtocol::Tcp), Duration::from_millis(7900));
    /// ```
    pub fn initial_timeout(&self, protocol: TransportProtocol) -> Duration {
        if protocol == TransportProtocol::Udp {
            self.rt0
        } else {
            self.tcp_timeout
        }
    }

    /// The interval before the last transmission times out, RT0·16.
    pub fn final_interval(&self) -> Duration {
        self.rt0.saturating_mul(16)
    }

    /// Timeout to arm after the transmission numbered `sent` (1-based):
    /// doubling, with the last transmission's window pinned to RT0·16.
    ///
    /// ```
    /// use turn_client::StunTimers;
    /// use std::time::Duration;
    ///
    /// let timers = StunTimers::default();
    /// // Mid-ladder the interval doubles.
    /// assert_eq!(timers.next_timeout(Duration::from_millis(100), 2), Duration::from_millis(200));
    /// // The seventh and last transmission waits RT0*16.
    /// assert_eq!(timers.next_timeout(Duration::from_millis(3200), 7), Duration::from_millis(1600));
    /// ```
    pub fn next_timeout(&self, current: Duration, sent: u32) -> Duration {
        if sent == self.max_retransmits {
            self.final_interval()
        } else {
            current.saturating_mul(2)
        }
    }
}

/// One outstanding request, keyed by its 128-bit transaction id.
///
/// Destroyed on response match, on auth retry (the rebuilt request owns
/// a fresh entry), or on final timeout.
pub(crate) struct RequestEntry {
    pub message: StunMessage,
    pub timeout: Duration,
    /// Transmissions so far, counting the initial send.
    pub attempts: u32,
    /// An authentication challenge may rebuild this request exactly
    /// once; a second challenge is a real failure.
    pub auth_retried: bool,
    pub cancel: Option<oneshot::Sender<()>>,
}

impl RequestEntry {
    pub fn new(message: StunMessage, timeout: Duration, auth_retried: bool) -> Self {
        Self {
            message,
            timeout,
            attempts: 1,
            auth_retried,
            cancel: None,
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

/// The full UDP timeout ladder, one entry per transmission.
pub fn udp_timeout_schedule(timers: &StunTimers) -> Vec<Duration> {
    let mut schedule = vec![timers.rt0];
    let mut current = timers.rt0;
    for sent in 2..=timers.max_retransmits {
        current = timers.next_timeout(current, sent);
        schedule.push(current);
    }
    schedule
}
