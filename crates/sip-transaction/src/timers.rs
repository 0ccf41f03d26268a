// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction timer identities and base durations (RFC 3261 §17).
//!
//! Every transaction machine owns a small fleet of one-shot timers;
//! which of them are armed, and for how long, depends on the transport
//! the transaction runs over:
//! - **Unreliable transports (UDP)**: the full schedule, including the
//!   retransmission timers A/E1/E2/G and the post-final wait states.
//! - **Reliable transports (TCP/TLS)**: the kernel retransmits, so the
//!   machines never arm a retransmission timer, and instead of waiting
//!   out Timer D/I/J/K after a final they destroy immediately.
//!
//! # RFC 3261 §17.1.2.2 - Retransmission over unreliable transports
//!
//! > For unreliable transports, requests are retransmitted at an
//! > exponentially increasing rate, starting at T1 and doubling on each
//! > retransmission until the interval reaches T2. T1 is an estimate of
//! > the round-trip time, and it defaults to 500 ms. [...] The
//! > transaction itself is abandoned after 64*T1 without an answer.
//!
//! # Usage
//!
//! ```rust
//! use sip_transaction::timers::TimerConfig;
//! use std::time::Duration;
//!
//! let cfg = TimerConfig::default();
//!
//! // Timers B, F, H, and J all run at the transaction lifetime.
//! assert_eq!(cfg.lifetime(), Duration::from_secs(32));
//!
//! // The retransmission back-off doubles and saturates at T2.
//! let mut interval = cfg.t1;
//! let mut observed = Vec::new();
//! for _ in 0..5 {
//!     interval = cfg.backoff(interval);
//!     observed.push(interval.as_millis());
//! }
//! assert_eq!(observed, vec![1000, 2000, 4000, 4000, 4000]);
//! ```
//!
//! ## Timer summary
//!
//! ### Client non-INVITE transactions:
//! - **Timer E1** (retransmission, Trying): T1, doubling, capped at T2
//! - **Timer E2** (retransmission, Proceeding): flat T2
//! - **Timer F** (transaction timeout): 64*T1, synthesizes a 408
//! - **Timer K** (wait for response retransmissions): T4
//!
//! ### Client INVITE transactions:
//! - **Timer A** (retransmission): T1, doubling, capped at T2
//! - **Timer B** (transaction timeout): 64*T1, synthesizes a 408
//! - **Timer D** (wait for response retransmissions): TD, 32 s
//!
//! ### Server INVITE transactions:
//! - **Timer Trying** (delayed 100): T100, 200 ms
//! - **Timer G** (response retransmission): T1, doubling, capped at T2
//! - **Timer H** (wait for ACK): 64*T1
//! - **Timer I** (absorb ACK retransmissions): T4
//!
//! ### Server non-INVITE transactions:
//! - **Timer J** (absorb request retransmissions): 64*T1
//!
//! ### Stale transactions:
//! - **Timer Stale** (2xx retention): TS, 32 s

use std::time::Duration;

/// One-shot timers referenced by the transaction state machines.
///
/// E is split into its Trying-phase (doubling) and Proceeding-phase
/// (fixed T2) variants; `Trying` is the server-INVITE 100 delay and
/// `Stale` the retention timer absorbing duplicate 2xx retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    A,
    B,
    D,
    E1,
    E2,
    F,
    G,
    H,
    I,
    J,
    K,
    Trying,
    Stale,
}

/// Base timer values, all configurable. Defaults per RFC 3261 Table 4,
/// with T100 (server INVITE 100-Trying delay) and TS (stale transaction
/// retention) from the classic resiprocate values.
///
/// # Examples
///
/// ```
/// use sip_transaction::timers::TimerConfig;
/// use std::time::Duration;
///
/// let cfg = TimerConfig { t1: Duration::from_secs(1), ..TimerConfig::default() };
/// assert_eq!(cfg.lifetime(), Duration::from_secs(64));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Round-trip estimate.
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE requests.
    pub t2: Duration,
    /// Maximum duration a message remains in the network.
    pub t4: Duration,
    /// Delay before a server INVITE transaction emits its 100 Trying.
    pub t100: Duration,
    /// Wait for response retransmissions after a non-2xx INVITE final.
    pub td: Duration,
    /// Stale transaction retention.
    pub ts: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t100: Duration::from_millis(200),
            td: Duration::from_secs(32),
            ts: Duration::from_secs(32),
        }
    }
}

impl TimerConfig {
    /// Transaction lifetime, 64·T1. Used by Timers B, F, H, and J.
    ///
    /// ```
    /// use sip_transaction::timers::TimerConfig;
    /// use std::time::Duration;
    ///
    /// assert_eq!(TimerConfig::default().lifetime(), Duration::from_secs(32));
    /// ```
    pub fn lifetime(&self) -> Duration {
        self.t1.saturating_mul(64)
    }

    /// Next retransmission interval: doubled, capped at T2. Drives the
    /// Timer A/E1/G back-off schedules.
    ///
    /// ```
    /// use sip_transaction::timers::TimerConfig;
    /// use std::time::Duration;
    ///
    /// let cfg = TimerConfig::default();
    /// assert_eq!(cfg.backoff(Duration::from_millis(500)), Duration::from_secs(1));
    /// // Saturated: already at T2.
    /// assert_eq!(cfg.backoff(Duration::from_secs(4)), Duration::from_secs(4));
    /// ```
    pub fn backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.t2)
    }
}
