// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TURN client engine (RFC 3489-bis / behave-turn drafts).
//!
//! [`TurnSocket`] establishes and maintains a media relay allocation,
//! frames application data over channels, and drives STUN request
//! retransmission with long-term digest authentication. Socket I/O and
//! attribute-level wire encoding stay behind the [`RelayTransport`] and
//! [`stun_core::StunCodec`] seams.

pub mod channels;
pub mod error;
pub mod handler;
pub mod request;
pub mod socket;

pub use channels::{ChannelManager, RemotePeer};
pub use error::TurnError;
pub use handler::TurnHandler;
pub use request::{udp_timeout_schedule, StunTimers};
pub use socket::{refresh_delay, AllocationParams, RelayTransport, TurnSocket};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn refresh_fires_at_five_eighths_of_lifetime() {
        assert_eq!(refresh_delay(600), Duration::from_secs(375));
        assert_eq!(refresh_delay(8), Duration::from_secs(5));
        assert_eq!(refresh_delay(0), Duration::ZERO);
    }
}
