// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP transaction layer (RFC 3261 §17).
//!
//! Sits between a Transaction User above and a transport below, adding
//! retransmission, response matching, and timeout behavior. The state
//! machines in [`fsm`] are pure; [`manager::TransactionCore`] owns the
//! transaction table, the event FIFO, and the timer fleet.

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

pub mod fsm;
pub mod manager;
pub mod timers;

pub use fsm::{Action, TxnEvent, TxnState};
pub use manager::{CoreConfig, Event, Sent, TransactionCore, TransactionSnapshot, Transport};
pub use timers::{TimerConfig, TimerKind};

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_branch_has_magic_cookie() {
        let branch = generate_branch_id();
        assert!(branch.starts_with("z9hG4bK"));
        assert!(branch.len() > "z9hG4bK".len());
    }

    #[test]
    fn generated_branches_are_distinct() {
        assert_ne!(generate_branch_id(), generate_branch_id());
    }
}
