// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-allocation channel bookkeeping.
//!
//! A remote peer exists once local traffic referenced it or a data
//! indication arrived from it. Each peer carries one client→server
//! channel (allocated locally from a monotonic counter) and learns its
//! server→client channel from the first inbound data indication.

use std::collections::HashMap;

use stun_core::{MIN_CHANNEL_NUMBER, StunTuple};

/// One remote peer reachable through the allocation.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    peer_tuple: StunTuple,
    c2s_channel: u16,
    s2c_channel: Option<u16>,
    c2s_confirmed: bool,
    s2c_confirmed: bool,
}

impl RemotePeer {
    fn new(peer_tuple: StunTuple, c2s_channel: u16) -> Self {
        Self {
            peer_tuple,
            c2s_channel,
            s2c_channel: None,
            c2s_confirmed: false,
            s2c_confirmed: false,
        }
    }

    pub fn peer_tuple(&self) -> StunTuple {
        self.peer_tuple
    }

    pub fn c2s_channel(&self) -> u16 {
        self.c2s_channel
    }

    pub fn s2c_channel(&self) -> Option<u16> {
        self.s2c_channel
    }

    pub fn c2s_confirmed(&self) -> bool {
        self.c2s_confirmed
    }

    pub fn s2c_confirmed(&self) -> bool {
        self.s2c_confirmed
    }

    pub fn set_c2s_confirmed(&mut self) {
        self.c2s_confirmed = true;
    }
}

/// Bidirectional peer/channel indexes for one allocation.
#[derive(Debug)]
pub struct ChannelManager {
    /// Wider than a channel number so exhaustion is a state, not a
    /// wrap-around onto a channel already handed out.
    next_channel: u32,
    by_address: HashMap<StunTuple, RemotePeer>,
    c2s_index: HashMap<u16, StunTuple>,
    s2c_index: HashMap<u16, StunTuple>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            next_channel: MIN_CHANNEL_NUMBER as u32,
            by_address: HashMap::new(),
            c2s_index: HashMap::new(),
            s2c_index: HashMap::new(),
        }
    }

    /// Looks up a peer by its address, creating it (and allocating its
    /// client→server channel) if this is the first reference.
    ///
    /// Channel numbers are monotonic and never reissued; once the
    /// range is spent, new peers get `None` while existing peers stay
    /// reachable.
    pub fn find_or_create(&mut self, tuple: StunTuple) -> Option<&mut RemotePeer> {
        if !self.by_address.contains_key(&tuple) {
            let channel = u16::try_from(self.next_channel).ok()?;
            self.next_channel += 1;
            self.c2s_index.insert(channel, tuple);
            self.by_address.insert(tuple, RemotePeer::new(tuple, channel));
        }
        self.by_address.get_mut(&tuple)
    }

    pub fn peer_by_address(&self, tuple: &StunTuple) -> Option<&RemotePeer> {
        self.by_address.get(tuple)
    }

    pub fn peer_by_address_mut(&mut self, tuple: &StunTuple) -> Option<&mut RemotePeer> {
        self.by_address.get_mut(tuple)
    }

    pub fn peer_by_c2s(&self, channel: u16) -> Option<&RemotePeer> {
        self.c2s_index
            .get(&channel)
            .and_then(|tuple| self.by_address.get(tuple))
    }

    pub fn peer_by_c2s_mut(&mut self, channel: u16) -> Option<&mut RemotePeer> {
        let tuple = *self.c2s_index.get(&channel)?;
        self.by_address.get_mut(&tuple)
    }

    pub fn peer_by_s2c(&self, channel: u16) -> Option<&RemotePeer> {
        self.s2c_index
            .get(&channel)
            .and_then(|tuple| self.by_address.get(tuple))
    }

    /// Records the server→client channel learned from the first data
    /// indication and marks it confirmed.
    pub fn learn_s2c_channel(&mut self, tuple: &StunTuple, channel: u16) {
        if let Some(peer) = self.by_address.get_mut(tuple) {
            peer.s2c_channel = Some(channel);
            peer.s2c_confirmed = true;
            self.s2c_index.insert(channel, *tuple);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use stun_core::TransportProtocol;

    use super::*;

    fn tuple(last_octet: u8, port: u16) -> StunTuple {
        StunTuple::new(
            TransportProtocol::Udp,
            IpAddr::V4(Ipv4Addr::new(5, 6, 7, last_octet)),
            port,
        )
    }

    #[test]
    fn channels_start_above_reserved_range_and_increase() {
        let mut mgr = ChannelManager::new();
        let first = mgr.find_or_create(tuple(1, 9000)).unwrap().c2s_channel();
        let second = mgr.find_or_create(tuple(2, 9000)).unwrap().c2s_channel();
        assert_eq!(first, 0x4000);
        assert_eq!(second, 0x4001);
    }

    #[test]
    fn find_or_create_reuses_existing_peers() {
        let mut mgr = ChannelManager::new();
        let channel = mgr.find_or_create(tuple(1, 9000)).unwrap().c2s_channel();
        assert_eq!(
            mgr.find_or_create(tuple(1, 9000)).unwrap().c2s_channel(),
            channel
        );
        assert_eq!(mgr.peer_by_c2s(channel).map(|p| p.peer_tuple()), Some(tuple(1, 9000)));
    }

    #[test]
    fn s2c_channel_is_learned_once_and_indexed() {
        let mut mgr = ChannelManager::new();
        let addr = tuple(1, 9000);
        mgr.find_or_create(addr).unwrap();
        assert!(!mgr.find_or_create(addr).unwrap().s2c_confirmed());

        mgr.learn_s2c_channel(&addr, 0x8000);
        let peer = mgr.peer_by_address(&addr).unwrap();
        assert_eq!(peer.s2c_channel(), Some(0x8000));
        assert!(peer.s2c_confirmed());
        assert_eq!(
            mgr.peer_by_s2c(0x8000).map(|p| p.peer_tuple()),
            Some(addr)
        );
    }

    #[test]
    fn c2s_confirmation_is_sticky() {
        let mut mgr = ChannelManager::new();
        let addr = tuple(3, 9000);
        mgr.find_or_create(addr).unwrap().set_c2s_confirmed();
        assert!(mgr.peer_by_address(&addr).unwrap().c2s_confirmed());
    }

    #[test]
    fn exhausted_counter_never_reissues_a_channel() {
        let mut mgr = ChannelManager::new();
        let span = (u16::MAX - MIN_CHANNEL_NUMBER) as u32;
        for i in 0..=span {
            let addr = StunTuple::new(
                TransportProtocol::Udp,
                IpAddr::V4(Ipv4Addr::new(10, 1, (i >> 8) as u8, i as u8)),
                (i % 4) as u16 + 1,
            );
            let channel = mgr.find_or_create(addr).unwrap().c2s_channel();
            assert_eq!(channel as u32, MIN_CHANNEL_NUMBER as u32 + i);
        }

        // The range is spent: a new peer gets no channel rather than a
        // wrapped number that already maps to someone else.
        let latecomer = StunTuple::new(
            TransportProtocol::Udp,
            IpAddr::V4(Ipv4Addr::new(11, 0, 0, 1)),
            9000,
        );
        assert!(mgr.find_or_create(latecomer).is_none());
        assert!(mgr.peer_by_address(&latecomer).is_none());

        // Existing peers are unaffected.
        let first = StunTuple::new(
            TransportProtocol::Udp,
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0)),
            1,
        );
        assert_eq!(
            mgr.find_or_create(first).map(|p| p.c2s_channel()),
            Some(0x4000)
        );
        assert_eq!(mgr.peer_by_c2s(u16::MAX).map(|p| p.peer_tuple().port), Some(4));
    }
}
