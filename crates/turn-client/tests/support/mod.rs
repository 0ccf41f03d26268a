// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-memory doubles for the engine's three seams.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use stun_core::{
    decode_frame, StunCodec, StunError, StunMessage, StunTuple, TransportProtocol, STUN_CHANNEL,
};
use turn_client::{RelayTransport, TurnError, TurnHandler};

/// Wire codec double. Attribute encoding is outside the engine, so the
/// "encoding" is an 8-byte handle into a registry of messages; decoding
/// looks the handle back up. The handle's leading byte is zero, which
/// also satisfies the unframed STUN classifier.
#[derive(Default)]
pub struct RegistryCodec {
    next: AtomicU64,
    by_key: Mutex<HashMap<u64, StunMessage>>,
}

impl RegistryCodec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an inbound message and returns its wire form.
    pub fn wire_bytes(&self, msg: &StunMessage) -> Bytes {
        self.register(msg)
    }

    fn register(&self, msg: &StunMessage) -> Bytes {
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_key.lock().unwrap().insert(key, msg.clone());
        Bytes::copy_from_slice(&key.to_be_bytes())
    }
}

impl StunCodec for RegistryCodec {
    fn decode(&self, data: &[u8]) -> Result<StunMessage, StunError> {
        let key: [u8; 8] = data
            .try_into()
            .map_err(|_| StunError::Malformed(SmolStr::new("bad handle length")))?;
        self.by_key
            .lock()
            .unwrap()
            .get(&u64::from_be_bytes(key))
            .cloned()
            .ok_or_else(|| StunError::Malformed(SmolStr::new("unknown handle")))
    }

    fn encode(&self, msg: &StunMessage) -> Bytes {
        self.register(msg)
    }
}

/// Recording transport double.
pub struct TestRelayTransport {
    local: StunTuple,
    server: StunTuple,
    connected: bool,
    pub sent: Mutex<Vec<(StunTuple, Bytes)>>,
    pub closed: AtomicBool,
}

impl TestRelayTransport {
    fn over(protocol: TransportProtocol, connected: bool) -> Arc<Self> {
        Arc::new(Self {
            local: StunTuple::new(protocol, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 40000),
            server: StunTuple::new(protocol, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 3478),
            connected,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn udp() -> Arc<Self> {
        Self::over(TransportProtocol::Udp, true)
    }

    pub fn tcp() -> Arc<Self> {
        Self::over(TransportProtocol::Tcp, true)
    }

    pub fn disconnected_udp() -> Arc<Self> {
        Self::over(TransportProtocol::Udp, false)
    }

    pub fn server(&self) -> StunTuple {
        self.server
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_at(&self, index: usize) -> (StunTuple, Bytes) {
        self.sent.lock().unwrap()[index].clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTransport for TestRelayTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn local_binding(&self) -> StunTuple {
        self.local
    }

    fn connected_tuple(&self) -> StunTuple {
        self.server
    }

    async fn send(&self, dest: StunTuple, data: Bytes) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((dest, data));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Everything the engine reported upward, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    BindOk(StunTuple),
    BindErr(TurnError),
    AllocOk {
        relay: Option<StunTuple>,
        lifetime: u32,
    },
    AllocErr(TurnError),
    RefreshOk(u32),
    RefreshErr(TurnError),
    SharedSecretOk(SmolStr, SmolStr),
    SharedSecretErr(TurnError),
    SetDestOk,
    SetDestErr(TurnError),
    ClearDestOk,
    ClearDestErr(TurnError),
    RecvOk {
        address: IpAddr,
        port: u16,
        data: Bytes,
    },
    RecvErr(TurnError),
}

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: HandlerEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for(
        &self,
        pred: impl Fn(&HandlerEvent) -> bool,
        timeout: Duration,
    ) -> HandlerEvent {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.lock().unwrap().iter().find(|&e| pred(e)).cloned() {
                return event;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for handler event; got {:?}", self.events());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TurnHandler for RecordingHandler {
    async fn on_bind_success(&self, reflexive: StunTuple) {
        self.push(HandlerEvent::BindOk(reflexive));
    }

    async fn on_bind_failure(&self, error: TurnError) {
        self.push(HandlerEvent::BindErr(error));
    }

    async fn on_allocation_success(
        &self,
        _reflexive: Option<StunTuple>,
        relay: Option<StunTuple>,
        lifetime: u32,
        _bandwidth: u32,
    ) {
        self.push(HandlerEvent::AllocOk { relay, lifetime });
    }

    async fn on_allocation_failure(&self, error: TurnError) {
        self.push(HandlerEvent::AllocErr(error));
    }

    async fn on_refresh_success(&self, lifetime: u32) {
        self.push(HandlerEvent::RefreshOk(lifetime));
    }

    async fn on_refresh_failure(&self, error: TurnError) {
        self.push(HandlerEvent::RefreshErr(error));
    }

    async fn on_shared_secret_success(&self, username: SmolStr, password: SmolStr) {
        self.push(HandlerEvent::SharedSecretOk(username, password));
    }

    async fn on_shared_secret_failure(&self, error: TurnError) {
        self.push(HandlerEvent::SharedSecretErr(error));
    }

    async fn on_set_active_destination_success(&self) {
        self.push(HandlerEvent::SetDestOk);
    }

    async fn on_set_active_destination_failure(&self, error: TurnError) {
        self.push(HandlerEvent::SetDestErr(error));
    }

    async fn on_clear_active_destination_success(&self) {
        self.push(HandlerEvent::ClearDestOk);
    }

    async fn on_clear_active_destination_failure(&self, error: TurnError) {
        self.push(HandlerEvent::ClearDestErr(error));
    }

    async fn on_receive_success(&self, address: IpAddr, port: u16, data: Bytes) {
        self.push(HandlerEvent::RecvOk {
            address,
            port,
            data,
        });
    }

    async fn on_receive_failure(&self, error: TurnError) {
        self.push(HandlerEvent::RecvErr(error));
    }
}

/// Unwraps a framed STUN message the engine sent.
pub fn decode_sent_stun(codec: &RegistryCodec, data: &Bytes) -> StunMessage {
    let frame = decode_frame(data).expect("engine output is framed");
    assert_eq!(frame.channel, STUN_CHANNEL, "expected an embedded STUN message");
    codec.decode(&frame.payload).expect("engine output decodes")
}
