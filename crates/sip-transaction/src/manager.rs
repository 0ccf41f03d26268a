// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event dispatcher, transaction table, and timer service.
//!
//! All state changes flow through one FIFO drained by a single spawned
//! task: wire messages, TU messages, timer expiries, send reports, and
//! transport errors are [`Event`]s, and each handler runs to completion
//! before the next event is taken. Timers are one-shot tasks that post
//! their expiry back into the same FIFO, so a timer scheduled by a
//! handler can never fire before that handler returns.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, error, warn};

use sip_core::{
    builders::make_response, transaction_id, Method, SipMessage, TransactionId,
};

use crate::fsm::{
    Action, ClientInviteFsm, ClientNonInviteFsm, ServerInviteFsm, ServerNonInviteFsm, StaleFsm,
    TxnEvent, TxnState,
};
use crate::timers::{TimerConfig, TimerKind};

/// Transport send confirmation, reported back as an [`Event::Sent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Reliable,
    Unreliable,
}

/// Outbound transport consumed by the transaction core.
///
/// Serialization and socket handling live behind this seam; `send` is
/// fire-and-forget apart from the reliability report, `retransmit`
/// resends the exact bytes previously produced for the message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: &SipMessage) -> Result<Sent>;
    async fn retransmit(&self, msg: &SipMessage) -> Result<()>;
    fn is_reliable(&self) -> bool;
}

/// Events consumed by the dispatcher, one at a time.
#[derive(Debug)]
pub enum Event {
    WireSip(SipMessage),
    TuSip(SipMessage),
    Timer { id: TransactionId, kind: TimerKind },
    Sent { id: TransactionId, sent: Sent },
    TransportError { id: TransactionId },
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub timers: TimerConfig,
    /// Responses matching no transaction are dropped. Stateless
    /// forwarding is intentionally unimplemented; disabling this only
    /// changes the log level of the drop.
    pub discard_stray_responses: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            timers: TimerConfig::default(),
            discard_stray_responses: true,
        }
    }
}

enum Machine {
    ClientNonInvite(ClientNonInviteFsm),
    ClientInvite(ClientInviteFsm),
    ServerNonInvite(ServerNonInviteFsm),
    ServerInvite(ServerInviteFsm),
    Stale(StaleFsm),
}

impl Machine {
    fn on_event(&mut self, event: TxnEvent) -> Vec<Action> {
        match self {
            Machine::ClientNonInvite(fsm) => fsm.on_event(event),
            Machine::ClientInvite(fsm) => fsm.on_event(event),
            Machine::ServerNonInvite(fsm) => fsm.on_event(event),
            Machine::ServerInvite(fsm) => fsm.on_event(event),
            Machine::Stale(fsm) => fsm.on_event(event),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Machine::ClientNonInvite(_) => "ClientNonInvite",
            Machine::ClientInvite(_) => "ClientInvite",
            Machine::ServerNonInvite(_) => "ServerNonInvite",
            Machine::ServerInvite(_) => "ServerInvite",
            Machine::Stale(_) => "Stale",
        }
    }

    fn state(&self) -> TxnState {
        match self {
            Machine::ClientNonInvite(fsm) => fsm.state(),
            Machine::ClientInvite(fsm) => fsm.state(),
            Machine::ServerNonInvite(fsm) => fsm.state(),
            Machine::ServerInvite(fsm) => fsm.state(),
            Machine::Stale(_) => TxnState::Terminated,
        }
    }

    fn has_msg_to_retransmit(&self) -> bool {
        match self {
            Machine::ClientNonInvite(fsm) => fsm.msg_to_retransmit().is_some(),
            Machine::ClientInvite(fsm) => fsm.msg_to_retransmit().is_some(),
            Machine::ServerNonInvite(fsm) => fsm.msg_to_retransmit().is_some(),
            Machine::ServerInvite(fsm) => fsm.msg_to_retransmit().is_some(),
            Machine::Stale(_) => false,
        }
    }
}

struct TransactionEntry {
    machine: Machine,
    timers: HashMap<TimerKind, oneshot::Sender<()>>,
    cancel_child: Option<TransactionId>,
}

impl TransactionEntry {
    fn new(machine: Machine) -> Self {
        Self {
            machine,
            timers: HashMap::new(),
            cancel_child: None,
        }
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(cancel) = self.timers.remove(&kind) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

/// Read-only view of a transaction for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub machine: &'static str,
    pub state: TxnState,
    pub has_msg_to_retransmit: bool,
    pub armed_timers: Vec<TimerKind>,
    pub cancel_child: Option<TransactionId>,
}

/// Owns the transaction table and drives the state machines.
#[derive(Clone)]
pub struct TransactionCore {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    transport: Arc<dyn Transport>,
    config: CoreConfig,
    is_reliable: bool,
    table: DashMap<TransactionId, TransactionEntry>,
    event_tx: mpsc::UnboundedSender<Event>,
    tu_tx: mpsc::UnboundedSender<SipMessage>,
}

impl TransactionCore {
    /// Creates a core over the given transport. Returns the handle and
    /// the TU FIFO receiver; synthetic responses (100, 408, 503) arrive
    /// there as if from the wire.
    pub fn new(transport: Arc<dyn Transport>) -> (Self, mpsc::UnboundedReceiver<SipMessage>) {
        Self::with_config(transport, CoreConfig::default())
    }

    /// Creates a core with custom timers/config (test hook).
    pub fn with_config(
        transport: Arc<dyn Transport>,
        config: CoreConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SipMessage>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (tu_tx, tu_rx) = mpsc::unbounded_channel();
        let is_reliable = transport.is_reliable();
        let inner = Arc::new(CoreInner {
            transport,
            config,
            is_reliable,
            table: DashMap::new(),
            event_tx,
            tu_tx,
        });
        let worker = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                worker.process(event).await;
            }
        });
        (Self { inner }, tu_rx)
    }

    /// Enqueues a TU-originated message.
    pub fn submit(&self, msg: SipMessage) {
        let _ = self.inner.event_tx.send(Event::TuSip(msg));
    }

    /// Enqueues a message arriving from the wire.
    pub fn receive(&self, msg: SipMessage) {
        let _ = self.inner.event_tx.send(Event::WireSip(msg));
    }

    /// Enqueues a transport failure for the given transaction.
    pub fn report_transport_error(&self, id: TransactionId) {
        let _ = self.inner.event_tx.send(Event::TransportError { id });
    }

    /// Number of live transactions.
    pub fn transaction_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Returns true if a transaction with this id exists.
    pub fn contains(&self, id: &TransactionId) -> bool {
        self.inner.table.contains_key(id)
    }

    /// Snapshot of one transaction, if it exists.
    pub fn snapshot(&self, id: &TransactionId) -> Option<TransactionSnapshot> {
        self.inner.table.get(id).map(|entry| TransactionSnapshot {
            machine: entry.machine.kind(),
            state: entry.machine.state(),
            has_msg_to_retransmit: entry.machine.has_msg_to_retransmit(),
            armed_timers: entry.timers.keys().copied().collect(),
            cancel_child: entry.cancel_child.clone(),
        })
    }
}

fn to_txn_event(msg: SipMessage, from_tu: bool) -> TxnEvent {
    match (msg, from_tu) {
        (SipMessage::Request(req), true) => TxnEvent::TuRequest(req),
        (SipMessage::Request(req), false) => TxnEvent::WireRequest(req),
        (SipMessage::Response(res), true) => TxnEvent::TuResponse(res),
        (SipMessage::Response(res), false) => TxnEvent::WireResponse(res),
    }
}

impl CoreInner {
    async fn process(&self, event: Event) {
        match event {
            Event::TuSip(msg) => {
                // ACKs from the TU are not transactions (RFC 3261 §17.1):
                // straight to the wire.
                if let SipMessage::Request(req) = &msg {
                    if req.method() == &Method::Ack {
                        if let Err(e) = self.transport.send(&msg).await {
                            error!(error = %e, "failed to send TU ACK");
                        }
                        return;
                    }
                }
                self.route_or_create(msg, true).await;
            }
            Event::WireSip(msg) => self.route_or_create(msg, false).await,
            Event::Timer { id, kind } => {
                let known = match self.table.get_mut(&id) {
                    Some(mut entry) => {
                        entry.timers.remove(&kind);
                        true
                    }
                    None => false,
                };
                if known {
                    self.dispatch(&id, TxnEvent::Timer(kind)).await;
                } else {
                    debug!(%id, ?kind, "timer fired for finished transaction");
                }
            }
            Event::Sent { id, sent } => {
                self.dispatch(
                    &id,
                    TxnEvent::Sent {
                        reliable: sent == Sent::Reliable,
                    },
                )
                .await;
            }
            Event::TransportError { id } => {
                warn!(%id, "transport error");
                self.dispatch(&id, TxnEvent::TransportError).await;
            }
        }
    }

    async fn route_or_create(&self, msg: SipMessage, from_tu: bool) {
        let Some(natural_id) = transaction_id(&msg) else {
            debug!(from_tu, "discarding message without transaction id");
            return;
        };
        let method = msg.as_request().map(|req| req.method().clone());

        // CANCEL and ACK requests target the INVITE transaction sharing
        // their branch (RFC 3261 §17.2.3).
        let route_id = match method {
            Some(Method::Cancel) | Some(Method::Ack) => {
                let invite_id = natural_id.sibling(&Method::Invite);
                if self.table.contains_key(&invite_id) {
                    invite_id
                } else {
                    natural_id.clone()
                }
            }
            _ => natural_id.clone(),
        };

        if self.table.contains_key(&route_id) {
            if method == Some(Method::Cancel) && route_id != natural_id {
                self.handle_cancel(&route_id, natural_id, msg, from_tu).await;
            } else {
                self.dispatch(&route_id, to_txn_event(msg, from_tu)).await;
            }
            return;
        }

        match (msg, from_tu) {
            (SipMessage::Request(req), false) => {
                debug!(id = %natural_id, method = %req.method(), "new server transaction");
                if req.method() == &Method::Invite {
                    let hundred = make_response(&req, 100, "Trying");
                    let fsm =
                        ServerInviteFsm::new(self.config.timers, self.is_reliable, hundred);
                    self.table
                        .insert(natural_id.clone(), TransactionEntry::new(Machine::ServerInvite(fsm)));
                    self.schedule_timer(&natural_id, TimerKind::Trying, self.config.timers.t100);
                } else {
                    let fsm = ServerNonInviteFsm::new(self.config.timers, self.is_reliable);
                    self.table.insert(
                        natural_id.clone(),
                        TransactionEntry::new(Machine::ServerNonInvite(fsm)),
                    );
                }
                let _ = self.tu_tx.send(SipMessage::Request(req));
            }
            (SipMessage::Request(req), true) => {
                debug!(id = %natural_id, method = %req.method(), "new client transaction");
                let machine = if req.method() == &Method::Invite {
                    Machine::ClientInvite(ClientInviteFsm::new(
                        self.config.timers,
                        self.is_reliable,
                    ))
                } else {
                    Machine::ClientNonInvite(ClientNonInviteFsm::new(
                        self.config.timers,
                        self.is_reliable,
                    ))
                };
                self.table
                    .insert(natural_id.clone(), TransactionEntry::new(machine));
                self.dispatch(&natural_id, TxnEvent::TuRequest(req)).await;
            }
            (SipMessage::Response(res), false) => {
                if self.config.discard_stray_responses {
                    debug!(id = %natural_id, code = res.code(), "discarding stray response");
                } else {
                    // Stateless forwarding is unimplemented; still a drop.
                    warn!(
                        id = %natural_id,
                        code = res.code(),
                        "stray response (stateless forwarding not implemented)"
                    );
                }
            }
            (SipMessage::Response(res), true) => {
                debug!(id = %natural_id, code = res.code(), "TU response without transaction");
            }
        }
    }

    /// A CANCEL matched an INVITE transaction: run it through a
    /// sibling non-INVITE transaction keyed under its own id. The
    /// INVITE entry records the child id.
    async fn handle_cancel(
        &self,
        invite_id: &TransactionId,
        cancel_id: TransactionId,
        msg: SipMessage,
        from_tu: bool,
    ) {
        let SipMessage::Request(cancel) = msg else {
            return;
        };
        let is_client = match self.table.get(invite_id) {
            Some(entry) => matches!(entry.machine, Machine::ClientInvite(_)),
            None => return,
        };
        match (is_client, from_tu) {
            (true, true) => {
                if !self.table.contains_key(&cancel_id) {
                    debug!(id = %cancel_id, parent = %invite_id, "new CANCEL client transaction");
                    let fsm = ClientNonInviteFsm::new(self.config.timers, self.is_reliable);
                    self.table.insert(
                        cancel_id.clone(),
                        TransactionEntry::new(Machine::ClientNonInvite(fsm)),
                    );
                    if let Some(mut parent) = self.table.get_mut(invite_id) {
                        parent.cancel_child = Some(cancel_id.clone());
                    }
                }
                self.dispatch(&cancel_id, TxnEvent::TuRequest(cancel)).await;
            }
            (false, false) => {
                let created = if self.table.contains_key(&cancel_id) {
                    false
                } else {
                    debug!(id = %cancel_id, parent = %invite_id, "new CANCEL server transaction");
                    let fsm = ServerNonInviteFsm::new(self.config.timers, self.is_reliable);
                    self.table.insert(
                        cancel_id.clone(),
                        TransactionEntry::new(Machine::ServerNonInvite(fsm)),
                    );
                    if let Some(mut parent) = self.table.get_mut(invite_id) {
                        parent.cancel_child = Some(cancel_id.clone());
                    }
                    true
                };
                if created {
                    let _ = self.tu_tx.send(SipMessage::Request(cancel.clone()));
                }
                self.dispatch(&cancel_id, TxnEvent::WireRequest(cancel)).await;
            }
            _ => {
                debug!(id = %invite_id, from_tu, "CANCEL direction mismatch, discarding");
            }
        }
    }

    async fn dispatch(&self, id: &TransactionId, event: TxnEvent) {
        let actions = match self.table.get_mut(id) {
            Some(mut entry) => entry.machine.on_event(event),
            None => return,
        };
        self.apply(id, actions).await;
    }

    async fn apply(&self, id: &TransactionId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(msg) => match self.transport.send(&msg).await {
                    Ok(sent) => {
                        let _ = self.event_tx.send(Event::Sent {
                            id: id.clone(),
                            sent,
                        });
                    }
                    Err(e) => {
                        error!(%id, error = %e, "transport send failed");
                        let _ = self.event_tx.send(Event::TransportError { id: id.clone() });
                    }
                },
                Action::Retransmit(msg) => {
                    if let Err(e) = self.transport.retransmit(&msg).await {
                        error!(%id, error = %e, "transport retransmit failed");
                        let _ = self.event_tx.send(Event::TransportError { id: id.clone() });
                    }
                }
                Action::DeliverToTu(msg) => {
                    let _ = self.tu_tx.send(msg);
                }
                Action::Schedule { kind, duration } => {
                    self.schedule_timer(id, kind, duration);
                }
                Action::Cancel(kind) => {
                    if let Some(mut entry) = self.table.get_mut(id) {
                        entry.cancel_timer(kind);
                    }
                }
                Action::PromoteToStale => {
                    if let Some(mut entry) = self.table.get_mut(id) {
                        entry.machine = Machine::Stale(StaleFsm::new());
                    }
                }
                Action::Destroy { reason } => {
                    if let Some((_, mut entry)) = self.table.remove(id) {
                        entry.cancel_all();
                        debug!(%id, %reason, "transaction destroyed");
                    }
                    break;
                }
            }
        }
    }

    fn schedule_timer(&self, id: &TransactionId, kind: TimerKind, duration: Duration) {
        let Some(mut entry) = self.table.get_mut(id) else {
            return;
        };
        entry.cancel_timer(kind);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(kind, cancel_tx);
        drop(entry);

        let event_tx = self.event_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = event_tx.send(Event::Timer { id, kind });
                }
                _ = &mut cancel_rx => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sip_core::{Headers, Request, RequestLine, Response, StatusLine};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct TestTransport {
        reliable: bool,
        sent: Mutex<Vec<SipMessage>>,
        retransmitted: Mutex<Vec<SipMessage>>,
    }

    impl TestTransport {
        fn udp() -> Arc<Self> {
            Arc::new(Self::default())
        }

        async fn sent_codes(&self) -> Vec<u16> {
            self.sent
                .lock()
                .await
                .iter()
                .filter_map(|m| m.as_response().map(|r| r.code()))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn send(&self, msg: &SipMessage) -> Result<Sent> {
            self.sent.lock().await.push(msg.clone());
            Ok(if self.reliable {
                Sent::Reliable
            } else {
                Sent::Unreliable
            })
        }

        async fn retransmit(&self, msg: &SipMessage) -> Result<()> {
            self.retransmitted.lock().await.push(msg.clone());
            Ok(())
        }

        fn is_reliable(&self) -> bool {
            self.reliable
        }
    }

    fn request(method: Method, branch: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", format!("SIP/2.0/UDP host.invalid;branch={branch}"));
        headers.push("From", "<sip:a@a.invalid>;tag=1");
        headers.push("To", "<sip:b@b.invalid>");
        headers.push("Call-ID", "mgr-test");
        headers.push("CSeq", format!("1 {}", method.as_str()));
        Request::new(
            RequestLine::new(method, "sip:b@b.invalid"),
            headers,
            Bytes::new(),
        )
    }

    fn response(code: u16, branch: &str, cseq_method: &Method) -> Response {
        let mut headers = Headers::new();
        headers.push("Via", format!("SIP/2.0/UDP host.invalid;branch={branch}"));
        headers.push("To", "<sip:b@b.invalid>;tag=2");
        headers.push("CSeq", format!("1 {}", cseq_method.as_str()));
        Response::new(StatusLine::new(code, "X"), headers, Bytes::new())
    }

    fn fast_config() -> CoreConfig {
        CoreConfig {
            timers: TimerConfig {
                t1: Duration::from_millis(5),
                t2: Duration::from_millis(20),
                t4: Duration::from_millis(30),
                t100: Duration::from_millis(25),
                td: Duration::from_millis(60),
                ts: Duration::from_millis(60),
            },
            discard_stray_responses: true,
        }
    }

    async fn settle() {
        time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn tu_ack_goes_straight_to_the_wire() {
        let transport = TestTransport::udp();
        let (core, _tu) = TransactionCore::new(transport.clone());

        core.submit(request(Method::Ack, "z9hG4bKack").into());
        settle().await;

        assert_eq!(transport.sent.lock().await.len(), 1);
        assert_eq!(core.transaction_count(), 0);
    }

    #[tokio::test]
    async fn inbound_invite_creates_server_transaction_and_forwards() {
        let transport = TestTransport::udp();
        let (core, mut tu) = TransactionCore::with_config(transport.clone(), fast_config());

        core.receive(request(Method::Invite, "z9hG4bKsrv").into());
        settle().await;

        let forwarded = tu.recv().await.expect("request forwarded to TU");
        assert!(forwarded.is_request());

        let id = TransactionId::new("z9hG4bKsrv", &Method::Invite);
        let snap = core.snapshot(&id).expect("transaction exists");
        assert_eq!(snap.machine, "ServerInvite");
        assert_eq!(snap.state, TxnState::Proceeding);
        assert!(snap.has_msg_to_retransmit, "pre-formed 100 is stored");

        // Timer Trying fires with no TU provisional: the 100 goes out.
        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(transport.sent_codes().await, vec![100]);
    }

    #[tokio::test]
    async fn duplicate_inbound_invite_does_not_create_a_second_entry() {
        let transport = TestTransport::udp();
        let (core, _tu) = TransactionCore::with_config(transport.clone(), fast_config());

        core.receive(request(Method::Invite, "z9hG4bKdup").into());
        core.receive(request(Method::Invite, "z9hG4bKdup").into());
        settle().await;

        assert_eq!(core.transaction_count(), 1);
    }

    #[tokio::test]
    async fn server_retransmits_stored_final_on_duplicate_request() {
        let transport = TestTransport::udp();
        let (core, _tu) = TransactionCore::with_config(transport.clone(), fast_config());

        core.receive(request(Method::Options, "z9hG4bKopt").into());
        settle().await;
        core.submit(response(200, "z9hG4bKopt", &Method::Options).into());
        settle().await;
        assert_eq!(transport.sent_codes().await, vec![200]);

        core.receive(request(Method::Options, "z9hG4bKopt").into());
        settle().await;
        let retransmitted = transport.retransmitted.lock().await;
        assert_eq!(retransmitted.len(), 1);
        assert_eq!(retransmitted[0].as_response().map(|r| r.code()), Some(200));
    }

    #[tokio::test]
    async fn client_non_invite_times_out_with_synthetic_408() {
        let transport = TestTransport::udp();
        let (core, mut tu) = TransactionCore::with_config(transport.clone(), fast_config());

        core.submit(request(Method::Register, "z9hG4bKreg").into());

        // Timer F is 64*T1 = 320ms here; wait it out.
        let deadline = time::Instant::now() + Duration::from_secs(2);
        let synthetic = loop {
            let msg = tokio::select! {
                m = tu.recv() => m.expect("TU fifo open"),
                _ = time::sleep_until(deadline) => panic!("no synthetic 408"),
            };
            if let SipMessage::Response(resp) = msg {
                break resp;
            }
        };
        assert_eq!(synthetic.code(), 408);
        settle().await;
        assert_eq!(core.transaction_count(), 0, "transaction destroyed after Timer F");

        // The request was retransmitted along the E1 schedule first.
        assert!(
            transport.retransmitted.lock().await.len() >= 3,
            "E1 drove retransmissions before the timeout"
        );
    }

    #[tokio::test]
    async fn tu_cancel_spawns_child_transaction() {
        let transport = TestTransport::udp();
        let (core, _tu) = TransactionCore::with_config(transport.clone(), fast_config());

        core.submit(request(Method::Invite, "z9hG4bKcall").into());
        settle().await;
        core.submit(request(Method::Cancel, "z9hG4bKcall").into());
        settle().await;

        let invite_id = TransactionId::new("z9hG4bKcall", &Method::Invite);
        let cancel_id = TransactionId::new("z9hG4bKcall", &Method::Cancel);
        assert!(core.contains(&cancel_id));
        let parent = core.snapshot(&invite_id).expect("INVITE still live");
        assert_eq!(parent.cancel_child.as_ref(), Some(&cancel_id));

        // Both the INVITE and the CANCEL went out.
        let methods: Vec<String> = transport
            .sent
            .lock()
            .await
            .iter()
            .filter_map(|m| m.as_request().map(|r| r.method().to_string()))
            .collect();
        assert_eq!(methods, vec!["INVITE".to_string(), "CANCEL".to_string()]);
    }

    #[tokio::test]
    async fn wire_cancel_reaches_tu_and_child_answers_retransmissions() {
        let transport = TestTransport::udp();
        // Keep Timer Trying out of the picture so the only transmissions
        // are the CANCEL child's.
        let mut config = fast_config();
        config.timers.t100 = Duration::from_secs(5);
        let (core, mut tu) = TransactionCore::with_config(transport.clone(), config);

        core.receive(request(Method::Invite, "z9hG4bKuas").into());
        settle().await;
        tu.recv().await.expect("INVITE to TU");

        core.receive(request(Method::Cancel, "z9hG4bKuas").into());
        settle().await;
        let forwarded = tu.recv().await.expect("CANCEL to TU");
        assert_eq!(
            forwarded.as_request().map(|r| r.method().clone()),
            Some(Method::Cancel)
        );

        // TU answers the CANCEL; the child transaction owns the response.
        core.submit(response(200, "z9hG4bKuas", &Method::Cancel).into());
        settle().await;
        assert_eq!(transport.sent_codes().await, vec![200]);

        // A retransmitted CANCEL is answered from the child's stored final.
        core.receive(request(Method::Cancel, "z9hG4bKuas").into());
        settle().await;
        assert_eq!(transport.retransmitted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn stray_response_is_discarded() {
        let transport = TestTransport::udp();
        let (core, _tu) = TransactionCore::new(transport.clone());

        core.receive(response(200, "z9hG4bKnone", &Method::Options).into());
        settle().await;

        assert_eq!(core.transaction_count(), 0);
        assert!(transport.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn retransmission_timers_imply_a_stored_message() {
        let transport = TestTransport::udp();
        let (core, _tu) = TransactionCore::with_config(transport.clone(), fast_config());

        core.submit(request(Method::Register, "z9hG4bKinv1").into());
        settle().await;

        let id = TransactionId::new("z9hG4bKinv1", &Method::Register);
        let snap = core.snapshot(&id).expect("transaction exists");
        let has_retx_timer = snap
            .armed_timers
            .iter()
            .any(|k| matches!(k, TimerKind::A | TimerKind::E1 | TimerKind::E2 | TimerKind::G));
        assert!(has_retx_timer);
        assert!(
            snap.has_msg_to_retransmit,
            "an armed retransmission timer implies a stored message"
        );
    }
}
