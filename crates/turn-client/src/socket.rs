// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The TURN client engine.
//!
//! Public methods enqueue commands; a single spawned task owns every
//! piece of state and drains the queue in FIFO order, so handlers run
//! to completion and the close paths serialize naturally. Timer
//! expiries are posted back into the same queue.

use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use smol_str::SmolStr;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, warn};

use stun_core::{
    decode_frame, encode_frame, integrity::long_term_key, looks_like_stun, unspecified_ip,
    StunClass, StunCodec, StunMessage, StunMethod, StunTuple, TransactionId, TransportProtocol,
    PORT_PROPS_NONE, STUN_CHANNEL, UNSPECIFIED_BANDWIDTH, UNSPECIFIED_LIFETIME, UNSPECIFIED_PORT,
};

use crate::{
    channels::ChannelManager,
    error::TurnError,
    handler::TurnHandler,
    request::{RequestEntry, StunTimers},
};

/// Transport under the engine: one connected flow to the TURN server.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    /// Local binding; its protocol decides retransmission and
    /// channel-confirmation behavior.
    fn local_binding(&self) -> StunTuple;
    /// The server tuple this socket is connected to.
    fn connected_tuple(&self) -> StunTuple;
    async fn send(&self, dest: StunTuple, data: Bytes) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Allocation request parameters. Defaults are the "unspecified"
/// sentinels: attributes are encoded only when a field departs from
/// them.
#[derive(Debug, Clone, Copy)]
pub struct AllocationParams {
    pub lifetime: u32,
    pub bandwidth: u32,
    pub port_props: u16,
    pub port: u16,
    pub transport: Option<TransportProtocol>,
    pub ip: IpAddr,
}

impl Default for AllocationParams {
    fn default() -> Self {
        Self {
            lifetime: UNSPECIFIED_LIFETIME,
            bandwidth: UNSPECIFIED_BANDWIDTH,
            port_props: PORT_PROPS_NONE,
            port: UNSPECIFIED_PORT,
            transport: None,
            ip: unspecified_ip(),
        }
    }
}

/// The allocation refresh point: (5·lifetime)/8 seconds, comfortably
/// ahead of the 3/4-lifetime deadline.
pub fn refresh_delay(lifetime: u32) -> Duration {
    Duration::from_secs(5 * lifetime as u64 / 8)
}

enum TurnCommand {
    SetCredentials {
        username: SmolStr,
        password: SmolStr,
        short_term: bool,
    },
    RequestSharedSecret,
    BindRequest,
    CreateAllocation(AllocationParams),
    RefreshAllocation {
        lifetime: u32,
    },
    SetActiveDestination {
        address: IpAddr,
        port: u16,
    },
    ClearActiveDestination,
    Send {
        data: Bytes,
    },
    SendTo {
        address: IpAddr,
        port: u16,
        data: Bytes,
    },
    Received {
        source: StunTuple,
        data: Bytes,
    },
    RequestTimerFired {
        tid: TransactionId,
    },
    AllocationTimerFired,
    Close,
}

/// Cloneable handle to the engine. Every method is fire-and-forget;
/// outcomes arrive through the [`TurnHandler`].
#[derive(Clone)]
pub struct TurnSocket {
    cmd_tx: mpsc::UnboundedSender<TurnCommand>,
}

impl TurnSocket {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        codec: Arc<dyn StunCodec>,
        handler: Arc<dyn TurnHandler>,
        framing: bool,
    ) -> Self {
        Self::with_timers(transport, codec, handler, framing, StunTimers::default())
    }

    /// Constructor with custom retransmission timing (test hook).
    pub fn with_timers(
        transport: Arc<dyn RelayTransport>,
        codec: Arc<dyn StunCodec>,
        handler: Arc<dyn TurnHandler>,
        framing: bool,
        timers: StunTimers,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let relay_protocol = transport.local_binding().protocol;
        let mut engine = TurnEngine {
            transport,
            codec,
            handler,
            cmd_tx: cmd_tx.clone(),
            timers,
            framing,
            username: SmolStr::default(),
            password: SmolStr::default(),
            realm: SmolStr::default(),
            nonce: SmolStr::default(),
            hmac_key: SmolStr::default(),
            relay_protocol,
            lifetime: 0,
            have_allocation: false,
            close_after_destroy: false,
            closed: false,
            active_destination: None,
            channels: ChannelManager::new(),
            requests: HashMap::new(),
            allocation_timer: None,
        };
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                engine.handle(cmd).await;
            }
        });
        Self { cmd_tx }
    }

    fn post(&self, cmd: TurnCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Stores credentials; with short-term auth the password doubles as
    /// the HMAC key immediately.
    pub fn set_credentials(&self, username: &str, password: &str, short_term: bool) {
        self.post(TurnCommand::SetCredentials {
            username: SmolStr::new(username),
            password: SmolStr::new(password),
            short_term,
        });
    }

    pub fn request_shared_secret(&self) {
        self.post(TurnCommand::RequestSharedSecret);
    }

    pub fn bind_request(&self) {
        self.post(TurnCommand::BindRequest);
    }

    pub fn create_allocation(&self, params: AllocationParams) {
        self.post(TurnCommand::CreateAllocation(params));
    }

    pub fn refresh_allocation(&self, lifetime: u32) {
        self.post(TurnCommand::RefreshAllocation { lifetime });
    }

    /// A refresh with lifetime 0 tears the allocation down.
    pub fn destroy_allocation(&self) {
        self.refresh_allocation(0);
    }

    pub fn set_active_destination(&self, address: IpAddr, port: u16) {
        self.post(TurnCommand::SetActiveDestination { address, port });
    }

    pub fn clear_active_destination(&self) {
        self.post(TurnCommand::ClearActiveDestination);
    }

    /// Sends to the active destination (or raw to the server before an
    /// allocation exists).
    pub fn send(&self, data: Bytes) {
        self.post(TurnCommand::Send { data });
    }

    pub fn send_to(&self, address: IpAddr, port: u16, data: Bytes) {
        self.post(TurnCommand::SendTo {
            address,
            port,
            data,
        });
    }

    /// Feeds bytes read from the transport into the engine.
    pub fn receive_data(&self, source: StunTuple, data: Bytes) {
        self.post(TurnCommand::Received { source, data });
    }

    /// Graceful shutdown. Over UDP an existing allocation is destroyed
    /// first and the socket close waits for that refresh to finish.
    pub fn close(&self) {
        self.post(TurnCommand::Close);
    }
}

struct TurnEngine {
    transport: Arc<dyn RelayTransport>,
    codec: Arc<dyn StunCodec>,
    handler: Arc<dyn TurnHandler>,
    cmd_tx: mpsc::UnboundedSender<TurnCommand>,
    timers: StunTimers,
    framing: bool,

    username: SmolStr,
    password: SmolStr,
    realm: SmolStr,
    nonce: SmolStr,
    hmac_key: SmolStr,

    relay_protocol: TransportProtocol,
    lifetime: u32,
    have_allocation: bool,
    close_after_destroy: bool,
    closed: bool,
    active_destination: Option<StunTuple>,
    channels: ChannelManager,
    requests: HashMap<TransactionId, RequestEntry>,
    allocation_timer: Option<oneshot::Sender<()>>,
}

impl TurnEngine {
    fn local_protocol(&self) -> TransportProtocol {
        self.transport.local_binding().protocol
    }

    async fn handle(&mut self, cmd: TurnCommand) {
        if self.closed {
            debug!("engine closed, dropping command");
            return;
        }
        match cmd {
            TurnCommand::SetCredentials {
                username,
                password,
                short_term,
            } => {
                self.username = username;
                self.password = password.clone();
                if short_term {
                    self.hmac_key = password;
                }
            }
            TurnCommand::RequestSharedSecret => self.do_request_shared_secret().await,
            TurnCommand::BindRequest => self.do_bind_request().await,
            TurnCommand::CreateAllocation(params) => self.do_create_allocation(params).await,
            TurnCommand::RefreshAllocation { lifetime } => self.do_refresh_allocation(lifetime).await,
            TurnCommand::SetActiveDestination { address, port } => {
                self.do_set_active_destination(address, port).await
            }
            TurnCommand::ClearActiveDestination => self.do_clear_active_destination().await,
            TurnCommand::Send { data } => self.do_send(data).await,
            TurnCommand::SendTo {
                address,
                port,
                data,
            } => self.do_send_to(address, port, data).await,
            TurnCommand::Received { source, data } => self.on_received(source, data).await,
            TurnCommand::RequestTimerFired { tid } => self.on_request_timer(tid).await,
            TurnCommand::AllocationTimerFired => {
                let lifetime = self.lifetime;
                self.do_refresh_allocation(lifetime).await;
            }
            TurnCommand::Close => self.do_close().await,
        }
    }

    // ---- message plumbing ----

    fn new_stun_message(&self, class: StunClass, method: StunMethod, add_auth: bool) -> StunMessage {
        let mut msg = match class {
            StunClass::Request => StunMessage::request(method),
            StunClass::Indication => StunMessage::indication(method),
            _ => unreachable!("responses are built from a request tid"),
        };
        if add_auth && !self.username.is_empty() && !self.hmac_key.is_empty() {
            msg.username = Some(self.username.clone());
            msg.hmac_key = Some(self.hmac_key.clone());
            if !self.realm.is_empty() {
                msg.realm = Some(self.realm.clone());
            }
            if !self.nonce.is_empty() {
                msg.nonce = Some(self.nonce.clone());
            }
        }
        msg
    }

    /// Encodes (and frames, in framed mode) a STUN message and puts it
    /// on the wire toward the server.
    async fn transmit(&self, msg: &StunMessage) {
        let encoded = self.codec.encode(msg);
        let bytes = if self.framing {
            match encode_frame(STUN_CHANNEL, &encoded) {
                Ok(framed) => framed,
                Err(e) => {
                    warn!(error = %e, "dropping oversized STUN frame");
                    return;
                }
            }
        } else {
            encoded
        };
        if let Err(e) = self.transport.send(self.transport.connected_tuple(), bytes).await {
            warn!(error = %e, "transport send failed");
        }
    }

    /// Transmits a request and installs its retransmission entry.
    async fn start_request(&mut self, msg: StunMessage, auth_retried: bool) {
        let tid = msg.tid;
        let timeout = self.timers.initial_timeout(self.local_protocol());
        let entry = RequestEntry::new(msg.clone(), timeout, auth_retried);
        self.requests.insert(tid, entry);
        self.arm_request_timer(tid, timeout);
        self.transmit(&msg).await;
    }

    /// Transmits an indication or locally generated response; no entry.
    async fn send_oneway(&self, msg: StunMessage) {
        self.transmit(&msg).await;
    }

    fn arm_request_timer(&mut self, tid: TransactionId, timeout: Duration) {
        let Some(entry) = self.requests.get_mut(&tid) else {
            return;
        };
        entry.cancel_timer();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.cancel = Some(cancel_tx);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(timeout) => {
                    let _ = cmd_tx.send(TurnCommand::RequestTimerFired { tid });
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    async fn on_request_timer(&mut self, tid: TransactionId) {
        let (udp, max) = (
            self.local_protocol() == TransportProtocol::Udp,
            self.timers.max_retransmits,
        );
        let retransmit = {
            let Some(entry) = self.requests.get_mut(&tid) else {
                return;
            };
            if !udp || entry.attempts >= max {
                None
            } else {
                entry.attempts += 1;
                entry.timeout = self.timers.next_timeout(entry.timeout, entry.attempts);
                Some((entry.message.clone(), entry.timeout))
            }
        };
        match retransmit {
            Some((msg, timeout)) => {
                debug!(%tid, ?timeout, "request timer expired, retransmitting");
                self.arm_request_timer(tid, timeout);
                self.transmit(&msg).await;
            }
            None => {
                let entry = self.requests.remove(&tid).expect("entry checked above");
                debug!(%tid, method = ?entry.message.method, "request timed out");
                self.report_timeout(entry.message.method).await;
            }
        }
    }

    async fn report_timeout(&mut self, method: StunMethod) {
        match method {
            StunMethod::Bind => self.handler.on_bind_failure(TurnError::ResponseTimeout).await,
            StunMethod::SharedSecret => {
                self.handler
                    .on_shared_secret_failure(TurnError::ResponseTimeout)
                    .await
            }
            StunMethod::Allocate => {
                self.handler
                    .on_allocation_failure(TurnError::ResponseTimeout)
                    .await
            }
            StunMethod::Refresh => {
                self.handler
                    .on_refresh_failure(TurnError::ResponseTimeout)
                    .await;
                if self.close_after_destroy {
                    self.have_allocation = false;
                    self.actual_close().await;
                }
            }
            _ => warn!(?method, "timeout for unexpected request method"),
        }
    }

    // ---- operations ----

    async fn do_request_shared_secret(&mut self) {
        if !self.transport.is_connected() {
            self.handler
                .on_shared_secret_failure(TurnError::NotConnected)
                .await;
            return;
        }
        let request = self.new_stun_message(StunClass::Request, StunMethod::SharedSecret, true);
        self.start_request(request, false).await;
    }

    async fn do_bind_request(&mut self) {
        if !self.transport.is_connected() {
            self.handler.on_bind_failure(TurnError::NotConnected).await;
            return;
        }
        let request = self.new_stun_message(StunClass::Request, StunMethod::Bind, true);
        self.start_request(request, false).await;
    }

    async fn do_create_allocation(&mut self, params: AllocationParams) {
        // Relay rides the requested transport, or the local one.
        self.relay_protocol = params.transport.unwrap_or_else(|| self.local_protocol());

        if !self.transport.is_connected() {
            self.handler
                .on_allocation_failure(TurnError::NotConnected)
                .await;
            return;
        }
        if self.have_allocation {
            self.handler
                .on_allocation_failure(TurnError::AlreadyAllocated)
                .await;
            return;
        }

        let mut request = self.new_stun_message(StunClass::Request, StunMethod::Allocate, true);
        if params.lifetime != UNSPECIFIED_LIFETIME {
            request.lifetime = Some(params.lifetime);
        }
        if params.bandwidth != UNSPECIFIED_BANDWIDTH {
            request.bandwidth = Some(params.bandwidth);
        }
        match params.transport {
            None => {}
            Some(TransportProtocol::Udp) => {
                request.requested_transport = Some(TransportProtocol::Udp);
            }
            Some(TransportProtocol::Tcp)
                if self.local_protocol() != TransportProtocol::Udp =>
            {
                request.requested_transport = Some(TransportProtocol::Tcp);
            }
            // TLS relays do not exist, and a TCP relay cannot ride a
            // UDP client transport.
            Some(_) => {
                self.handler
                    .on_allocation_failure(TurnError::InvalidRequestedTransport)
                    .await;
                return;
            }
        }
        if params.ip != unspecified_ip() {
            request.requested_ip = Some(params.ip);
        }
        if params.port_props != PORT_PROPS_NONE || params.port != UNSPECIFIED_PORT {
            request.requested_port_props = Some((params.port_props, params.port));
        }
        self.start_request(request, false).await;
    }

    async fn do_refresh_allocation(&mut self, lifetime: u32) {
        if !self.have_allocation {
            self.handler.on_refresh_failure(TurnError::NoAllocation).await;
            if self.close_after_destroy {
                self.actual_close().await;
            }
            return;
        }
        let mut request = self.new_stun_message(StunClass::Request, StunMethod::Refresh, true);
        if lifetime != UNSPECIFIED_LIFETIME {
            request.lifetime = Some(lifetime);
        }
        self.start_request(request, false).await;
    }

    async fn do_set_active_destination(&mut self, address: IpAddr, port: u16) {
        let tuple = StunTuple::new(self.relay_protocol, address, port);
        if self.channels.find_or_create(tuple).is_none() {
            warn!(%tuple, "channel numbers exhausted");
            self.handler
                .on_set_active_destination_failure(TurnError::ChannelsExhausted)
                .await;
            return;
        }
        self.active_destination = Some(tuple);
        debug!(%tuple, "active destination set");
        self.handler.on_set_active_destination_success().await;
    }

    async fn do_clear_active_destination(&mut self) {
        if !self.have_allocation {
            self.handler
                .on_clear_active_destination_failure(TurnError::NoAllocation)
                .await;
            return;
        }
        self.active_destination = None;
        self.handler.on_clear_active_destination_success().await;
    }

    async fn do_send(&mut self, data: Bytes) {
        if !self.have_allocation {
            let dest = self.transport.connected_tuple();
            if let Err(e) = self.transport.send(dest, data).await {
                warn!(error = %e, "raw send failed");
            }
            return;
        }
        let Some(dest) = self.active_destination else {
            warn!("send with no active destination, dropping payload");
            return;
        };
        self.send_to_peer(dest, data).await;
    }

    async fn do_send_to(&mut self, address: IpAddr, port: u16, data: Bytes) {
        if !self.have_allocation {
            let dest = StunTuple::new(self.local_protocol(), address, port);
            if let Err(e) = self.transport.send(dest, data).await {
                warn!(error = %e, "raw send failed");
            }
            return;
        }
        let tuple = StunTuple::new(self.relay_protocol, address, port);
        self.send_to_peer(tuple, data).await;
    }

    async fn send_to_peer(&mut self, tuple: StunTuple, data: Bytes) {
        let (channel, confirmed) = match self.channels.find_or_create(tuple) {
            Some(peer) => (peer.c2s_channel(), peer.c2s_confirmed()),
            None => {
                warn!(%tuple, "channel numbers exhausted, dropping payload");
                return;
            }
        };
        if confirmed {
            match encode_frame(channel, &data) {
                Ok(framed) => {
                    let dest = self.transport.connected_tuple();
                    if let Err(e) = self.transport.send(dest, framed).await {
                        warn!(error = %e, "channel send failed");
                    }
                }
                Err(e) => warn!(error = %e, "dropping oversized channel payload"),
            }
        } else {
            let mut ind = self.new_stun_message(StunClass::Indication, StunMethod::Send, false);
            ind.peer_address = Some(tuple);
            ind.channel_number = Some(channel);
            if !data.is_empty() {
                ind.data = Some(data);
            }
            // Stream transports need no confirmation round-trip: the
            // first Send indication pins the channel.
            if self.local_protocol() != TransportProtocol::Udp {
                if let Some(peer) = self.channels.peer_by_address_mut(&tuple) {
                    peer.set_c2s_confirmed();
                }
            }
            self.send_oneway(ind).await;
        }
    }

    // ---- inbound ----

    async fn on_received(&mut self, source: StunTuple, data: Bytes) {
        if self.framing {
            match decode_frame(&data) {
                Err(e) => {
                    warn!(error = %e, "short framed datagram, discarding");
                    self.handler.on_receive_failure(TurnError::FrameError).await;
                }
                Ok(frame) if frame.channel == STUN_CHANNEL => {
                    let outcome = match self.codec.decode(&frame.payload) {
                        Ok(mut msg) => {
                            msg.raw = Some(frame.payload.clone());
                            self.handle_stun_message(msg, source).await
                        }
                        Err(_) => Err(TurnError::ErrorParsingMessage),
                    };
                    if let Err(error) = outcome {
                        warn!(%error, "discarding inbound STUN message");
                    }
                }
                Ok(frame) => match self.channels.peer_by_s2c(frame.channel) {
                    Some(peer) => {
                        let tuple = peer.peer_tuple();
                        self.handler
                            .on_receive_success(tuple.address, tuple.port, frame.payload)
                            .await;
                    }
                    None => {
                        warn!(channel = frame.channel, "channel data for unknown channel, discarding")
                    }
                },
            }
            return;
        }

        // Unframed mode: the class bits mark a possible STUN message,
        // anything else is raw data.
        if data.first().is_some_and(|b| looks_like_stun(*b)) {
            if let Ok(mut msg) = self.codec.decode(&data) {
                msg.raw = Some(data);
                if let Err(error) = self.handle_stun_message(msg, source).await {
                    warn!(%error, "discarding inbound STUN message");
                }
                return;
            }
        }
        self.handler
            .on_receive_success(source.address, source.port, data)
            .await;
    }

    async fn handle_stun_message(
        &mut self,
        msg: StunMessage,
        source: StunTuple,
    ) -> Result<(), TurnError> {
        if !msg.verify_integrity(&self.hmac_key) {
            return Err(TurnError::BadMessageIntegrity);
        }
        match msg.class {
            StunClass::Request => match msg.method {
                StunMethod::Bind => {
                    // bis13-style answer: echo the sender as XOR-mapped.
                    let mut response = StunMessage::success_response(StunMethod::Bind, msg.tid);
                    response.xor_mapped_address = Some(source);
                    self.send_oneway(response).await;
                    Ok(())
                }
                method => {
                    debug!(?method, "client cannot serve this request method");
                    let response = StunMessage::error_response(
                        method,
                        msg.tid,
                        400,
                        "Invalid Request Method",
                    );
                    self.send_oneway(response).await;
                    Ok(())
                }
            },
            StunClass::Indication => match msg.method {
                StunMethod::Data => self.handle_data_ind(msg).await,
                StunMethod::ChannelConfirmation => self.handle_channel_confirmation(msg),
                // A Bind indication is a keepalive, no response needed.
                _ => Ok(()),
            },
            StunClass::SuccessResponse | StunClass::ErrorResponse => {
                self.handle_response(msg).await
            }
        }
    }

    async fn handle_response(&mut self, msg: StunMessage) -> Result<(), TurnError> {
        if !self.requests.contains_key(&msg.tid) {
            return Err(TurnError::StrayResponse);
        }
        if let Some(entry) = self.requests.get_mut(&msg.tid) {
            entry.cancel_timer();
        }

        // 401 (initial long-term challenge, only while no key exists)
        // and 438 (stale nonce) re-issue the request with fresh auth
        // attributes, at most once per request.
        let challenge = msg.error_code.as_ref().map(|e| e.code());
        let auth_retried = self
            .requests
            .get(&msg.tid)
            .map(|e| e.auth_retried)
            .unwrap_or(true);
        let recoverable = msg.realm.is_some()
            && msg.nonce.is_some()
            && !auth_retried
            && (challenge == Some(438) || (challenge == Some(401) && self.hmac_key.is_empty()));
        if recoverable {
            let entry = self.requests.remove(&msg.tid).expect("checked above");
            self.realm = msg.realm.clone().expect("checked above");
            self.nonce = msg.nonce.clone().expect("checked above");
            self.hmac_key = long_term_key(&self.username, &self.realm, &self.password);

            let mut request = entry.message;
            request.refresh_tid();
            request.username = Some(self.username.clone());
            request.realm = Some(self.realm.clone());
            request.nonce = Some(self.nonce.clone());
            request.hmac_key = Some(self.hmac_key.clone());
            debug!(tid = %request.tid, "re-issuing request with long-term credentials");
            self.start_request(request, true).await;
            return Ok(());
        }

        self.requests.remove(&msg.tid);
        match msg.method {
            StunMethod::Bind => self.handle_bind_response(msg).await,
            StunMethod::SharedSecret => self.handle_shared_secret_response(msg).await,
            StunMethod::Allocate => self.handle_allocate_response(msg).await,
            StunMethod::Refresh => self.handle_refresh_response(msg).await,
            method => debug!(?method, "response for unexpected method, ignoring"),
        }
        Ok(())
    }

    fn response_error(msg: &StunMessage) -> TurnError {
        match &msg.error_code {
            Some(code) => TurnError::ServerError(code.code()),
            None => TurnError::MissingAttributes,
        }
    }

    async fn handle_bind_response(&mut self, msg: StunMessage) {
        if msg.is_success() {
            // MAPPED-ADDRESS is the pre-xor fallback.
            let mapped = msg.xor_mapped_address.or(msg.mapped_address);
            match mapped {
                Some(tuple) => {
                    let reflexive =
                        StunTuple::new(self.local_protocol(), tuple.address, tuple.port);
                    self.handler.on_bind_success(reflexive).await;
                }
                None => {
                    self.handler
                        .on_bind_failure(TurnError::MissingAttributes)
                        .await
                }
            }
        } else {
            self.handler.on_bind_failure(Self::response_error(&msg)).await;
        }
    }

    async fn handle_shared_secret_response(&mut self, msg: StunMessage) {
        if msg.is_success() {
            match (msg.username, msg.password) {
                (Some(username), Some(password)) => {
                    self.handler
                        .on_shared_secret_success(username, password)
                        .await
                }
                _ => {
                    warn!("shared secret response missing username/password");
                    self.handler
                        .on_shared_secret_failure(TurnError::MissingAttributes)
                        .await
                }
            }
        } else {
            self.handler
                .on_shared_secret_failure(Self::response_error(&msg))
                .await;
        }
    }

    async fn handle_allocate_response(&mut self, msg: StunMessage) {
        if msg.is_success() {
            let reflexive = msg
                .xor_mapped_address
                .map(|t| StunTuple::new(self.local_protocol(), t.address, t.port));
            let relay = msg
                .relay_address
                .map(|t| StunTuple::new(self.relay_protocol, t.address, t.port));
            self.lifetime = msg.lifetime.unwrap_or(0);
            if self.lifetime != 0 {
                self.have_allocation = true;
                self.start_allocation_timer();
                self.handler
                    .on_allocation_success(
                        reflexive,
                        relay,
                        self.lifetime,
                        msg.bandwidth.unwrap_or(0),
                    )
                    .await;
            } else {
                self.handler
                    .on_allocation_failure(TurnError::MissingAttributes)
                    .await;
            }
        } else {
            self.handler
                .on_allocation_failure(Self::response_error(&msg))
                .await;
        }
    }

    async fn handle_refresh_response(&mut self, msg: StunMessage) {
        if msg.is_success() {
            self.lifetime = msg.lifetime.unwrap_or(0);
            if self.lifetime != 0 {
                self.have_allocation = true;
                self.start_allocation_timer();
                self.handler.on_refresh_success(self.lifetime).await;
                if self.close_after_destroy {
                    self.have_allocation = false;
                    self.actual_close().await;
                }
            } else {
                self.cancel_allocation_timer();
                self.have_allocation = false;
                self.handler.on_refresh_success(0).await;
                if self.close_after_destroy {
                    self.actual_close().await;
                }
            }
        } else {
            self.handler
                .on_refresh_failure(Self::response_error(&msg))
                .await;
            if self.close_after_destroy {
                self.have_allocation = false;
                self.actual_close().await;
            }
        }
    }

    async fn handle_data_ind(&mut self, msg: StunMessage) -> Result<(), TurnError> {
        let (Some(peer_attr), Some(channel)) = (msg.peer_address, msg.channel_number) else {
            return Err(TurnError::MissingAttributes);
        };
        let tuple = StunTuple::new(self.relay_protocol, peer_attr.address, peer_attr.port);

        let Some(peer) = self.channels.peer_by_address(&tuple) else {
            debug!(%tuple, "data from unknown remote peer");
            return Err(TurnError::UnknownRemoteAddress);
        };
        if let Some(known) = peer.s2c_channel() {
            if known != channel {
                debug!(%tuple, received = channel, known, "channel number does not match peer");
                return Err(TurnError::InvalidChannelNumberReceived);
            }
        }
        if !peer.s2c_confirmed() {
            self.channels.learn_s2c_channel(&tuple, channel);
        }

        // Over UDP the first indication is acknowledged so the server
        // can switch to framed data.
        if self.local_protocol() == TransportProtocol::Udp {
            let mut confirmation =
                self.new_stun_message(StunClass::Indication, StunMethod::ChannelConfirmation, false);
            confirmation.peer_address = Some(peer_attr);
            confirmation.channel_number = Some(channel);
            self.send_oneway(confirmation).await;
        }

        if let Some(data) = msg.data {
            self.handler
                .on_receive_success(tuple.address, tuple.port, data)
                .await;
        }
        Ok(())
    }

    fn handle_channel_confirmation(&mut self, msg: StunMessage) -> Result<(), TurnError> {
        let (Some(peer_attr), Some(channel)) = (msg.peer_address, msg.channel_number) else {
            return Err(TurnError::MissingAttributes);
        };
        let tuple = StunTuple::new(self.relay_protocol, peer_attr.address, peer_attr.port);
        let Some(peer) = self.channels.peer_by_c2s_mut(channel) else {
            debug!(channel, "confirmation for unknown channel");
            return Err(TurnError::InvalidChannelNumberReceived);
        };
        if peer.peer_tuple() != tuple {
            debug!(
                channel,
                confirmed = %tuple,
                bound = %peer.peer_tuple(),
                "confirmation address does not match channel"
            );
            return Err(TurnError::UnknownRemoteAddress);
        }
        peer.set_c2s_confirmed();
        Ok(())
    }

    // ---- lifecycle ----

    fn start_allocation_timer(&mut self) {
        self.cancel_allocation_timer();
        let delay = refresh_delay(self.lifetime);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.allocation_timer = Some(cancel_tx);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    let _ = cmd_tx.send(TurnCommand::AllocationTimerFired);
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    fn cancel_allocation_timer(&mut self) {
        if let Some(cancel) = self.allocation_timer.take() {
            let _ = cancel.send(());
        }
    }

    async fn do_close(&mut self) {
        // A UDP allocation must be destroyed explicitly; stream
        // transports tear server state down on disconnect.
        if self.have_allocation && self.local_protocol() == TransportProtocol::Udp {
            self.close_after_destroy = true;
            self.do_refresh_allocation(0).await;
        } else {
            self.actual_close().await;
        }
    }

    async fn actual_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (_, mut entry) in self.requests.drain() {
            entry.cancel_timer();
        }
        self.cancel_allocation_timer();
        self.transport.close().await;
        debug!("socket closed");
    }
}
