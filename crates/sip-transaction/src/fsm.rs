// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction state machines (RFC 3261 §17).
//!
//! Each machine is pure: it consumes one [`TxnEvent`] at a time and
//! returns the [`Action`]s for the runtime to apply. Destruction is an
//! action too; the dispatcher removes the transaction after the handler
//! has returned, so a machine never tears itself down mid-event.

use std::time::Duration;

use smol_str::SmolStr;

use sip_core::{
    builders::{make_failure_ack, make_response},
    Method, Request, Response, SipMessage,
};

use crate::timers::{TimerConfig, TimerKind};

/// Transaction states. Not every machine visits every state; the
/// machine/state pairs follow RFC 3261 Figures 5-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Events delivered to a transaction by the dispatcher.
#[derive(Debug, Clone)]
pub enum TxnEvent {
    /// New request from the TU (initial send).
    TuRequest(Request),
    /// Response handed down by the TU (server transactions).
    TuResponse(Response),
    /// Request arriving from the wire (initial or retransmitted).
    WireRequest(Request),
    /// Response arriving from the wire (client transactions).
    WireResponse(Response),
    /// Transport confirmation for a previously issued send.
    Sent { reliable: bool },
    /// One of this transaction's timers fired.
    Timer(TimerKind),
    /// The transport failed for this transaction.
    TransportError,
}

/// Actions a machine hands back to the runtime.
#[derive(Debug, Clone)]
pub enum Action {
    /// Fresh transmission; the runtime reports back with `Sent`.
    Send(SipMessage),
    /// Exact resend of a previously transmitted message.
    Retransmit(SipMessage),
    /// Push a message up the TU FIFO.
    DeliverToTu(SipMessage),
    Schedule { kind: TimerKind, duration: Duration },
    Cancel(TimerKind),
    /// Swap this entry's machine for the terminal Stale machine.
    PromoteToStale,
    /// Remove the transaction from the table after this handler returns.
    Destroy { reason: SmolStr },
}

fn destroy(reason: &str) -> Action {
    Action::Destroy {
        reason: SmolStr::new(reason),
    }
}

/// Client non-INVITE transaction (RFC 3261 §17.1.2).
#[derive(Debug)]
pub struct ClientNonInviteFsm {
    config: TimerConfig,
    is_reliable: bool,
    state: TxnState,
    request: Option<Request>,
    e_interval: Duration,
}

impl ClientNonInviteFsm {
    pub fn new(config: TimerConfig, is_reliable: bool) -> Self {
        Self {
            config,
            is_reliable,
            state: TxnState::Trying,
            request: None,
            e_interval: config.t1,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn msg_to_retransmit(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn on_event(&mut self, event: TxnEvent) -> Vec<Action> {
        match event {
            TxnEvent::TuRequest(req) if self.request.is_none() => {
                self.request = Some(req.clone());
                vec![
                    Action::Schedule {
                        kind: TimerKind::F,
                        duration: self.config.lifetime(),
                    },
                    Action::Send(req.into()),
                ]
            }
            TxnEvent::Sent { reliable: false }
                if matches!(self.state, TxnState::Trying | TxnState::Proceeding) =>
            {
                vec![Action::Schedule {
                    kind: TimerKind::E1,
                    duration: self.config.t1,
                }]
            }
            TxnEvent::WireResponse(resp) if resp.is_provisional() => {
                if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
                    self.state = TxnState::Proceeding;
                    let mut actions = Vec::new();
                    if !self.is_reliable {
                        actions.push(Action::Schedule {
                            kind: TimerKind::E2,
                            duration: self.config.t2,
                        });
                    }
                    actions.push(Action::DeliverToTu(resp.into()));
                    actions
                } else {
                    Vec::new()
                }
            }
            TxnEvent::WireResponse(resp) => {
                if self.is_reliable {
                    vec![Action::DeliverToTu(resp.into()), destroy("final response")]
                } else if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
                    self.state = TxnState::Completed;
                    vec![
                        Action::Cancel(TimerKind::E1),
                        Action::Cancel(TimerKind::E2),
                        Action::Cancel(TimerKind::F),
                        Action::Schedule {
                            kind: TimerKind::K,
                            duration: self.config.t4,
                        },
                        Action::DeliverToTu(resp.into()),
                    ]
                } else {
                    Vec::new()
                }
            }
            TxnEvent::Timer(TimerKind::E1) if self.state == TxnState::Trying => {
                self.e_interval = self.config.backoff(self.e_interval);
                match &self.request {
                    Some(req) => vec![
                        Action::Schedule {
                            kind: TimerKind::E1,
                            duration: self.e_interval,
                        },
                        Action::Retransmit(req.clone().into()),
                    ],
                    None => Vec::new(),
                }
            }
            TxnEvent::Timer(TimerKind::E2) if self.state == TxnState::Proceeding => {
                match &self.request {
                    Some(req) => vec![
                        Action::Schedule {
                            kind: TimerKind::E2,
                            duration: self.config.t2,
                        },
                        Action::Retransmit(req.clone().into()),
                    ],
                    None => Vec::new(),
                }
            }
            TxnEvent::Timer(TimerKind::F) => {
                let mut actions = Vec::new();
                if let Some(req) = &self.request {
                    actions.push(Action::DeliverToTu(
                        make_response(req, 408, "Request Timeout").into(),
                    ));
                }
                actions.push(destroy("Timer F expired"));
                actions
            }
            TxnEvent::Timer(TimerKind::K) => vec![destroy("Timer K expired")],
            TxnEvent::TransportError => {
                let mut actions = Vec::new();
                if let Some(req) = &self.request {
                    actions.push(Action::DeliverToTu(
                        make_response(req, 503, "Service Unavailable").into(),
                    ));
                }
                actions.push(destroy("transport error"));
                actions
            }
            _ => Vec::new(),
        }
    }
}

/// Client INVITE transaction (RFC 3261 §17.1.1).
///
/// A 2xx promotes the entry to the Stale machine; a non-2xx final swaps
/// `msg_to_retransmit` from the INVITE to the generated ACK so duplicate
/// finals are answered with ACK retransmissions.
#[derive(Debug)]
pub struct ClientInviteFsm {
    config: TimerConfig,
    is_reliable: bool,
    state: TxnState,
    request: Option<Request>,
    a_interval: Duration,
}

impl ClientInviteFsm {
    pub fn new(config: TimerConfig, is_reliable: bool) -> Self {
        Self {
            config,
            is_reliable,
            state: TxnState::Calling,
            request: None,
            a_interval: config.t1,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn msg_to_retransmit(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    fn stored_invite(&self) -> Option<&Request> {
        self.request
            .as_ref()
            .filter(|req| req.method() == &Method::Invite)
    }

    pub fn on_event(&mut self, event: TxnEvent) -> Vec<Action> {
        match event {
            TxnEvent::TuRequest(req)
                if req.method() == &Method::Invite && self.request.is_none() =>
            {
                self.request = Some(req.clone());
                vec![
                    Action::Schedule {
                        kind: TimerKind::B,
                        duration: self.config.lifetime(),
                    },
                    Action::Send(req.into()),
                ]
            }
            TxnEvent::Sent { reliable: false } if self.state == TxnState::Calling => {
                vec![Action::Schedule {
                    kind: TimerKind::A,
                    duration: self.config.t1,
                }]
            }
            TxnEvent::WireResponse(resp) if resp.is_provisional() => {
                if matches!(self.state, TxnState::Calling | TxnState::Proceeding) {
                    self.state = TxnState::Proceeding;
                    vec![Action::DeliverToTu(resp.into())]
                } else {
                    Vec::new()
                }
            }
            TxnEvent::WireResponse(resp) if resp.is_success() => {
                // Kept alive only to absorb retransmitted 2xx until TS.
                self.state = TxnState::Terminated;
                vec![
                    Action::Cancel(TimerKind::A),
                    Action::Cancel(TimerKind::B),
                    Action::Schedule {
                        kind: TimerKind::Stale,
                        duration: self.config.ts,
                    },
                    Action::DeliverToTu(resp.into()),
                    Action::PromoteToStale,
                ]
            }
            TxnEvent::WireResponse(resp) => self.on_failure_final(resp),
            TxnEvent::Timer(TimerKind::A) if self.state == TxnState::Calling => {
                self.a_interval = self.config.backoff(self.a_interval);
                match &self.request {
                    Some(req) => vec![
                        Action::Schedule {
                            kind: TimerKind::A,
                            duration: self.a_interval,
                        },
                        Action::Retransmit(req.clone().into()),
                    ],
                    None => Vec::new(),
                }
            }
            TxnEvent::Timer(TimerKind::B)
                if matches!(self.state, TxnState::Calling | TxnState::Proceeding) =>
            {
                let mut actions = Vec::new();
                if let Some(invite) = self.stored_invite() {
                    actions.push(Action::DeliverToTu(
                        make_response(invite, 408, "Request Timeout").into(),
                    ));
                }
                actions.push(destroy("Timer B expired"));
                actions
            }
            TxnEvent::Timer(TimerKind::D) => vec![destroy("Timer D expired")],
            TxnEvent::TransportError => {
                let mut actions = Vec::new();
                if let Some(invite) = self.stored_invite() {
                    actions.push(Action::DeliverToTu(
                        make_response(invite, 503, "Service Unavailable").into(),
                    ));
                }
                actions.push(destroy("transport error"));
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_failure_final(&mut self, resp: Response) -> Vec<Action> {
        match self.state {
            TxnState::Calling | TxnState::Proceeding => {
                let Some(invite) = self.request.take() else {
                    return Vec::new();
                };
                let ack = make_failure_ack(&invite, &resp);
                self.request = Some(ack.clone());
                if self.is_reliable {
                    vec![
                        Action::Retransmit(ack.into()),
                        Action::DeliverToTu(resp.into()),
                        destroy("final response"),
                    ]
                } else {
                    self.state = TxnState::Completed;
                    vec![
                        Action::Cancel(TimerKind::A),
                        Action::Cancel(TimerKind::B),
                        Action::Schedule {
                            kind: TimerKind::D,
                            duration: self.config.td,
                        },
                        Action::Retransmit(ack.into()),
                        Action::DeliverToTu(resp.into()),
                    ]
                }
            }
            // Retransmitted final: answer with the stored ACK, the TU
            // has already seen this response.
            TxnState::Completed => match &self.request {
                Some(ack) => vec![Action::Retransmit(ack.clone().into())],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

/// Server non-INVITE transaction (RFC 3261 §17.2.2).
#[derive(Debug)]
pub struct ServerNonInviteFsm {
    config: TimerConfig,
    is_reliable: bool,
    state: TxnState,
    response: Option<Response>,
}

impl ServerNonInviteFsm {
    pub fn new(config: TimerConfig, is_reliable: bool) -> Self {
        Self {
            config,
            is_reliable,
            state: TxnState::Trying,
            response: None,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn msg_to_retransmit(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn on_event(&mut self, event: TxnEvent) -> Vec<Action> {
        match event {
            // Retransmitted request. In Trying there is no response to
            // answer with yet (RFC 3261 §17.2.2).
            TxnEvent::WireRequest(_) => match self.state {
                TxnState::Proceeding | TxnState::Completed => match &self.response {
                    Some(resp) => vec![Action::Retransmit(resp.clone().into())],
                    None => Vec::new(),
                },
                _ => Vec::new(),
            },
            TxnEvent::TuResponse(resp) if resp.is_provisional() => {
                if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
                    self.response = Some(resp.clone());
                    self.state = TxnState::Proceeding;
                    vec![Action::Send(resp.into())]
                } else {
                    Vec::new()
                }
            }
            TxnEvent::TuResponse(resp) => {
                if self.is_reliable {
                    self.response = Some(resp.clone());
                    vec![Action::Send(resp.into()), destroy("final sent")]
                } else if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
                    self.response = Some(resp.clone());
                    self.state = TxnState::Completed;
                    vec![
                        Action::Schedule {
                            kind: TimerKind::J,
                            duration: self.config.lifetime(),
                        },
                        Action::Send(resp.into()),
                    ]
                } else {
                    Vec::new()
                }
            }
            TxnEvent::Timer(TimerKind::J) if self.state == TxnState::Completed => {
                vec![destroy("Timer J expired")]
            }
            TxnEvent::TransportError => vec![destroy("transport error")],
            _ => Vec::new(),
        }
    }
}

/// Server INVITE transaction (RFC 3261 §17.2.1).
///
/// Constructed with a pre-formed 100 Trying in `msg_to_retransmit`; the
/// dispatcher schedules Timer Trying so the stored provisional goes out
/// if the TU stays quiet past T100.
#[derive(Debug)]
pub struct ServerInviteFsm {
    config: TimerConfig,
    is_reliable: bool,
    state: TxnState,
    response: Option<Response>,
    g_interval: Duration,
}

impl ServerInviteFsm {
    pub fn new(config: TimerConfig, is_reliable: bool, hundred: Response) -> Self {
        Self {
            config,
            is_reliable,
            state: TxnState::Proceeding,
            response: Some(hundred),
            g_interval: config.t1,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn msg_to_retransmit(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn on_event(&mut self, event: TxnEvent) -> Vec<Action> {
        match event {
            TxnEvent::WireRequest(req) => self.on_wire_request(req),
            TxnEvent::TuResponse(resp) => self.on_tu_response(resp),
            TxnEvent::Timer(TimerKind::Trying) if self.state == TxnState::Proceeding => {
                match &self.response {
                    Some(resp) => vec![Action::Send(resp.clone().into())],
                    None => Vec::new(),
                }
            }
            TxnEvent::Timer(TimerKind::G) if self.state == TxnState::Completed => {
                self.g_interval = self.config.backoff(self.g_interval);
                match &self.response {
                    Some(resp) => vec![
                        Action::Schedule {
                            kind: TimerKind::G,
                            duration: self.g_interval,
                        },
                        Action::Retransmit(resp.clone().into()),
                    ],
                    None => Vec::new(),
                }
            }
            TxnEvent::Timer(TimerKind::H) if self.state == TxnState::Completed => {
                vec![destroy("Timer H expired, ACK never arrived")]
            }
            TxnEvent::Timer(TimerKind::I) if self.state == TxnState::Confirmed => {
                vec![destroy("Timer I expired")]
            }
            TxnEvent::TransportError => vec![destroy("transport error")],
            _ => Vec::new(),
        }
    }

    fn on_wire_request(&mut self, req: Request) -> Vec<Action> {
        match req.method() {
            Method::Invite => match self.state {
                // Retransmitted INVITE: answer with the stored response.
                TxnState::Proceeding | TxnState::Completed => match &self.response {
                    Some(resp) => vec![Action::Retransmit(resp.clone().into())],
                    None => Vec::new(),
                },
                _ => Vec::new(),
            },
            Method::Ack => match self.state {
                TxnState::Completed => {
                    if self.is_reliable {
                        vec![destroy("ACK received")]
                    } else {
                        self.state = TxnState::Confirmed;
                        vec![
                            Action::Cancel(TimerKind::G),
                            Action::Cancel(TimerKind::H),
                            Action::Schedule {
                                kind: TimerKind::I,
                                duration: self.config.t4,
                            },
                        ]
                    }
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn on_tu_response(&mut self, resp: Response) -> Vec<Action> {
        let code = resp.code();
        if code == 100 {
            // The pre-formed 100 already covers Proceeding; nothing to
            // replace before the TU has produced a real provisional.
            return Vec::new();
        }
        if (101..200).contains(&code) {
            return if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
                self.response = Some(resp.clone());
                self.state = TxnState::Proceeding;
                vec![Action::Send(resp.into())]
            } else {
                Vec::new()
            };
        }
        if (200..300).contains(&code) {
            return if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
                self.response = Some(resp.clone());
                self.state = TxnState::Terminated;
                vec![
                    Action::Schedule {
                        kind: TimerKind::Stale,
                        duration: self.config.ts,
                    },
                    Action::Send(resp.into()),
                    Action::PromoteToStale,
                ]
            } else {
                Vec::new()
            };
        }
        // 3xx-6xx
        if matches!(self.state, TxnState::Trying | TxnState::Proceeding) {
            self.response = Some(resp.clone());
            self.state = TxnState::Completed;
            let mut actions = vec![Action::Schedule {
                kind: TimerKind::H,
                duration: self.config.lifetime(),
            }];
            if !self.is_reliable {
                actions.push(Action::Schedule {
                    kind: TimerKind::G,
                    duration: self.config.t1,
                });
            }
            actions.push(Action::Send(resp.into()));
            actions
        } else {
            Vec::new()
        }
    }
}

/// Terminal machine absorbing duplicate 2xx retransmissions after an
/// INVITE transaction's logical completion.
#[derive(Debug, Default)]
pub struct StaleFsm;

impl StaleFsm {
    pub fn new() -> Self {
        Self
    }

    pub fn on_event(&mut self, event: TxnEvent) -> Vec<Action> {
        match event {
            // Duplicate 2xx still goes up so the TU can re-ACK.
            TxnEvent::WireResponse(resp) if resp.is_success() => {
                vec![Action::DeliverToTu(resp.into())]
            }
            TxnEvent::Timer(TimerKind::Stale) => vec![destroy("stale retention expired")],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sip_core::{Headers, RequestLine, StatusLine};

    use super::*;

    fn config() -> TimerConfig {
        TimerConfig::default()
    }

    fn sample_request(method: Method) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host.invalid;branch=z9hG4bKfsm");
        headers.push("From", "<sip:a@a.invalid>;tag=1");
        headers.push("To", "<sip:b@b.invalid>");
        headers.push("Call-ID", "fsm-test");
        headers.push("CSeq", format!("1 {}", method.as_str()));
        Request::new(
            RequestLine::new(method, "sip:b@b.invalid"),
            headers,
            Bytes::new(),
        )
    }

    fn sample_response(code: u16) -> Response {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host.invalid;branch=z9hG4bKfsm");
        headers.push("CSeq", "1 INVITE");
        Response::new(StatusLine::new(code, "X"), headers, Bytes::new())
    }

    fn schedules(actions: &[Action], kind: TimerKind) -> Vec<Duration> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Schedule { kind: k, duration } if *k == kind => Some(*duration),
                _ => None,
            })
            .collect()
    }

    fn has_destroy(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::Destroy { .. }))
    }

    #[test]
    fn client_non_invite_schedules_f_then_e1_after_unreliable_send() {
        let mut fsm = ClientNonInviteFsm::new(config(), false);
        let actions = fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Register)));
        assert_eq!(schedules(&actions, TimerKind::F), vec![Duration::from_secs(32)]);
        assert!(actions.iter().any(|a| matches!(a, Action::Send(_))));

        let actions = fsm.on_event(TxnEvent::Sent { reliable: false });
        assert_eq!(schedules(&actions, TimerKind::E1), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn client_non_invite_e1_backoff_caps_at_t2() {
        let mut fsm = ClientNonInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Register)));
        fsm.on_event(TxnEvent::Sent { reliable: false });

        let mut intervals = Vec::new();
        for _ in 0..5 {
            let actions = fsm.on_event(TxnEvent::Timer(TimerKind::E1));
            assert!(actions.iter().any(|a| matches!(a, Action::Retransmit(_))));
            intervals.extend(schedules(&actions, TimerKind::E1));
        }
        let millis: Vec<u128> = intervals.iter().map(|d| d.as_millis()).collect();
        assert_eq!(millis, vec![1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn client_non_invite_timer_f_synthesizes_408() {
        let mut fsm = ClientNonInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Register)));
        let actions = fsm.on_event(TxnEvent::Timer(TimerKind::F));
        let delivered = actions.iter().find_map(|a| match a {
            Action::DeliverToTu(SipMessage::Response(resp)) => Some(resp.code()),
            _ => None,
        });
        assert_eq!(delivered, Some(408));
        assert!(has_destroy(&actions));
    }

    #[test]
    fn client_non_invite_final_over_reliable_destroys_without_k() {
        let mut fsm = ClientNonInviteFsm::new(config(), true);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Register)));
        let actions = fsm.on_event(TxnEvent::WireResponse(sample_response(200)));
        assert!(has_destroy(&actions));
        assert!(schedules(&actions, TimerKind::K).is_empty());
    }

    #[test]
    fn client_non_invite_final_over_udp_completes_with_k() {
        let mut fsm = ClientNonInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Register)));
        let actions = fsm.on_event(TxnEvent::WireResponse(sample_response(200)));
        assert_eq!(fsm.state(), TxnState::Completed);
        assert_eq!(schedules(&actions, TimerKind::K), vec![Duration::from_secs(5)]);

        // Late E1 in Completed is absorbed.
        assert!(fsm.on_event(TxnEvent::Timer(TimerKind::E1)).is_empty());
        assert!(has_destroy(&fsm.on_event(TxnEvent::Timer(TimerKind::K))));
    }

    #[test]
    fn client_invite_2xx_promotes_to_stale() {
        let mut fsm = ClientInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Invite)));
        fsm.on_event(TxnEvent::Sent { reliable: false });

        let actions = fsm.on_event(TxnEvent::WireResponse(sample_response(200)));
        assert_eq!(fsm.state(), TxnState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, Action::PromoteToStale)));
        assert_eq!(schedules(&actions, TimerKind::Stale), vec![Duration::from_secs(32)]);
        assert!(actions.iter().any(|a| matches!(a, Action::DeliverToTu(_))));
    }

    #[test]
    fn client_invite_486_generates_ack_and_absorbs_duplicates() {
        let mut fsm = ClientInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Invite)));

        let actions = fsm.on_event(TxnEvent::WireResponse(sample_response(486)));
        assert_eq!(fsm.state(), TxnState::Completed);
        assert_eq!(schedules(&actions, TimerKind::D), vec![Duration::from_secs(32)]);
        let ack = actions.iter().find_map(|a| match a {
            Action::Retransmit(SipMessage::Request(req)) => Some(req.clone()),
            _ => None,
        });
        let ack = ack.expect("failure final must emit an ACK");
        assert_eq!(ack.method(), &Method::Ack);
        assert_eq!(
            ack.headers.get("Via"),
            sample_request(Method::Invite).headers.get("Via"),
            "ACK keeps the INVITE branch"
        );
        assert!(actions.iter().any(|a| matches!(a, Action::DeliverToTu(_))));

        // Duplicate 486: retransmit the ACK, nothing to the TU.
        let actions = fsm.on_event(TxnEvent::WireResponse(sample_response(486)));
        assert!(actions.iter().any(|a| matches!(a, Action::Retransmit(_))));
        assert!(!actions.iter().any(|a| matches!(a, Action::DeliverToTu(_))));

        assert!(has_destroy(&fsm.on_event(TxnEvent::Timer(TimerKind::D))));
    }

    #[test]
    fn client_invite_timer_a_retransmits_only_in_calling() {
        let mut fsm = ClientInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Invite)));
        fsm.on_event(TxnEvent::Sent { reliable: false });

        let actions = fsm.on_event(TxnEvent::Timer(TimerKind::A));
        assert_eq!(schedules(&actions, TimerKind::A), vec![Duration::from_secs(1)]);

        fsm.on_event(TxnEvent::WireResponse(sample_response(180)));
        assert_eq!(fsm.state(), TxnState::Proceeding);
        assert!(fsm.on_event(TxnEvent::Timer(TimerKind::A)).is_empty());
    }

    #[test]
    fn client_invite_timer_b_times_out_with_408() {
        let mut fsm = ClientInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuRequest(sample_request(Method::Invite)));
        let actions = fsm.on_event(TxnEvent::Timer(TimerKind::B));
        let delivered = actions.iter().find_map(|a| match a {
            Action::DeliverToTu(SipMessage::Response(resp)) => Some(resp.code()),
            _ => None,
        });
        assert_eq!(delivered, Some(408));
        assert!(has_destroy(&actions));
    }

    #[test]
    fn server_non_invite_ignores_retransmission_in_trying() {
        let mut fsm = ServerNonInviteFsm::new(config(), false);
        let actions = fsm.on_event(TxnEvent::WireRequest(sample_request(Method::Register)));
        assert!(actions.is_empty(), "no response exists yet in Trying");
    }

    #[test]
    fn server_non_invite_final_completes_and_retransmits() {
        let mut fsm = ServerNonInviteFsm::new(config(), false);
        fsm.on_event(TxnEvent::TuResponse(sample_response(180)));
        assert_eq!(fsm.state(), TxnState::Proceeding);

        let actions = fsm.on_event(TxnEvent::TuResponse(sample_response(200)));
        assert_eq!(fsm.state(), TxnState::Completed);
        assert_eq!(schedules(&actions, TimerKind::J), vec![Duration::from_secs(32)]);

        // Retransmitted request answered from the stored final, unmodified.
        let actions = fsm.on_event(TxnEvent::WireRequest(sample_request(Method::Register)));
        let retransmitted = actions.iter().find_map(|a| match a {
            Action::Retransmit(SipMessage::Response(resp)) => Some(resp.code()),
            _ => None,
        });
        assert_eq!(retransmitted, Some(200));

        assert!(has_destroy(&fsm.on_event(TxnEvent::Timer(TimerKind::J))));
    }

    #[test]
    fn server_non_invite_final_over_reliable_destroys() {
        let mut fsm = ServerNonInviteFsm::new(config(), true);
        let actions = fsm.on_event(TxnEvent::TuResponse(sample_response(200)));
        assert!(actions.iter().any(|a| matches!(a, Action::Send(_))));
        assert!(has_destroy(&actions));
    }

    fn server_invite() -> ServerInviteFsm {
        let hundred = make_response(&sample_request(Method::Invite), 100, "Trying");
        ServerInviteFsm::new(config(), false, hundred)
    }

    #[test]
    fn server_invite_timer_trying_sends_stored_provisional() {
        let mut fsm = server_invite();
        // TU provisional replaces the pre-formed 100 before T100 fires.
        fsm.on_event(TxnEvent::TuResponse(sample_response(180)));

        let actions = fsm.on_event(TxnEvent::Timer(TimerKind::Trying));
        let sent = actions.iter().find_map(|a| match a {
            Action::Send(SipMessage::Response(resp)) => Some(resp.code()),
            _ => None,
        });
        assert_eq!(sent, Some(180), "stored provisional goes out, not a 100");
    }

    #[test]
    fn server_invite_failure_final_retransmits_on_g_until_ack() {
        let mut fsm = server_invite();
        let actions = fsm.on_event(TxnEvent::TuResponse(sample_response(486)));
        assert_eq!(fsm.state(), TxnState::Completed);
        assert_eq!(schedules(&actions, TimerKind::H), vec![Duration::from_secs(32)]);
        assert_eq!(schedules(&actions, TimerKind::G), vec![Duration::from_millis(500)]);

        let mut g_intervals = Vec::new();
        for _ in 0..4 {
            let actions = fsm.on_event(TxnEvent::Timer(TimerKind::G));
            let retransmitted = actions.iter().find_map(|a| match a {
                Action::Retransmit(SipMessage::Response(resp)) => Some(resp.code()),
                _ => None,
            });
            assert_eq!(retransmitted, Some(486), "stored final never changes");
            g_intervals.extend(schedules(&actions, TimerKind::G));
        }
        let millis: Vec<u128> = g_intervals.iter().map(|d| d.as_millis()).collect();
        assert_eq!(millis, vec![1000, 2000, 4000, 4000]);

        let actions = fsm.on_event(TxnEvent::WireRequest(sample_request(Method::Ack)));
        assert_eq!(fsm.state(), TxnState::Confirmed);
        assert_eq!(schedules(&actions, TimerKind::I), vec![Duration::from_secs(5)]);

        // G after the ACK is absorbed by the state guard.
        assert!(fsm.on_event(TxnEvent::Timer(TimerKind::G)).is_empty());
        assert!(has_destroy(&fsm.on_event(TxnEvent::Timer(TimerKind::I))));
    }

    #[test]
    fn server_invite_timer_h_destroys_without_ack() {
        let mut fsm = server_invite();
        fsm.on_event(TxnEvent::TuResponse(sample_response(486)));
        assert!(has_destroy(&fsm.on_event(TxnEvent::Timer(TimerKind::H))));
    }

    #[test]
    fn server_invite_2xx_promotes_to_stale() {
        let mut fsm = server_invite();
        let actions = fsm.on_event(TxnEvent::TuResponse(sample_response(200)));
        assert_eq!(fsm.state(), TxnState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, Action::PromoteToStale)));
        assert!(actions.iter().any(|a| matches!(a, Action::Send(_))));
    }

    #[test]
    fn server_invite_retransmitted_invite_answered_from_stored_response() {
        let mut fsm = server_invite();
        let actions = fsm.on_event(TxnEvent::WireRequest(sample_request(Method::Invite)));
        let retransmitted = actions.iter().find_map(|a| match a {
            Action::Retransmit(SipMessage::Response(resp)) => Some(resp.code()),
            _ => None,
        });
        assert_eq!(retransmitted, Some(100));
    }

    #[test]
    fn stale_absorbs_duplicate_2xx_and_expires() {
        let mut fsm = StaleFsm::new();
        let actions = fsm.on_event(TxnEvent::WireResponse(sample_response(200)));
        assert!(actions.iter().any(|a| matches!(a, Action::DeliverToTu(_))));
        assert!(!has_destroy(&actions));

        assert!(fsm.on_event(TxnEvent::WireResponse(sample_response(486))).is_empty());
        assert!(has_destroy(&fsm.on_event(TxnEvent::Timer(TimerKind::Stale))));
    }
}
