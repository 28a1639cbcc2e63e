//! Call session state machine.
//!
//! Sequences the offer/answer exchange for one call at a time. Uses the action
//! pattern: every input is a [`CallEvent`] and the machine answers with the
//! [`CallAction`]s the driver must execute. The machine never performs I/O;
//! media operations and relay writes complete asynchronously and come back as
//! events tagged with the [`SessionId`] they were issued for.
//!
//! # State Machine
//!
//! ```text
//!            StartCall          LocalDescriptionReady       Answer
//!  ┌──────┐ ─────────> ┌─────────┐ ────────> ┌───────────┐ ──────> ┌────────────────┐
//!  │ Idle │            │ Dialing │           │ OfferSent │         │ AnswerReceived │
//!  └──────┘            └─────────┘           └───────────┘         └────────────────┘
//!     │ Offer                                                              │
//!     ↓                AcceptCall +                                        │ transport
//!  ┌───────────────┐   LocalDescriptionReady   ┌────────────┐              │ Connected
//!  │ OfferReceived │ ────────────────────────> │ AnswerSent │ ──────┐      ↓
//!  └───────────────┘                           └────────────┘       └──> ┌───────────┐
//!                                                                        │ Connected │
//!                                                                        └───────────┘
//!
//!  any non-terminal state ── EndCall / HangUp / Closed ──> Ended(reason)
//!                         ── negotiation or send failure ─> Failed(kind)
//! ```
//!
//! # Invariants
//!
//! - At most one non-terminal session exists.
//! - A session's role never changes.
//! - Inbound envelopes invalid for the current state, or sent by anyone other
//!   than the session peer, never cause a transition.
//! - Completions carrying a stale [`SessionId`] are discarded.
//! - Local candidates are held until the peer has read our offer or answer.
//!   The relay keeps one value per mailbox, so an earlier send would replace
//!   the description.

use std::{fmt, mem, ops::Sub, time::Duration};

use callframe_proto::{Envelope, EnvelopeKind, IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, info, warn};

use crate::{
    env::Environment,
    error::{ErrorKind, SessionError},
    media::{RemoteStream, TransportState},
};

/// `EndCall` reason for a local hang-up.
pub const END_HANGUP: &str = "hangup";

/// `EndCall` reason for a declined incoming call.
pub const END_REJECTED: &str = "rejected";

/// `EndCall` reason sent to a caller while another call is active.
pub const END_BUSY: &str = "busy";

/// `EndCall` reason for a local negotiation or device failure.
pub const END_ERROR: &str = "error";

/// `EndCall` payload: `<reason>:<token>`.
///
/// The relay drops a write equal to the value already in the mailbox, so two
/// ends with the same reason must still differ. `token` is the session id, or
/// a fresh random value when there is no session to name.
pub fn end_payload(reason: &str, token: SessionId) -> String {
    format!("{reason}:{token}")
}

/// Random identifier of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw identifier.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Which side initiated the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Local side sent the offer
    Caller,
    /// Local side received the offer
    Callee,
}

/// Why a call ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// Local user hung up
    LocalHangUp,
    /// Remote peer hung up
    RemoteHangUp,
    /// Local user declined the incoming call
    Rejected,
    /// Remote peer declined our call
    Declined,
    /// Remote peer was already in a call
    Busy,
    /// Media transport closed
    TransportClosed,
}

impl EndReason {
    /// Reason carried by an inbound `EndCall` payload.
    ///
    /// Only the part before the first `:` counts. Unknown reasons read as a
    /// remote hang-up.
    pub fn from_wire(payload: &str) -> Self {
        let reason = payload.split_once(':').map_or(payload, |(reason, _)| reason);
        match reason {
            END_BUSY => Self::Busy,
            END_REJECTED => Self::Declined,
            _ => Self::RemoteHangUp,
        }
    }
}

/// Call session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// No session
    Idle,
    /// Caller is producing its offer
    Dialing,
    /// Offer sent, waiting for the answer
    OfferSent,
    /// Answer applied, waiting for the media path
    AnswerReceived,
    /// Offer received, waiting for the local user
    OfferReceived,
    /// Answer sent, waiting for the media path
    AnswerSent,
    /// Media path established
    Connected,
    /// Call ended normally
    Ended(EndReason),
    /// Call ended on an error
    Failed(ErrorKind),
}

impl CallState {
    /// `Ended` or `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended(_) | Self::Failed(_))
    }
}

/// Upward notification for observers (UI, logging).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotification {
    /// Session changed state
    StateChanged {
        /// Session that changed
        session: SessionId,
        /// New state
        state: CallState,
    },
    /// Media transport health changed
    ConnectionStateChanged {
        /// Session owning the transport
        session: SessionId,
        /// New transport state
        state: TransportState,
    },
    /// A remote peer is calling
    IncomingCall {
        /// New callee session
        session: SessionId,
        /// Caller address
        peer: String,
    },
    /// Remote media is flowing
    RemoteMediaAvailable {
        /// Session receiving media
        session: SessionId,
        /// Remote stream description
        stream: RemoteStream,
    },
    /// Session reached a terminal state
    CallEnded {
        /// Session that ended
        session: SessionId,
        /// Remote peer
        peer: String,
        /// Terminal state
        state: CallState,
        /// Time spent connected, `None` if the call never connected
        duration: Option<Duration>,
    },
    /// Something went wrong
    Error {
        /// Session affected, if any
        session: Option<SessionId>,
        /// Failure category
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
}

/// Inputs to the call state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Local intent: call `peer`
    StartCall {
        /// Address to call
        peer: String,
    },
    /// Local intent: answer the incoming call
    AcceptCall,
    /// Local intent: decline the incoming call
    RejectCall,
    /// Local intent: end the current call
    HangUp,
    /// Envelope delivered by the signaling channel
    EnvelopeReceived(Envelope),
    /// Controller produced and installed a local description
    LocalDescriptionReady {
        /// Session the operation was issued for
        session: SessionId,
        /// The description to send
        description: SessionDescription,
    },
    /// Controller applied the remote description
    RemoteDescriptionApplied {
        /// Session the operation was issued for
        session: SessionId,
    },
    /// Transport gathered a local candidate
    LocalCandidate {
        /// Session owning the transport
        session: SessionId,
        /// Candidate to forward to the peer
        candidate: IceCandidate,
    },
    /// Transport health changed
    TransportStateChanged {
        /// Session owning the transport
        session: SessionId,
        /// New transport state
        state: TransportState,
    },
    /// Remote media arrived
    RemoteMedia {
        /// Session owning the transport
        session: SessionId,
        /// Remote stream description
        stream: RemoteStream,
    },
    /// Relay write for this session failed
    SendFailed {
        /// Session the envelope belonged to
        session: SessionId,
        /// Failure category
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
    /// Device or negotiation operation failed
    LocalFailure {
        /// Session the operation was issued for
        session: SessionId,
        /// Failure category
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
}

/// Actions the driver executes on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAction {
    /// Create the negotiation object for a new callee session
    PrepareTransport {
        /// New session
        session: SessionId,
    },
    /// Produce and install an offer, then report `LocalDescriptionReady`
    CreateOffer {
        /// Session to produce for
        session: SessionId,
    },
    /// Produce and install an answer, then report `LocalDescriptionReady`
    CreateAnswer {
        /// Session to produce for
        session: SessionId,
    },
    /// Apply the peer's description, then report `RemoteDescriptionApplied`
    ApplyRemoteDescription {
        /// Session to apply to
        session: SessionId,
        /// Peer's description
        description: SessionDescription,
    },
    /// Hand a remote candidate to the controller
    AddRemoteCandidate {
        /// Session to apply to
        session: SessionId,
        /// Peer's candidate
        candidate: IceCandidate,
    },
    /// Write an envelope; a failure is reported as `SendFailed`
    Send {
        /// Session the envelope belongs to
        session: SessionId,
        /// Envelope to write
        envelope: Envelope,
    },
    /// Write an envelope; a failure is only logged
    SendBestEffort {
        /// Envelope to write
        envelope: Envelope,
    },
    /// Release every media resource of the session
    Teardown {
        /// Session to release
        session: SessionId,
    },
    /// Publish to observers
    Notify(CallNotification),
}

/// Bookkeeping for one call attempt.
#[derive(Debug, Clone)]
pub struct CallSession<I> {
    id: SessionId,
    peer: String,
    role: Role,
    state: CallState,
    started_at: I,
    connected_at: Option<I>,
    remote_description_applied: bool,
    answer_requested: bool,
    local_description_sent: bool,
    transport_connected: bool,
    candidates_released: bool,
    queued_local_candidates: Vec<IceCandidate>,
}

impl<I: Copy> CallSession<I> {
    fn new(id: SessionId, peer: String, role: Role, state: CallState, now: I) -> Self {
        Self {
            id,
            peer,
            role,
            state,
            started_at: now,
            connected_at: None,
            remote_description_applied: false,
            answer_requested: false,
            local_description_sent: false,
            transport_connected: false,
            candidates_released: false,
            queued_local_candidates: Vec::new(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote peer address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Role fixed at creation.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> CallState {
        self.state
    }

    /// When the session was created.
    pub fn started_at(&self) -> I {
        self.started_at
    }

    /// When the media path came up.
    pub fn connected_at(&self) -> Option<I> {
        self.connected_at
    }

    /// Whether the peer's description has been applied.
    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    /// Local candidates held until the peer has read our description.
    pub fn queued_local_candidates(&self) -> &[IceCandidate] {
        &self.queued_local_candidates
    }

    /// Whether local candidates go straight to the peer.
    ///
    /// The caller releases them when the answer arrives. The callee releases
    /// them when the first caller candidate arrives after its answer went out.
    /// Until then a candidate written to the peer's single-slot mailbox could
    /// replace our unread offer or answer.
    pub fn candidates_released(&self) -> bool {
        self.candidates_released
    }
}

/// Call session state machine.
///
/// Owns at most one [`CallSession`]. A terminal session stays readable until
/// the next call replaces it.
#[derive(Debug)]
pub struct CallMachine<E: Environment> {
    env: E,
    local_address: String,
    session: Option<CallSession<E::Instant>>,
}

impl<E: Environment> CallMachine<E> {
    /// Machine for the peer registered as `local_address`.
    pub fn new(env: E, local_address: impl Into<String>) -> Self {
        Self { env, local_address: local_address.into(), session: None }
    }

    /// Local peer address.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Current session, terminal or not.
    pub fn session(&self) -> Option<&CallSession<E::Instant>> {
        self.session.as_ref()
    }

    /// Current state. `Idle` when no session was ever created.
    pub fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    /// Whether a non-terminal session exists.
    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.state.is_terminal())
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// Only local intents fail:
    ///
    /// - `SessionError::InvalidState` if the intent does not fit the state
    /// - `SessionError::NoSession` for accept/reject without a session
    /// - `SessionError::InvalidPeer` for an empty or self address
    pub fn handle(&mut self, event: CallEvent) -> Result<Vec<CallAction>, SessionError> {
        match event {
            CallEvent::StartCall { peer } => self.start_call(peer),
            CallEvent::AcceptCall => self.accept_call(),
            CallEvent::RejectCall => self.reject_call(),
            CallEvent::HangUp => Ok(self.hang_up()),
            CallEvent::EnvelopeReceived(envelope) => Ok(self.handle_envelope(envelope)),
            CallEvent::LocalDescriptionReady { session, description } => {
                Ok(self.local_description_ready(session, description))
            },
            CallEvent::RemoteDescriptionApplied { session } => {
                Ok(self.remote_description_applied(session))
            },
            CallEvent::LocalCandidate { session, candidate } => {
                Ok(self.local_candidate(session, candidate))
            },
            CallEvent::TransportStateChanged { session, state } => {
                Ok(self.transport_state_changed(session, state))
            },
            CallEvent::RemoteMedia { session, stream } => Ok(self.remote_media(session, stream)),
            CallEvent::SendFailed { session, kind, detail } => {
                Ok(self.fail(session, kind, detail, false))
            },
            CallEvent::LocalFailure { session, kind, detail } => {
                Ok(self.fail(session, kind, detail, true))
            },
        }
    }

    fn start_call(&mut self, peer: String) -> Result<Vec<CallAction>, SessionError> {
        if let Some(session) = self.session.as_ref().filter(|s| !s.state.is_terminal()) {
            return Err(SessionError::InvalidState {
                state: session.state,
                operation: "start_call".to_string(),
            });
        }

        Envelope::new(peer.as_str(), self.local_address.as_str(), EnvelopeKind::Offer, "")?;

        let id = self.open_session(peer, Role::Caller, CallState::Dialing);
        Ok(vec![
            CallAction::Notify(CallNotification::StateChanged {
                session: id,
                state: CallState::Dialing,
            }),
            CallAction::CreateOffer { session: id },
        ])
    }

    fn accept_call(&mut self) -> Result<Vec<CallAction>, SessionError> {
        let Some(session) = active_session(&mut self.session) else {
            return Err(SessionError::NoSession { operation: "accept_call".to_string() });
        };

        if session.role != Role::Callee
            || session.state != CallState::OfferReceived
            || session.answer_requested
        {
            return Err(SessionError::InvalidState {
                state: session.state,
                operation: "accept_call".to_string(),
            });
        }

        session.answer_requested = true;
        info!(session = %session.id, peer = %session.peer, "accepting call");

        if session.remote_description_applied {
            Ok(vec![CallAction::CreateAnswer { session: session.id }])
        } else {
            // Answer is produced once the offer has been applied
            Ok(vec![])
        }
    }

    fn reject_call(&mut self) -> Result<Vec<CallAction>, SessionError> {
        let now = self.env.now();
        let Some(session) = active_session(&mut self.session) else {
            return Err(SessionError::NoSession { operation: "reject_call".to_string() });
        };

        if session.state != CallState::OfferReceived {
            return Err(SessionError::InvalidState {
                state: session.state,
                operation: "reject_call".to_string(),
            });
        }

        info!(session = %session.id, peer = %session.peer, "rejecting call");
        let mut actions = vec![CallAction::SendBestEffort {
            envelope: end_envelope(session, &self.local_address, END_REJECTED),
        }];
        terminate(session, CallState::Ended(EndReason::Rejected), now, &mut actions);
        Ok(actions)
    }

    fn hang_up(&mut self) -> Vec<CallAction> {
        let now = self.env.now();
        let Some(session) = active_session(&mut self.session) else {
            debug!("hang up without an active call");
            return Vec::new();
        };

        info!(session = %session.id, peer = %session.peer, state = ?session.state, "hanging up");
        let mut actions = vec![CallAction::SendBestEffort {
            envelope: end_envelope(session, &self.local_address, END_HANGUP),
        }];
        terminate(session, CallState::Ended(EndReason::LocalHangUp), now, &mut actions);
        actions
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Vec<CallAction> {
        if envelope.target != self.local_address {
            debug!(recipient = %envelope.target, "ignoring envelope for another address");
            return Vec::new();
        }

        match envelope.kind {
            EnvelopeKind::Offer => self.on_offer(envelope),
            EnvelopeKind::Answer => self.on_answer(envelope),
            EnvelopeKind::IceCandidate => self.on_remote_candidate(&envelope),
            EnvelopeKind::EndCall => self.on_end_call(&envelope),
        }
    }

    fn on_offer(&mut self, envelope: Envelope) -> Vec<CallAction> {
        if envelope.sender.is_empty() || envelope.sender == self.local_address {
            warn!(sender = %envelope.sender, "ignoring offer without a usable sender");
            return Vec::new();
        }

        if let Some(session) = self.session.as_ref().filter(|s| !s.state.is_terminal()) {
            if envelope.sender == session.peer {
                debug!(session = %session.id, "ignoring repeated offer from current peer");
                return Vec::new();
            }

            warn!(
                session = %session.id,
                state = ?session.state,
                peer = %envelope.sender,
                "rejecting offer while a call is active"
            );
            let token = SessionId::new(self.env.random_u64());
            return vec![CallAction::SendBestEffort {
                envelope: Envelope {
                    target: envelope.sender,
                    sender: self.local_address.clone(),
                    payload: end_payload(END_BUSY, token),
                    kind: EnvelopeKind::EndCall,
                },
            }];
        }

        let peer = envelope.sender;
        let id = self.open_session(peer.clone(), Role::Callee, CallState::OfferReceived);

        vec![
            CallAction::Notify(CallNotification::StateChanged {
                session: id,
                state: CallState::OfferReceived,
            }),
            CallAction::PrepareTransport { session: id },
            CallAction::ApplyRemoteDescription {
                session: id,
                description: SessionDescription::offer(envelope.payload),
            },
            CallAction::Notify(CallNotification::IncomingCall { session: id, peer }),
        ]
    }

    fn on_answer(&mut self, envelope: Envelope) -> Vec<CallAction> {
        let now = self.env.now();
        let state = self.state();
        let Some(session) = active_session(&mut self.session)
            .filter(|s| s.peer == envelope.sender && s.state == CallState::OfferSent)
        else {
            debug!(sender = %envelope.sender, ?state, "ignoring answer");
            return Vec::new();
        };

        let mut actions = vec![CallAction::ApplyRemoteDescription {
            session: session.id,
            description: SessionDescription::answer(envelope.payload),
        }];
        set_state(session, CallState::AnswerReceived, &mut actions);
        release_candidates(session, &self.local_address, &mut actions);
        promote_if_connected(session, now, &mut actions);
        actions
    }

    fn on_remote_candidate(&mut self, envelope: &Envelope) -> Vec<CallAction> {
        let Some(session) =
            active_session(&mut self.session).filter(|s| s.peer == envelope.sender)
        else {
            debug!(sender = %envelope.sender, "ignoring candidate");
            return Vec::new();
        };

        let candidate = match IceCandidate::from_payload(&envelope.payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(session = %session.id, error = %e, "dropping malformed candidate");
                return Vec::new();
            },
        };

        let mut actions = vec![CallAction::AddRemoteCandidate { session: session.id, candidate }];
        // The caller only trickles after reading our answer
        if session.role == Role::Callee && session.local_description_sent {
            release_candidates(session, &self.local_address, &mut actions);
        }
        actions
    }

    fn on_end_call(&mut self, envelope: &Envelope) -> Vec<CallAction> {
        let now = self.env.now();
        let Some(session) =
            active_session(&mut self.session).filter(|s| s.peer == envelope.sender)
        else {
            debug!(sender = %envelope.sender, "ignoring end call");
            return Vec::new();
        };

        let reason = EndReason::from_wire(&envelope.payload);
        info!(session = %session.id, peer = %session.peer, ?reason, "peer ended call");

        let mut actions = Vec::new();
        terminate(session, CallState::Ended(reason), now, &mut actions);
        actions
    }

    fn local_description_ready(
        &mut self,
        id: SessionId,
        description: SessionDescription,
    ) -> Vec<CallAction> {
        let now = self.env.now();
        let Some(session) = live_session(&mut self.session, id) else {
            debug!(session = %id, "discarding stale local description");
            return Vec::new();
        };

        let next = match (description.kind, session.state) {
            (SdpKind::Offer, CallState::Dialing) => CallState::OfferSent,
            (SdpKind::Answer, CallState::OfferReceived) if session.answer_requested => {
                CallState::AnswerSent
            },
            (kind, state) => {
                warn!(session = %id, ?kind, ?state, "unexpected local description");
                return Vec::new();
            },
        };

        let mut actions = vec![CallAction::Send {
            session: id,
            envelope: envelope_to(
                session,
                &self.local_address,
                description.kind.envelope_kind(),
                description.sdp,
            ),
        }];

        session.local_description_sent = true;
        set_state(session, next, &mut actions);
        if next == CallState::AnswerSent {
            promote_if_connected(session, now, &mut actions);
        }
        actions
    }

    fn remote_description_applied(&mut self, id: SessionId) -> Vec<CallAction> {
        let Some(session) = live_session(&mut self.session, id) else {
            debug!(session = %id, "discarding stale remote description completion");
            return Vec::new();
        };

        session.remote_description_applied = true;

        if session.role == Role::Callee
            && session.state == CallState::OfferReceived
            && session.answer_requested
        {
            vec![CallAction::CreateAnswer { session: id }]
        } else {
            Vec::new()
        }
    }

    fn local_candidate(&mut self, id: SessionId, candidate: IceCandidate) -> Vec<CallAction> {
        let Some(session) = live_session(&mut self.session, id) else {
            debug!(session = %id, "discarding stale local candidate");
            return Vec::new();
        };

        if !session.candidates_released {
            session.queued_local_candidates.push(candidate);
            return Vec::new();
        }

        candidate_envelope(session, &self.local_address, &candidate)
            .map(|envelope| CallAction::Send { session: id, envelope })
            .into_iter()
            .collect()
    }

    fn transport_state_changed(&mut self, id: SessionId, state: TransportState) -> Vec<CallAction> {
        let now = self.env.now();
        let Some(session) = live_session(&mut self.session, id) else {
            debug!(session = %id, ?state, "discarding stale transport state");
            return Vec::new();
        };

        let mut actions =
            vec![CallAction::Notify(CallNotification::ConnectionStateChanged { session: id, state })];

        match state {
            TransportState::Connected => {
                session.transport_connected = true;
                promote_if_connected(session, now, &mut actions);
            },
            TransportState::Disconnected => {
                session.transport_connected = false;
                info!(session = %id, "media path disconnected, waiting for recovery");
            },
            TransportState::Failed => {
                warn!(session = %id, "media path failed");
                actions.push(CallAction::Notify(CallNotification::Error {
                    session: Some(id),
                    kind: ErrorKind::TransportDisconnected,
                    detail: "media transport failed".to_string(),
                }));
                let failed = CallState::Failed(ErrorKind::TransportDisconnected);
                terminate(session, failed, now, &mut actions);
            },
            TransportState::Closed => {
                let closed = CallState::Ended(EndReason::TransportClosed);
                terminate(session, closed, now, &mut actions);
            },
            TransportState::New | TransportState::Checking => {},
        }

        actions
    }

    fn remote_media(&mut self, id: SessionId, stream: RemoteStream) -> Vec<CallAction> {
        if live_session(&mut self.session, id).is_none() {
            debug!(session = %id, "discarding stale remote media");
            return Vec::new();
        }

        vec![CallAction::Notify(CallNotification::RemoteMediaAvailable { session: id, stream })]
    }

    fn fail(
        &mut self,
        id: SessionId,
        kind: ErrorKind,
        detail: String,
        notify_peer: bool,
    ) -> Vec<CallAction> {
        let now = self.env.now();
        let Some(session) = live_session(&mut self.session, id) else {
            debug!(session = %id, %kind, "discarding stale failure");
            return Vec::new();
        };

        warn!(session = %id, peer = %session.peer, %kind, %detail, "call failed");

        let mut actions = Vec::new();
        if notify_peer {
            actions.push(CallAction::SendBestEffort {
                envelope: end_envelope(session, &self.local_address, END_ERROR),
            });
        }
        actions.push(CallAction::Notify(CallNotification::Error { session: Some(id), kind, detail }));
        terminate(session, CallState::Failed(kind), now, &mut actions);
        actions
    }

    fn open_session(&mut self, peer: String, role: Role, state: CallState) -> SessionId {
        let id = SessionId::new(self.env.random_u64());
        info!(session = %id, %peer, ?role, "opening call session");
        self.session = Some(CallSession::new(id, peer, role, state, self.env.now()));
        id
    }
}

fn active_session<I>(slot: &mut Option<CallSession<I>>) -> Option<&mut CallSession<I>> {
    slot.as_mut().filter(|s| !s.state.is_terminal())
}

fn live_session<I>(slot: &mut Option<CallSession<I>>, id: SessionId) -> Option<&mut CallSession<I>> {
    active_session(slot).filter(|s| s.id == id)
}

fn envelope_to<I>(
    session: &CallSession<I>,
    local_address: &str,
    kind: EnvelopeKind,
    payload: impl Into<String>,
) -> Envelope {
    Envelope {
        target: session.peer.clone(),
        sender: local_address.to_string(),
        payload: payload.into(),
        kind,
    }
}

fn candidate_envelope<I>(
    session: &CallSession<I>,
    local_address: &str,
    candidate: &IceCandidate,
) -> Option<Envelope> {
    match candidate.to_payload() {
        Ok(payload) => Some(envelope_to(session, local_address, EnvelopeKind::IceCandidate, payload)),
        Err(e) => {
            warn!(session = %session.id, error = %e, "dropping unserializable candidate");
            None
        },
    }
}

fn end_envelope<I>(session: &CallSession<I>, local_address: &str, reason: &str) -> Envelope {
    envelope_to(session, local_address, EnvelopeKind::EndCall, end_payload(reason, session.id))
}

/// Send the held local candidates, oldest first, and stop holding.
fn release_candidates<I>(
    session: &mut CallSession<I>,
    local_address: &str,
    actions: &mut Vec<CallAction>,
) {
    if session.candidates_released {
        return;
    }
    session.candidates_released = true;

    let held = mem::take(&mut session.queued_local_candidates);
    debug!(session = %session.id, held = held.len(), "releasing local candidates");
    for candidate in held {
        if let Some(envelope) = candidate_envelope(session, local_address, &candidate) {
            actions.push(CallAction::Send { session: session.id, envelope });
        }
    }
}

fn set_state<I>(session: &mut CallSession<I>, state: CallState, actions: &mut Vec<CallAction>) {
    debug!(session = %session.id, from = ?session.state, to = ?state, "call state changed");
    session.state = state;
    actions.push(CallAction::Notify(CallNotification::StateChanged { session: session.id, state }));
}

/// Move to `Connected` once both the exchange finished and the path is up.
///
/// The transport can report `Connected` before the local answer completion
/// reaches the machine, so either order is accepted.
fn promote_if_connected<I: Copy>(
    session: &mut CallSession<I>,
    now: I,
    actions: &mut Vec<CallAction>,
) {
    let exchanged = matches!(session.state, CallState::AnswerReceived | CallState::AnswerSent);
    if exchanged && session.transport_connected {
        session.connected_at = Some(now);
        info!(session = %session.id, peer = %session.peer, "call connected");
        set_state(session, CallState::Connected, actions);
    }
}

fn terminate<I: Copy + Sub<Output = Duration>>(
    session: &mut CallSession<I>,
    state: CallState,
    now: I,
    actions: &mut Vec<CallAction>,
) {
    set_state(session, state, actions);
    session.queued_local_candidates.clear();
    actions.push(CallAction::Teardown { session: session.id });
    actions.push(CallAction::Notify(CallNotification::CallEnded {
        session: session.id,
        peer: session.peer.clone(),
        state,
        duration: session.connected_at.map(|at| now - at),
    }));
}
