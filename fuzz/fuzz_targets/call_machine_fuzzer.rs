//! Fuzz target for the call state machine
//!
//! # Strategy
//!
//! - Interleave local intents, envelopes from the peer and from strangers, and
//!   media completions for current and stale sessions
//!
//! # Invariants
//!
//! - `handle` never panics
//! - a terminal state never becomes non-terminal for the same session
//! - every action that names a session names the current one
//! - a stranger never changes the state

#![no_main]

use arbitrary::Arbitrary;
use callframe_core::{
    CallAction, CallEvent, CallMachine, CallState, ErrorKind, SessionId, TransportState,
};
use callframe_harness::SimEnv;
use callframe_proto::{Envelope, EnvelopeKind, SessionDescription};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Start,
    Accept,
    Reject,
    HangUp,
    FromPeer { kind: Kind, payload: String },
    FromStranger { kind: Kind },
    LocalOffer { stale: bool },
    LocalAnswer { stale: bool },
    RemoteApplied { stale: bool },
    Transport { state: State, stale: bool },
    SendFailed { stale: bool },
}

#[derive(Debug, Clone, Copy, Arbitrary)]
enum Kind {
    Offer,
    Answer,
    Ice,
    End,
}

#[derive(Debug, Clone, Copy, Arbitrary)]
enum State {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl Kind {
    fn envelope_kind(self) -> EnvelopeKind {
        match self {
            Kind::Offer => EnvelopeKind::Offer,
            Kind::Answer => EnvelopeKind::Answer,
            Kind::Ice => EnvelopeKind::IceCandidate,
            Kind::End => EnvelopeKind::EndCall,
        }
    }
}

impl State {
    fn transport_state(self) -> TransportState {
        match self {
            State::Checking => TransportState::Checking,
            State::Connected => TransportState::Connected,
            State::Disconnected => TransportState::Disconnected,
            State::Failed => TransportState::Failed,
            State::Closed => TransportState::Closed,
        }
    }
}

fn action_session(action: &CallAction) -> Option<SessionId> {
    match action {
        CallAction::PrepareTransport { session }
        | CallAction::CreateOffer { session }
        | CallAction::CreateAnswer { session }
        | CallAction::ApplyRemoteDescription { session, .. }
        | CallAction::AddRemoteCandidate { session, .. }
        | CallAction::Send { session, .. }
        | CallAction::Teardown { session } => Some(*session),
        CallAction::SendBestEffort { .. } | CallAction::Notify(_) => None,
    }
}

fuzz_target!(|input: (u64, Vec<Op>)| {
    let (seed, ops) = input;
    let mut machine = CallMachine::new(SimEnv::with_seed(seed), "alice");

    for op in ops {
        let current = machine.session().map(|s| s.id());
        let target = match op {
            Op::LocalOffer { stale: true }
            | Op::LocalAnswer { stale: true }
            | Op::RemoteApplied { stale: true }
            | Op::Transport { stale: true, .. }
            | Op::SendFailed { stale: true } => SessionId::new(!current.map_or(0, SessionId::as_u64)),
            _ => current.unwrap_or(SessionId::new(0)),
        };
        let before = machine.state();
        let stranger = matches!(op, Op::FromStranger { .. });

        let event = match op {
            Op::Start => CallEvent::StartCall { peer: "bob".to_string() },
            Op::Accept => CallEvent::AcceptCall,
            Op::Reject => CallEvent::RejectCall,
            Op::HangUp => CallEvent::HangUp,
            Op::FromPeer { kind, payload } => CallEvent::EnvelopeReceived(Envelope {
                target: "alice".to_string(),
                sender: "bob".to_string(),
                payload,
                kind: kind.envelope_kind(),
            }),
            Op::FromStranger { kind } => CallEvent::EnvelopeReceived(Envelope {
                target: "alice".to_string(),
                sender: "mallory".to_string(),
                payload: "v=0".to_string(),
                kind: kind.envelope_kind(),
            }),
            Op::LocalOffer { .. } => CallEvent::LocalDescriptionReady {
                session: target,
                description: SessionDescription::offer("v=0"),
            },
            Op::LocalAnswer { .. } => CallEvent::LocalDescriptionReady {
                session: target,
                description: SessionDescription::answer("v=0"),
            },
            Op::RemoteApplied { .. } => CallEvent::RemoteDescriptionApplied { session: target },
            Op::Transport { state, .. } => {
                CallEvent::TransportStateChanged { session: target, state: state.transport_state() }
            },
            Op::SendFailed { .. } => CallEvent::SendFailed {
                session: target,
                kind: ErrorKind::TargetUnreachable,
                detail: "fuzz".to_string(),
            },
        };

        let Ok(actions) = machine.handle(event) else {
            assert_eq!(machine.state(), before, "rejected intent changed state");
            continue;
        };

        let after = machine.session().map(|s| s.id());
        if after == current && before.is_terminal() {
            assert_eq!(machine.state(), before, "terminal state left");
        }
        if stranger && current.is_some() && !before.is_terminal() {
            assert_eq!(machine.state(), before, "stranger changed state");
        }
        for action in &actions {
            if let Some(session) = action_session(action) {
                assert_eq!(Some(session), after, "action for another session: {action:?}");
            }
        }
        if before == CallState::Idle && after.is_none() {
            assert!(actions.is_empty());
        }
    }
});
