//! Property tests for the call machine.
//!
//! Single unexpected envelopes first, then arbitrary sequences of intents,
//! envelopes and media completions for the current and stale sessions.

use std::collections::HashMap;

use callframe_core::{
    CallAction, CallEvent, CallMachine, CallState, EndReason, ErrorKind, SessionId,
    TransportState,
};
use callframe_harness::SimEnv;
use callframe_proto::{Envelope, EnvelopeKind, IceCandidate, SessionDescription};
use proptest::{collection::vec, prelude::*};

fn dialing_machine(seed: u64) -> CallMachine<SimEnv> {
    let mut machine = CallMachine::new(SimEnv::with_seed(seed), "alice");
    machine.handle(CallEvent::StartCall { peer: "bob".to_string() }).unwrap();
    machine
}

fn kind() -> impl Strategy<Value = EnvelopeKind> {
    prop_oneof![
        Just(EnvelopeKind::Offer),
        Just(EnvelopeKind::Answer),
        Just(EnvelopeKind::IceCandidate),
        Just(EnvelopeKind::EndCall),
    ]
}

fn stranger() -> impl Strategy<Value = String> {
    "[a-z]{1,8}".prop_filter("not a participant", |s| s != "alice" && s != "bob")
}

proptest! {
    #[test]
    fn stranger_envelopes_never_change_state(
        seed in any::<u64>(),
        sender in stranger(),
        kind in kind(),
        payload in ".{0,64}",
    ) {
        let mut machine = dialing_machine(seed);
        let before = machine.state();
        let session = machine.session().map(|s| s.id());

        let envelope = Envelope { target: "alice".to_string(), sender: sender.clone(), payload, kind };
        let actions = machine.handle(CallEvent::EnvelopeReceived(envelope)).unwrap();

        prop_assert_eq!(machine.state(), before);
        prop_assert_eq!(machine.session().map(|s| s.id()), session);

        // Only a competing offer gets an answer: the busy reply.
        for action in &actions {
            match action {
                CallAction::SendBestEffort { envelope } => {
                    prop_assert_eq!(kind, EnvelopeKind::Offer);
                    prop_assert_eq!(&envelope.target, &sender);
                    prop_assert_eq!(envelope.kind, EnvelopeKind::EndCall);
                    prop_assert_eq!(EndReason::from_wire(&envelope.payload), EndReason::Busy);
                },
                other => prop_assert!(false, "unexpected action {:?}", other),
            }
        }
    }

    #[test]
    fn misaddressed_envelopes_are_ignored(
        seed in any::<u64>(),
        target in stranger(),
        kind in kind(),
        payload in ".{0,64}",
    ) {
        let mut machine = CallMachine::new(SimEnv::with_seed(seed), "alice");

        let envelope = Envelope { target, sender: "bob".to_string(), payload, kind };
        let actions = machine.handle(CallEvent::EnvelopeReceived(envelope)).unwrap();

        prop_assert!(actions.is_empty());
        prop_assert_eq!(machine.state(), CallState::Idle);
        prop_assert!(machine.session().is_none());
    }

    #[test]
    fn garbage_candidate_from_peer_is_dropped(seed in any::<u64>(), payload in "[^{]{0,64}") {
        let mut machine = dialing_machine(seed);

        let envelope = Envelope {
            target: "alice".to_string(),
            sender: "bob".to_string(),
            payload,
            kind: EnvelopeKind::IceCandidate,
        };
        let actions = machine.handle(CallEvent::EnvelopeReceived(envelope)).unwrap();

        prop_assert!(actions.is_empty());
        prop_assert_eq!(machine.state(), CallState::Dialing);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Start,
    Accept,
    Reject,
    HangUp,
    FromPeer { kind: EnvelopeKind, payload: String },
    FromStranger { kind: EnvelopeKind },
    LocalOffer { stale: bool },
    LocalAnswer { stale: bool },
    RemoteApplied { stale: bool },
    LocalCandidate { stale: bool },
    Transport { state: TransportState, stale: bool },
    SendFailed { stale: bool },
}

fn transport_state() -> impl Strategy<Value = TransportState> {
    prop_oneof![
        Just(TransportState::Checking),
        Just(TransportState::Connected),
        Just(TransportState::Disconnected),
        Just(TransportState::Failed),
        Just(TransportState::Closed),
    ]
}

fn peer_payload() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("v=0 remote".to_string()),
        Just(r#"{"sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:1"}"#.to_string()),
        Just("busy:1".to_string()),
        Just("rejected:2".to_string()),
        ".{0,16}",
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Start),
        Just(Op::Accept),
        Just(Op::Reject),
        Just(Op::HangUp),
        (kind(), peer_payload()).prop_map(|(kind, payload)| Op::FromPeer { kind, payload }),
        kind().prop_map(|kind| Op::FromStranger { kind }),
        any::<bool>().prop_map(|stale| Op::LocalOffer { stale }),
        any::<bool>().prop_map(|stale| Op::LocalAnswer { stale }),
        any::<bool>().prop_map(|stale| Op::RemoteApplied { stale }),
        any::<bool>().prop_map(|stale| Op::LocalCandidate { stale }),
        (transport_state(), any::<bool>()).prop_map(|(state, stale)| Op::Transport { state, stale }),
        any::<bool>().prop_map(|stale| Op::SendFailed { stale }),
    ]
}

fn is_stale(op: &Op) -> bool {
    matches!(
        op,
        Op::LocalOffer { stale: true }
            | Op::LocalAnswer { stale: true }
            | Op::RemoteApplied { stale: true }
            | Op::LocalCandidate { stale: true }
            | Op::Transport { stale: true, .. }
            | Op::SendFailed { stale: true }
    )
}

fn event(op: Op, target: SessionId) -> CallEvent {
    match op {
        Op::Start => CallEvent::StartCall { peer: "bob".to_string() },
        Op::Accept => CallEvent::AcceptCall,
        Op::Reject => CallEvent::RejectCall,
        Op::HangUp => CallEvent::HangUp,
        Op::FromPeer { kind, payload } => CallEvent::EnvelopeReceived(Envelope {
            target: "alice".to_string(),
            sender: "bob".to_string(),
            payload,
            kind,
        }),
        Op::FromStranger { kind } => CallEvent::EnvelopeReceived(Envelope {
            target: "alice".to_string(),
            sender: "mallory".to_string(),
            payload: "v=0".to_string(),
            kind,
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
        Op::LocalCandidate { .. } => CallEvent::LocalCandidate {
            session: target,
            candidate: IceCandidate {
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: 0,
                sdp: "candidate:0".to_string(),
            },
        },
        Op::Transport { state, .. } => CallEvent::TransportStateChanged { session: target, state },
        Op::SendFailed { .. } => CallEvent::SendFailed {
            session: target,
            kind: ErrorKind::TargetUnreachable,
            detail: "bob went away".to_string(),
        },
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

fn envelopes(actions: &[CallAction]) -> impl Iterator<Item = &Envelope> {
    actions.iter().filter_map(|action| match action {
        CallAction::Send { envelope, .. } | CallAction::SendBestEffort { envelope } => Some(envelope),
        _ => None,
    })
}

proptest! {
    #[test]
    fn op_sequences_keep_session_invariants(seed in any::<u64>(), ops in vec(op(), 0..64)) {
        let mut machine = CallMachine::new(SimEnv::with_seed(seed), "alice");
        let mut last_end: HashMap<String, String> = HashMap::new();

        for op in ops {
            let current = machine.session().map(|s| s.id());
            let target = if is_stale(&op) {
                SessionId::new(!current.map_or(0, SessionId::as_u64))
            } else {
                current.unwrap_or(SessionId::new(0))
            };
            let before = machine.state();
            let stranger = matches!(op, Op::FromStranger { .. });
            let out_of_turn = match &op {
                Op::FromPeer { kind: EnvelopeKind::Answer, .. } => before != CallState::OfferSent,
                Op::FromPeer { kind: EnvelopeKind::Offer, .. } => !before.is_terminal() && current.is_some(),
                Op::FromPeer { kind: EnvelopeKind::IceCandidate, .. } => true,
                _ => false,
            };
            let stale = is_stale(&op);

            let Ok(actions) = machine.handle(event(op, target)) else {
                prop_assert_eq!(machine.state(), before, "rejected intent changed state");
                continue;
            };
            let after = machine.session().map(|s| s.id());

            if after == current && before.is_terminal() {
                prop_assert_eq!(machine.state(), before, "terminal state left");
            }
            if stranger && current.is_some() && !before.is_terminal() {
                prop_assert_eq!(machine.state(), before, "stranger changed state");
            }
            if out_of_turn {
                prop_assert_eq!(machine.state(), before, "out-of-turn envelope changed state");
                prop_assert_eq!(after, current);
            }
            if stale {
                prop_assert_eq!(machine.state(), before, "stale completion changed state");
                prop_assert!(actions.is_empty());
            }
            if before == CallState::Idle && after.is_none() {
                prop_assert!(actions.is_empty());
            }

            for action in &actions {
                if let Some(session) = action_session(action) {
                    prop_assert_eq!(Some(session), after, "action for another session: {:?}", action);
                }
            }

            for envelope in envelopes(&actions) {
                match envelope.kind {
                    // A candidate never goes out ahead of the peer reading our description
                    EnvelopeKind::IceCandidate => {
                        prop_assert!(machine.session().is_some_and(|s| s.candidates_released()));
                    },
                    // Back-to-back ends to one mailbox must not coalesce
                    EnvelopeKind::EndCall => {
                        let previous =
                            last_end.insert(envelope.target.clone(), envelope.payload.clone());
                        prop_assert_ne!(previous.as_deref(), Some(envelope.payload.as_str()));
                    },
                    EnvelopeKind::Offer | EnvelopeKind::Answer => {},
                }
            }
        }
    }
}
