//! Property-based tests for envelope encoding/decoding
//!
//! Round-trips every well-formed envelope through the wire codec and checks
//! that decoding never panics on arbitrary relay values.

use callframe_proto::{Envelope, EnvelopeKind, IceCandidate, ProtocolError, decode, encode};
use proptest::prelude::*;

fn arbitrary_kind() -> impl Strategy<Value = EnvelopeKind> {
    prop_oneof![
        Just(EnvelopeKind::Offer),
        Just(EnvelopeKind::Answer),
        Just(EnvelopeKind::IceCandidate),
        Just(EnvelopeKind::EndCall),
    ]
}

/// Well-formed envelopes: non-empty target distinct from sender.
fn arbitrary_envelope() -> impl Strategy<Value = Envelope> {
    ("[a-z0-9_]{1,16}", "[a-z0-9_]{0,16}", any::<String>(), arbitrary_kind())
        .prop_filter("target must differ from sender", |(target, sender, _, _)| target != sender)
        .prop_map(|(target, sender, payload, kind)| Envelope { target, sender, payload, kind })
}

proptest! {
    #[test]
    fn envelope_round_trip(envelope in arbitrary_envelope()) {
        let wire = encode(&envelope).unwrap();
        let decoded = decode(Some(wire.as_str())).unwrap();

        prop_assert_eq!(decoded, Some(envelope));
    }

    #[test]
    fn decode_never_panics(wire in any::<String>()) {
        // Result is irrelevant, only that decoding is total
        let _ = decode(Some(wire.as_str()));
    }

    #[test]
    fn self_addressed_never_encodes(address in "[a-z]{1,8}", kind in arbitrary_kind()) {
        let envelope = Envelope {
            target: address.clone(),
            sender: address,
            payload: String::new(),
            kind,
        };

        let is_self_addressed = matches!(encode(&envelope), Err(ProtocolError::SelfAddressed { .. }));
        prop_assert!(is_self_addressed);
    }

    #[test]
    fn candidate_round_trip(
        sdp_mid in proptest::option::of("[0-9a-z]{1,4}"),
        sdp_mline_index in any::<u16>(),
        sdp in ".{1,64}",
    ) {
        let candidate = IceCandidate { sdp_mid, sdp_mline_index, sdp };
        let payload = candidate.to_payload().unwrap();

        prop_assert_eq!(IceCandidate::from_payload(&payload).unwrap(), candidate);
    }
}

#[test]
fn offer_wire_format() {
    let envelope = Envelope::new("bob", "alice", EnvelopeKind::Offer, "v=0").unwrap();

    insta::assert_snapshot!(
        encode(&envelope).unwrap(),
        @r#"{"target":"bob","sender":"alice","data":"v=0","type":"OFFER"}"#
    );
}

#[test]
fn candidate_envelope_wire_format() {
    let candidate = IceCandidate {
        sdp_mid: Some("audio".to_string()),
        sdp_mline_index: 0,
        sdp: "candidate:0".to_string(),
    };
    let envelope =
        Envelope::new("alice", "bob", EnvelopeKind::IceCandidate, candidate.to_payload().unwrap())
            .unwrap();

    insta::assert_snapshot!(
        encode(&envelope).unwrap(),
        @r#"{"target":"alice","sender":"bob","data":"{\"sdpMid\":\"audio\",\"sdpMLineIndex\":0,\"sdp\":\"candidate:0\"}","type":"ICE"}"#
    );
}

#[test]
fn end_call_decodes_from_foreign_client() {
    let wire = r#"{"type":"END","target":"alice","sender":"bob","data":"busy"}"#;
    let envelope = decode(Some(wire)).unwrap().unwrap();

    assert_eq!(envelope.kind, EnvelopeKind::EndCall);
    assert_eq!(envelope.sender, "bob");
    assert_eq!(envelope.payload, "busy");
}
