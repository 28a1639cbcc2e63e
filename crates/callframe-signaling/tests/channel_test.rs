//! Signaling channel behavior over the in-memory relay.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use callframe_proto::{Envelope, EnvelopeKind, encode};
use callframe_signaling::{EnvelopeHandler, MemoryRelay, Relay, SignalingChannel, SignalingError};
use tokio::sync::mpsc;

struct Recorder(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl EnvelopeHandler for Recorder {
    async fn on_envelope(&self, envelope: Envelope) {
        let _ = self.0.send(envelope);
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

fn offer(target: &str, sender: &str, sdp: &str) -> Envelope {
    Envelope::new(target, sender, EnvelopeKind::Offer, sdp).unwrap()
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap()
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn send_to_unregistered_target_is_unreachable() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = SignalingChannel::new(Arc::clone(&relay), "alice");
    alice.announce_presence().await.unwrap();

    let result = alice.send(&offer("nobody", "alice", "v=0")).await;

    assert_eq!(result, Err(SignalingError::TargetUnreachable { target: "nobody".to_string() }));
    assert_eq!(relay.peek("nobody"), None);
}

#[tokio::test]
async fn send_rejects_invalid_envelope_before_relay() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = SignalingChannel::new(Arc::clone(&relay), "alice");
    let envelope = Envelope {
        target: String::new(),
        sender: "alice".to_string(),
        payload: String::new(),
        kind: EnvelopeKind::EndCall,
    };

    assert!(matches!(alice.send(&envelope).await, Err(SignalingError::Protocol(_))));
}

#[tokio::test]
async fn envelope_reaches_subscribed_peer() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = SignalingChannel::new(Arc::clone(&relay), "alice");
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");
    bob.announce_presence().await.unwrap();
    let (handler, mut rx) = recorder();
    bob.subscribe(handler).await.unwrap();

    alice.send(&offer("bob", "alice", "v=0")).await.unwrap();

    let received = recv(&mut rx).await;
    assert_eq!(received, offer("bob", "alice", "v=0"));
}

#[tokio::test]
async fn fresh_presence_has_nothing_to_deliver() {
    let relay = Arc::new(MemoryRelay::new());
    relay.publish("bob", encode(&offer("bob", "alice", "old")).unwrap()).await.unwrap();
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");
    bob.announce_presence().await.unwrap();
    let (handler, mut rx) = recorder();

    bob.subscribe(handler).await.unwrap();

    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn unread_envelope_is_overwritten_by_newer_one() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = SignalingChannel::new(Arc::clone(&relay), "alice");
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");
    bob.announce_presence().await.unwrap();

    // Both land before bob reads the mailbox; only the second survives
    alice.send(&offer("bob", "alice", "first")).await.unwrap();
    alice.send(&offer("bob", "alice", "second")).await.unwrap();

    let (handler, mut rx) = recorder();
    bob.subscribe(handler).await.unwrap();

    assert_eq!(recv(&mut rx).await.payload, "second");
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn undecodable_and_misaddressed_values_are_dropped() {
    let relay = Arc::new(MemoryRelay::new());
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");
    bob.announce_presence().await.unwrap();
    let (handler, mut rx) = recorder();
    bob.subscribe(handler).await.unwrap();

    relay.publish("bob", "{not json".to_string()).await.unwrap();
    tokio::task::yield_now().await;
    relay.publish("bob", encode(&offer("carol", "alice", "v=0")).unwrap()).await.unwrap();
    tokio::task::yield_now().await;
    relay.publish("bob", encode(&offer("bob", "alice", "v=0")).unwrap()).await.unwrap();

    let received = recv(&mut rx).await;
    assert_eq!(received.target, "bob");
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn second_subscription_is_refused() {
    let relay = Arc::new(MemoryRelay::new());
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");
    let (first, _rx1) = recorder();
    let (second, _rx2) = recorder();

    bob.subscribe(first).await.unwrap();

    assert_eq!(
        bob.subscribe(second).await,
        Err(SignalingError::AlreadySubscribed { address: "bob".to_string() })
    );
}

#[tokio::test]
async fn no_delivery_after_unsubscribe() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = SignalingChannel::new(Arc::clone(&relay), "alice");
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");
    bob.announce_presence().await.unwrap();
    let (handler, mut rx) = recorder();
    bob.subscribe(handler).await.unwrap();

    bob.unsubscribe().await;
    alice.send(&offer("bob", "alice", "v=0")).await.unwrap();

    assert_silent(&mut rx).await;

    // A new subscription is allowed and sees the waiting envelope
    let (handler, mut rx) = recorder();
    bob.subscribe(handler).await.unwrap();
    assert_eq!(recv(&mut rx).await.payload, "v=0");
}

#[tokio::test]
async fn announce_presence_is_repeatable() {
    let relay = Arc::new(MemoryRelay::new());
    let bob = SignalingChannel::new(Arc::clone(&relay), "bob");

    bob.announce_presence().await.unwrap();
    bob.announce_presence().await.unwrap();

    assert!(bob.is_reachable("bob").await.unwrap());
    bob.withdraw_presence().await.unwrap();
    assert!(!bob.is_reachable("bob").await.unwrap());
}
