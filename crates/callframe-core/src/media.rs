//! Media and transport boundary.
//!
//! The core never talks to a capture device or a peer-connection stack
//! directly. It drives them through the traits in this module, which a
//! platform backend implements (and which the simulation harness fakes).
//!
//! Resources are released by consuming them (`release(self: Box<Self>)`), so a
//! released handle cannot be used again.

use std::sync::Arc;

use async_trait::async_trait;
use callframe_proto::{IceCandidate, SessionDescription};
use tokio::sync::{mpsc, watch};

use crate::error::MediaError;

/// Public STUN servers used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVERS: [&str; 2] =
    ["stun:stun1.l.google.com:19302", "stun:stun2.l.google.com:19302"];

/// Media kind of a track or source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Health of the peer-to-peer media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Created, connectivity checks not started
    New,
    /// Connectivity checks in progress
    Checking,
    /// Media path established
    Connected,
    /// Path temporarily lost; may recover on its own
    Disconnected,
    /// Path lost for good
    Failed,
    /// Transport closed
    Closed,
}

impl TransportState {
    /// Whether this state ends the call.
    ///
    /// `Disconnected` is transient and does not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// One STUN or TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    pub username: Option<String>,
    /// TURN credential
    pub credential: Option<String>,
}

impl IceServer {
    /// Credential-less STUN server.
    pub fn stun(url: impl Into<String>) -> Self {
        Self { urls: vec![url.into()], username: None, credential: None }
    }

    /// TURN server with credentials.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Negotiation object configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// ICE servers used for candidate gathering
    pub ice_servers: Vec<IceServer>,
    /// Keep gathering candidates after the initial set
    pub gather_continually: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.into_iter().map(IceServer::stun).collect(),
            gather_continually: true,
        }
    }
}

/// Capture format requested from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self { width: 480, height: 360, fps: 15 }
    }
}

/// What the local side asks to receive when producing an offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferConstraints {
    /// Request remote audio
    pub receive_audio: bool,
    /// Request remote video
    pub receive_video: bool,
}

impl Default for OfferConstraints {
    fn default() -> Self {
        Self { receive_audio: true, receive_video: true }
    }
}

/// Remote media announced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identifier chosen by the remote peer
    pub id: String,
    /// Number of remote audio tracks
    pub audio_tracks: usize,
    /// Number of remote video tracks
    pub video_tracks: usize,
}

/// Raw capture source feeding a track.
pub trait MediaSource: Send + Sync {
    /// Media kind produced by this source.
    fn kind(&self) -> TrackKind;

    /// Release the source.
    fn release(self: Box<Self>);
}

/// Local audio or video track.
pub trait MediaTrack: Send + Sync {
    /// Track identifier.
    fn id(&self) -> &str;

    /// Media kind.
    fn kind(&self) -> TrackKind;

    /// Mute or unmute the track.
    fn set_enabled(&mut self, enabled: bool);

    /// Whether the track is currently sending.
    fn is_enabled(&self) -> bool;

    /// Release the track.
    fn release(self: Box<Self>);
}

/// Camera capturer.
pub trait VideoCapturer: Send + Sync {
    /// Begin capturing frames in the given format.
    fn start_capture(&mut self, constraints: &CaptureConstraints) -> Result<(), MediaError>;

    /// Stop capturing frames.
    fn stop_capture(&mut self);

    /// Swap between front and back camera.
    fn switch_camera(&mut self) -> Result<(), MediaError>;

    /// Release the capturer.
    fn release(self: Box<Self>);
}

/// Local stream grouping the outbound tracks.
pub trait LocalStream: Send + Sync {
    /// Stream identifier.
    fn id(&self) -> &str;

    /// Attach a track.
    fn add_track(&mut self, track: &dyn MediaTrack);

    /// Detach a track by id.
    fn remove_track(&mut self, track_id: &str);

    /// Release the stream.
    fn release(self: Box<Self>);
}

/// Negotiation object: one peer-to-peer media connection.
///
/// Candidates, state changes and remote media are reported through the
/// [`TransportObserver`] handed to [`MediaEngine::create_transport`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce an offer.
    async fn create_offer(
        &self,
        constraints: &OfferConstraints,
    ) -> Result<SessionDescription, MediaError>;

    /// Produce an answer to the applied remote offer.
    async fn create_answer(
        &self,
        constraints: &OfferConstraints,
    ) -> Result<SessionDescription, MediaError>;

    /// Install a locally produced description.
    async fn set_local_description(&self, description: &SessionDescription)
    -> Result<(), MediaError>;

    /// Install the remote peer's description.
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    /// Add a remote path candidate.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Send a local track under the given stream id.
    fn add_track(&self, track: &dyn MediaTrack, stream_id: &str) -> Result<(), MediaError>;

    /// Close the connection. No callbacks fire afterwards.
    fn close(&self);

    /// Release the negotiation object. Called once, after `close`.
    ///
    /// Handles still held elsewhere stay valid, but operations on them fail.
    fn release(&self);
}

/// Factory for platform media resources.
pub trait MediaEngine: Send + Sync {
    /// Front-facing camera, falling back to any camera. `None` when the device
    /// has no camera.
    fn front_facing_capturer(&self) -> Option<Box<dyn VideoCapturer>>;

    /// Video processing source.
    fn create_video_source(&self) -> Result<Box<dyn MediaSource>, MediaError>;

    /// Audio processing source.
    fn create_audio_source(&self) -> Result<Box<dyn MediaSource>, MediaError>;

    /// Track fed by `source`.
    fn create_track(
        &self,
        id: &str,
        source: &dyn MediaSource,
    ) -> Result<Box<dyn MediaTrack>, MediaError>;

    /// Empty local stream.
    fn create_local_stream(&self, id: &str) -> Result<Box<dyn LocalStream>, MediaError>;

    /// Negotiation object reporting through `observer`.
    fn create_transport(
        &self,
        config: &TransportConfig,
        observer: TransportObserver,
    ) -> Result<Box<dyn PeerTransport>, MediaError>;
}

/// Asynchronous transport callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Locally discovered path candidate to forward to the peer
    LocalCandidate(IceCandidate),
    /// Media path health changed
    StateChanged(TransportState),
    /// Remote peer's media arrived
    RemoteMedia(RemoteStream),
}

/// Callback sink handed to a [`PeerTransport`].
///
/// Events go to the controller's owner over an unbounded channel; the latest
/// connection state is also published on a watch channel so it can be polled.
/// Sends after the receiving side is gone are dropped silently.
#[derive(Debug, Clone)]
pub struct TransportObserver {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<watch::Sender<TransportState>>,
}

impl TransportObserver {
    /// Observer plus its event receiver and state receiver.
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<TransportEvent>,
        watch::Receiver<TransportState>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(TransportState::New);
        (Self { events, state: Arc::new(state) }, events_rx, state_rx)
    }

    /// Report a locally gathered candidate.
    pub fn on_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
    }

    /// Report a connection state change.
    pub fn on_state_change(&self, state: TransportState) {
        self.state.send_replace(state);
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    /// Report remote media.
    pub fn on_remote_stream(&self, stream: RemoteStream) {
        let _ = self.events.send(TransportEvent::RemoteMedia(stream));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_config_uses_public_stun() {
        let config = TransportConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers.iter().all(|s| s.username.is_none()));
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun1.l.google.com:19302"]);
    }

    #[test]
    fn default_capture_constraints() {
        assert_eq!(CaptureConstraints::default(), CaptureConstraints {
            width: 480,
            height: 360,
            fps: 15
        });
    }

    #[test]
    fn only_failed_and_closed_are_terminal() {
        assert!(TransportState::Failed.is_terminal());
        assert!(TransportState::Closed.is_terminal());
        assert!(!TransportState::Disconnected.is_terminal());
        assert!(!TransportState::Connected.is_terminal());
    }

    #[test]
    fn observer_publishes_state_on_both_channels() {
        let (observer, mut events, state) = TransportObserver::channel();

        observer.on_state_change(TransportState::Checking);

        assert_eq!(*state.borrow(), TransportState::Checking);
        assert_eq!(events.try_recv().unwrap(), TransportEvent::StateChanged(TransportState::Checking));
    }

    #[test]
    fn observer_survives_dropped_receiver() {
        let (observer, events, _state) = TransportObserver::channel();
        drop(events);

        observer.on_candidate(IceCandidate {
            sdp_mid: None,
            sdp_mline_index: 0,
            sdp: "candidate:0".to_string(),
        });
    }
}
