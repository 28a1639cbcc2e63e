//! Connection controller.
//!
//! Owns the media side of one call session: the negotiation object
//! ([`PeerTransport`]) and the local capture resources ([`MediaBundle`]).
//! Remote candidates that arrive before the remote description is applied are
//! buffered and flushed, in arrival order, right after it is.
//!
//! # Teardown
//!
//! [`ConnectionController::teardown`] releases everything in a fixed order:
//!
//! 1. remove tracks from the local stream
//! 2. disable then release the video track, then the audio track
//! 3. stop then release the capturer
//! 4. release the local stream
//! 5. close then release the negotiation object
//! 6. release the video source, then the audio source
//!
//! It is idempotent and also runs on drop, so every exit path releases.
//!
//! # Sharing the negotiation object
//!
//! [`ConnectionController::transport`] hands out a shared handle so a caller
//! can await transport operations without holding the controller. Teardown
//! closes the transport under such a handle; operations still in flight on it
//! then fail instead of completing.

use std::{collections::VecDeque, mem, sync::Arc};

use callframe_proto::{IceCandidate, SessionDescription};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    error::MediaError,
    media::{
        CaptureConstraints, LocalStream, MediaEngine, MediaSource, MediaTrack, OfferConstraints,
        PeerTransport, TrackKind, TransportConfig, TransportEvent, TransportObserver,
        TransportState, VideoCapturer,
    },
};

/// Stream id used for outbound media.
pub const DEFAULT_STREAM_ID: &str = "local_stream";

/// Prefix of outbound track ids (`<prefix>_video`, `<prefix>_audio`).
pub const DEFAULT_TRACK_ID: &str = "local_track";

/// Media settings for one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    /// Negotiation object configuration
    pub transport: TransportConfig,
    /// Camera format
    pub capture: CaptureConstraints,
    /// Outbound stream id
    pub stream_id: String,
    /// Outbound track id prefix
    pub track_id: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            capture: CaptureConstraints::default(),
            stream_id: DEFAULT_STREAM_ID.to_string(),
            track_id: DEFAULT_TRACK_ID.to_string(),
        }
    }
}

/// Local capture resources of one session.
///
/// Fields fill in as [`ConnectionController::create_local_media`] progresses,
/// so a partially built bundle is still released correctly.
#[derive(Default)]
pub struct MediaBundle {
    video_track: Option<Box<dyn MediaTrack>>,
    audio_track: Option<Box<dyn MediaTrack>>,
    capturer: Option<Box<dyn VideoCapturer>>,
    stream: Option<Box<dyn LocalStream>>,
    video_source: Option<Box<dyn MediaSource>>,
    audio_source: Option<Box<dyn MediaSource>>,
}

impl MediaBundle {
    /// Outbound video track.
    pub fn video_track(&self) -> Option<&dyn MediaTrack> {
        self.video_track.as_deref()
    }

    /// Outbound audio track.
    pub fn audio_track(&self) -> Option<&dyn MediaTrack> {
        self.audio_track.as_deref()
    }

    /// Local stream id, once the stream exists.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream.as_deref().map(LocalStream::id)
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let tracks = [self.video_track.as_deref(), self.audio_track.as_deref()];
            for track in tracks.into_iter().flatten() {
                stream.remove_track(track.id());
            }
        }

        for mut track in [self.video_track.take(), self.audio_track.take()].into_iter().flatten() {
            track.set_enabled(false);
            track.release();
        }

        if let Some(mut capturer) = self.capturer.take() {
            capturer.stop_capture();
            capturer.release();
        }

        if let Some(stream) = self.stream.take() {
            stream.release();
        }
    }

    fn release_sources(&mut self) {
        for source in [self.video_source.take(), self.audio_source.take()].into_iter().flatten() {
            source.release();
        }
    }
}

/// Media side of one call session.
pub struct ConnectionController {
    engine: Arc<dyn MediaEngine>,
    config: MediaConfig,
    transport: Option<Arc<dyn PeerTransport>>,
    media: Option<MediaBundle>,
    remote_description_applied: bool,
    pending_candidates: VecDeque<IceCandidate>,
    state: watch::Receiver<TransportState>,
    torn_down: bool,
}

impl ConnectionController {
    /// Create the negotiation object.
    ///
    /// Returns the controller and the receiver of its transport callbacks.
    ///
    /// # Errors
    ///
    /// - whatever the engine reports when creating the transport
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        config: MediaConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), MediaError> {
        let (observer, events, state) = TransportObserver::channel();
        let transport = engine.create_transport(&config.transport, observer)?;

        debug!(servers = config.transport.ice_servers.len(), "negotiation object created");

        let controller = Self {
            engine,
            config,
            transport: Some(Arc::from(transport)),
            media: None,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            state,
            torn_down: false,
        };
        Ok((controller, events))
    }

    /// Open the camera and microphone and attach them to the negotiation
    /// object. A second call is a no-op.
    ///
    /// A failure after the camera was found tears the whole controller down:
    /// the negotiation object may already reference a released track.
    ///
    /// # Errors
    ///
    /// - `MediaError::DeviceUnavailable` if there is no camera
    /// - `MediaError::NoTransport` after teardown
    /// - whatever the engine or transport reports while building media
    pub fn create_local_media(&mut self) -> Result<&MediaBundle, MediaError> {
        let Some(transport) = self.transport.as_deref() else {
            return Err(MediaError::NoTransport);
        };

        if self.media.is_none() {
            let capturer =
                self.engine.front_facing_capturer().ok_or(MediaError::DeviceUnavailable)?;
            let bundle = self
                .media
                .insert(MediaBundle { capturer: Some(capturer), ..MediaBundle::default() });

            if let Err(e) = build_local_media(&*self.engine, &self.config, transport, bundle) {
                warn!(error = %e, "local media setup failed");
                self.teardown();
                return Err(e);
            }

            info!(
                width = self.config.capture.width,
                height = self.config.capture.height,
                fps = self.config.capture.fps,
                "local media started"
            );
        }

        self.media.as_ref().ok_or(MediaError::NoLocalMedia)
    }

    /// Local capture resources, if acquired.
    pub fn media(&self) -> Option<&MediaBundle> {
        self.media.as_ref()
    }

    /// Shared handle on the negotiation object.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoTransport` after teardown
    pub fn transport(&self) -> Result<Arc<dyn PeerTransport>, MediaError> {
        self.transport.clone().ok_or(MediaError::NoTransport)
    }

    /// Produce an offer and install it as the local description.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoTransport` if the negotiation object is absent
    /// - `MediaError::Negotiation` if the transport rejects the operation
    pub async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        negotiate_offer(&*self.transport()?).await
    }

    /// Produce an answer and install it as the local description.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoTransport` if the negotiation object is absent
    /// - `MediaError::Negotiation` if the transport rejects the operation
    pub async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        negotiate_answer(&*self.transport()?).await
    }

    /// Apply the peer's description, then flush buffered candidates in
    /// arrival order. The buffer is emptied even when a candidate is refused.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoTransport` if the negotiation object is absent
    /// - `MediaError::Negotiation` if the description is malformed or
    ///   incompatible; buffered candidates stay buffered in that case
    pub async fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let transport = self.transport()?;

        transport.set_remote_description(description).await?;
        let pending = self.remote_description_installed();
        flush_candidates(&*transport, pending).await;
        Ok(())
    }

    /// Record that the peer's description is installed and take the buffered
    /// candidates, oldest first, for the caller to apply.
    pub fn remote_description_installed(&mut self) -> Vec<IceCandidate> {
        self.remote_description_applied = true;
        mem::take(&mut self.pending_candidates).into()
    }

    /// Apply a remote candidate, or buffer it until the remote description is
    /// applied.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoTransport` if the negotiation object is absent
    /// - `MediaError::Negotiation` if the transport refuses the candidate
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError> {
        match self.route_remote_candidate(&candidate)? {
            Some(transport) => transport.add_ice_candidate(&candidate).await,
            None => Ok(()),
        }
    }

    /// Buffer `candidate` if the remote description is not installed yet.
    /// Otherwise return the transport to apply it on.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoTransport` if the negotiation object is absent
    pub fn route_remote_candidate(
        &mut self,
        candidate: &IceCandidate,
    ) -> Result<Option<Arc<dyn PeerTransport>>, MediaError> {
        let transport = self.transport()?;

        if self.remote_description_applied {
            Ok(Some(transport))
        } else {
            self.pending_candidates.push_back(candidate.clone());
            Ok(None)
        }
    }

    /// Candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending_candidates.iter()
    }

    /// Watch the negotiation object's connection state.
    pub fn observe_connection_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    /// Mute or unmute the microphone.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoLocalMedia` if media was never acquired
    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        let track = self
            .media
            .as_mut()
            .and_then(|m| m.audio_track.as_deref_mut())
            .ok_or(MediaError::NoLocalMedia)?;
        track.set_enabled(enabled);
        debug!(enabled, "audio toggled");
        Ok(())
    }

    /// Pause or resume the camera track.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoLocalMedia` if media was never acquired
    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        let track = self
            .media
            .as_mut()
            .and_then(|m| m.video_track.as_deref_mut())
            .ok_or(MediaError::NoLocalMedia)?;
        track.set_enabled(enabled);
        debug!(enabled, "video toggled");
        Ok(())
    }

    /// Swap between front and back camera.
    ///
    /// # Errors
    ///
    /// - `MediaError::NoLocalMedia` if media was never acquired
    pub fn switch_camera(&mut self) -> Result<(), MediaError> {
        let capturer = self
            .media
            .as_mut()
            .and_then(|m| m.capturer.as_deref_mut())
            .ok_or(MediaError::NoLocalMedia)?;
        capturer.switch_camera()
    }

    /// Whether teardown has run.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Release every resource in the documented order. Idempotent.
    pub fn teardown(&mut self) {
        if mem::replace(&mut self.torn_down, true) {
            return;
        }

        let mut media = self.media.take().unwrap_or_default();
        media.release();

        if let Some(transport) = self.transport.take() {
            transport.close();
            transport.release();
        }

        media.release_sources();
        self.pending_candidates.clear();

        info!("connection torn down");
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Produce an offer on `transport` and install it as the local description.
///
/// # Errors
///
/// - `MediaError::Negotiation` if the transport rejects the operation
pub async fn negotiate_offer(
    transport: &dyn PeerTransport,
) -> Result<SessionDescription, MediaError> {
    let offer = transport.create_offer(&OfferConstraints::default()).await?;
    transport.set_local_description(&offer).await?;
    Ok(offer)
}

/// Produce an answer on `transport` and install it as the local description.
///
/// # Errors
///
/// - `MediaError::Negotiation` if the transport rejects the operation
pub async fn negotiate_answer(
    transport: &dyn PeerTransport,
) -> Result<SessionDescription, MediaError> {
    let answer = transport.create_answer(&OfferConstraints::default()).await?;
    transport.set_local_description(&answer).await?;
    Ok(answer)
}

/// Apply previously buffered candidates in order. Refusals are logged.
pub async fn flush_candidates(transport: &dyn PeerTransport, candidates: Vec<IceCandidate>) {
    debug!(count = candidates.len(), "flushing buffered candidates");
    for candidate in candidates {
        if let Err(e) = transport.add_ice_candidate(&candidate).await {
            warn!(error = %e, "buffered candidate refused");
        }
    }
}

/// Fill `bundle` with sources, tracks and stream, and attach the tracks to the
/// negotiation object. On error the partial bundle is left for teardown.
fn build_local_media(
    engine: &dyn MediaEngine,
    config: &MediaConfig,
    transport: &dyn PeerTransport,
    bundle: &mut MediaBundle,
) -> Result<(), MediaError> {
    let video_source = bundle.video_source.insert(engine.create_video_source()?);
    if let Some(capturer) = bundle.capturer.as_deref_mut() {
        capturer.start_capture(&config.capture)?;
    }
    let video_id = format!("{}_video", config.track_id);
    let video_track = bundle.video_track.insert(engine.create_track(&video_id, &**video_source)?);
    debug_assert_eq!(video_track.kind(), TrackKind::Video);

    let audio_source = bundle.audio_source.insert(engine.create_audio_source()?);
    let audio_id = format!("{}_audio", config.track_id);
    let audio_track = bundle.audio_track.insert(engine.create_track(&audio_id, &**audio_source)?);

    let stream = bundle.stream.insert(engine.create_local_stream(&config.stream_id)?);
    stream.add_track(&**video_track);
    stream.add_track(&**audio_track);

    transport.add_track(&**video_track, &config.stream_id)?;
    transport.add_track(&**audio_track, &config.stream_id)?;
    Ok(())
}
