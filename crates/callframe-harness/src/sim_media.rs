//! Simulated media engine.
//!
//! Fake capture devices and negotiation objects. Every acquire and release is
//! appended to a shared [`ResourceLog`] so tests can check teardown order and
//! catch double releases.
//!
//! A [`SimTransport`] connects as soon as both its local and remote
//! descriptions are installed: it reports `Checking`, `Connected`, then the
//! remote stream. Remote descriptions must look like SDP (start with `v=0`).
//! Once closed, every negotiation call fails, including one held on the gate.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use callframe_core::{
    CaptureConstraints, MediaEngine, MediaError, PeerTransport, RemoteStream, TrackKind,
    TransportConfig, TransportObserver, TransportState,
    media::{LocalStream, MediaSource, MediaTrack, OfferConstraints, VideoCapturer},
};
use callframe_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One acquire or release of a simulated resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Camera started in this format
    CaptureStarted(CaptureConstraints),
    /// Track detached from the local stream
    TrackRemoved(String),
    /// Track disabled
    TrackDisabled(String),
    /// Track released
    TrackReleased(String),
    /// Camera stopped
    CaptureStopped,
    /// Camera switched between front and back
    CameraSwitched,
    /// Capturer released
    CapturerReleased,
    /// Local stream released
    StreamReleased(String),
    /// Negotiation object closed
    TransportClosed,
    /// Negotiation object released
    TransportReleased,
    /// Processing source released
    SourceReleased(TrackKind),
}

/// Shared, append-only log of resource events.
#[derive(Debug, Clone, Default)]
pub struct ResourceLog(Arc<Mutex<Vec<ResourceEvent>>>);

impl ResourceLog {
    /// Append an event.
    pub fn push(&self, event: ResourceEvent) {
        lock(&self.0).push(event);
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<ResourceEvent> {
        lock(&self.0).clone()
    }

    /// Number of times `event` was logged.
    pub fn count(&self, event: &ResourceEvent) -> usize {
        lock(&self.0).iter().filter(|e| *e == event).count()
    }

    /// Every event except capture starts and camera switches.
    pub fn releases(&self) -> Vec<ResourceEvent> {
        lock(&self.0)
            .iter()
            .filter(|e| {
                !matches!(e, ResourceEvent::CaptureStarted(_) | ResourceEvent::CameraSwitched)
            })
            .cloned()
            .collect()
    }
}

/// Behavior knobs for a [`SimMediaEngine`].
#[derive(Debug, Clone)]
pub struct SimMediaOptions {
    /// Whether a camera exists
    pub has_camera: bool,
    /// `create_offer` / `create_answer` fail
    pub fail_negotiation: bool,
    /// `set_remote_description` fails
    pub fail_remote_description: bool,
    /// Candidates gathered after each local description
    pub local_candidates: u16,
    /// When set, `create_offer` / `create_answer` wait for a permit or for
    /// the transport to close
    pub hold_negotiation: Option<Arc<Notify>>,
    /// `add_track` fails once this many tracks are attached
    pub reject_track_after: Option<usize>,
}

impl Default for SimMediaOptions {
    fn default() -> Self {
        Self {
            has_camera: true,
            fail_negotiation: false,
            fail_remote_description: false,
            local_candidates: 0,
            hold_negotiation: None,
            reject_track_after: None,
        }
    }
}

#[derive(Default)]
struct TransportInner {
    observer: Option<TransportObserver>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    tracks: Vec<(String, String)>,
    connected: bool,
    closed: bool,
}

/// Test-side view of a simulated negotiation object.
#[derive(Clone)]
pub struct SimTransportHandle {
    label: String,
    inner: Arc<Mutex<TransportInner>>,
}

impl SimTransportHandle {
    /// Label (`transport-N`) used in generated SDP and candidates.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).applied_candidates.clone()
    }

    /// `(track id, stream id)` pairs attached for sending.
    pub fn tracks(&self) -> Vec<(String, String)> {
        lock(&self.inner).tracks.clone()
    }

    /// Installed local description.
    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    /// Installed remote description.
    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Report a connection state as if the network changed. Ignored once
    /// closed.
    pub fn inject_state(&self, state: TransportState) {
        let observer = lock(&self.inner).observer.clone();
        if let Some(observer) = observer {
            observer.on_state_change(state);
        }
    }
}

/// Simulated negotiation object.
pub struct SimTransport {
    handle: SimTransportHandle,
    options: SimMediaOptions,
    log: ResourceLog,
    closing: Notify,
}

impl SimTransport {
    /// Wait on the negotiation gate, if any. Fails once closed.
    async fn hold(&self) -> Result<(), MediaError> {
        if let Some(gate) = &self.options.hold_negotiation {
            tokio::select! {
                () = gate.notified() => {},
                () = self.closing.notified() => {},
            }
        }
        self.check_open()
    }

    fn check_open(&self) -> Result<(), MediaError> {
        if lock(&self.handle.inner).closed {
            return Err(MediaError::Negotiation { detail: "transport closed".to_string() });
        }
        Ok(())
    }

    fn sdp(&self, kind: SdpKind) -> String {
        let role = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        let label = &self.handle.label;
        format!(
            "v=0\r\no=- {label} 1 IN IP4 127.0.0.1\r\ns={role}\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"
        )
    }

    /// Connect once both descriptions are installed.
    fn maybe_connect(&self) {
        let observer = {
            let mut inner = lock(&self.handle.inner);
            if inner.connected || inner.local.is_none() || inner.remote.is_none() {
                return;
            }
            inner.connected = true;
            inner.observer.clone()
        };

        if let Some(observer) = observer {
            observer.on_state_change(TransportState::Checking);
            observer.on_state_change(TransportState::Connected);
            observer.on_remote_stream(RemoteStream {
                id: "remote_stream".to_string(),
                audio_tracks: 1,
                video_tracks: 1,
            });
        }
    }

    fn gather_candidates(&self) {
        let Some(observer) = lock(&self.handle.inner).observer.clone() else {
            return;
        };

        for index in 0..self.options.local_candidates {
            observer.on_candidate(IceCandidate {
                sdp_mid: Some(index.to_string()),
                sdp_mline_index: index,
                sdp: format!(
                    "candidate:{index} 1 udp 2122260223 10.0.0.{index} 5000{index} typ host ({})",
                    self.handle.label
                ),
            });
        }
    }
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn create_offer(
        &self,
        _constraints: &OfferConstraints,
    ) -> Result<SessionDescription, MediaError> {
        self.hold().await?;
        if self.options.fail_negotiation {
            return Err(MediaError::Negotiation { detail: "offer refused".to_string() });
        }
        Ok(SessionDescription::offer(self.sdp(SdpKind::Offer)))
    }

    async fn create_answer(
        &self,
        _constraints: &OfferConstraints,
    ) -> Result<SessionDescription, MediaError> {
        self.hold().await?;
        if self.options.fail_negotiation {
            return Err(MediaError::Negotiation { detail: "answer refused".to_string() });
        }
        let has_offer =
            lock(&self.handle.inner).remote.as_ref().is_some_and(|d| d.kind == SdpKind::Offer);
        if !has_offer {
            return Err(MediaError::Negotiation { detail: "no remote offer".to_string() });
        }
        Ok(SessionDescription::answer(self.sdp(SdpKind::Answer)))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.check_open()?;
        lock(&self.handle.inner).local = Some(description.clone());
        self.gather_candidates();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.check_open()?;
        if self.options.fail_remote_description || !description.sdp.starts_with("v=0") {
            return Err(MediaError::Negotiation {
                detail: "remote description rejected".to_string(),
            });
        }
        lock(&self.handle.inner).remote = Some(description.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut inner = lock(&self.handle.inner);
        if inner.remote.is_none() {
            return Err(MediaError::Negotiation { detail: "remote description not set".to_string() });
        }
        inner.applied_candidates.push(candidate.clone());
        Ok(())
    }

    fn add_track(&self, track: &dyn MediaTrack, stream_id: &str) -> Result<(), MediaError> {
        let mut inner = lock(&self.handle.inner);
        if self.options.reject_track_after.is_some_and(|limit| inner.tracks.len() >= limit) {
            return Err(MediaError::Negotiation { detail: format!("track {} refused", track.id()) });
        }
        inner.tracks.push((track.id().to_string(), stream_id.to_string()));
        Ok(())
    }

    fn close(&self) {
        {
            let mut inner = lock(&self.handle.inner);
            inner.closed = true;
            inner.observer = None;
        }
        // Stored as a permit if nothing is waiting yet
        self.closing.notify_one();
        self.log.push(ResourceEvent::TransportClosed);
    }

    fn release(&self) {
        self.log.push(ResourceEvent::TransportReleased);
    }
}

struct SimSource {
    kind: TrackKind,
    log: ResourceLog,
}

impl MediaSource for SimSource {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn release(self: Box<Self>) {
        self.log.push(ResourceEvent::SourceReleased(self.kind));
    }
}

struct SimTrack {
    id: String,
    kind: TrackKind,
    enabled: bool,
    log: ResourceLog,
}

impl MediaTrack for SimTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.log.push(ResourceEvent::TrackDisabled(self.id.clone()));
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn release(self: Box<Self>) {
        let Self { id, log, .. } = *self;
        log.push(ResourceEvent::TrackReleased(id));
    }
}

struct SimCapturer {
    log: ResourceLog,
}

impl VideoCapturer for SimCapturer {
    fn start_capture(&mut self, constraints: &CaptureConstraints) -> Result<(), MediaError> {
        self.log.push(ResourceEvent::CaptureStarted(*constraints));
        Ok(())
    }

    fn stop_capture(&mut self) {
        self.log.push(ResourceEvent::CaptureStopped);
    }

    fn switch_camera(&mut self) -> Result<(), MediaError> {
        self.log.push(ResourceEvent::CameraSwitched);
        Ok(())
    }

    fn release(self: Box<Self>) {
        self.log.push(ResourceEvent::CapturerReleased);
    }
}

struct SimStream {
    id: String,
    tracks: Vec<String>,
    log: ResourceLog,
}

impl LocalStream for SimStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn add_track(&mut self, track: &dyn MediaTrack) {
        self.tracks.push(track.id().to_string());
    }

    fn remove_track(&mut self, track_id: &str) {
        if let Some(position) = self.tracks.iter().position(|t| t == track_id) {
            self.tracks.remove(position);
            self.log.push(ResourceEvent::TrackRemoved(track_id.to_string()));
        }
    }

    fn release(self: Box<Self>) {
        let Self { id, log, .. } = *self;
        log.push(ResourceEvent::StreamReleased(id));
    }
}

/// Simulated media engine.
pub struct SimMediaEngine {
    options: SimMediaOptions,
    log: ResourceLog,
    transports: Mutex<Vec<SimTransportHandle>>,
    next_transport: AtomicU64,
}

impl SimMediaEngine {
    /// Engine with the given behavior.
    pub fn new(options: SimMediaOptions) -> Self {
        Self {
            options,
            log: ResourceLog::default(),
            transports: Mutex::new(Vec::new()),
            next_transport: AtomicU64::new(0),
        }
    }

    /// Resource log shared by everything this engine created.
    pub fn log(&self) -> &ResourceLog {
        &self.log
    }

    /// Every negotiation object created so far, oldest first.
    pub fn transports(&self) -> Vec<SimTransportHandle> {
        lock(&self.transports).clone()
    }

    /// Most recently created negotiation object.
    pub fn last_transport(&self) -> Option<SimTransportHandle> {
        lock(&self.transports).last().cloned()
    }
}

impl Default for SimMediaEngine {
    fn default() -> Self {
        Self::new(SimMediaOptions::default())
    }
}

impl MediaEngine for SimMediaEngine {
    fn front_facing_capturer(&self) -> Option<Box<dyn VideoCapturer>> {
        self.options
            .has_camera
            .then(|| Box::new(SimCapturer { log: self.log.clone() }) as Box<dyn VideoCapturer>)
    }

    fn create_video_source(&self) -> Result<Box<dyn MediaSource>, MediaError> {
        Ok(Box::new(SimSource { kind: TrackKind::Video, log: self.log.clone() }))
    }

    fn create_audio_source(&self) -> Result<Box<dyn MediaSource>, MediaError> {
        Ok(Box::new(SimSource { kind: TrackKind::Audio, log: self.log.clone() }))
    }

    fn create_track(
        &self,
        id: &str,
        source: &dyn MediaSource,
    ) -> Result<Box<dyn MediaTrack>, MediaError> {
        Ok(Box::new(SimTrack {
            id: id.to_string(),
            kind: source.kind(),
            enabled: true,
            log: self.log.clone(),
        }))
    }

    fn create_local_stream(&self, id: &str) -> Result<Box<dyn LocalStream>, MediaError> {
        Ok(Box::new(SimStream { id: id.to_string(), tracks: Vec::new(), log: self.log.clone() }))
    }

    fn create_transport(
        &self,
        _config: &TransportConfig,
        observer: TransportObserver,
    ) -> Result<Box<dyn PeerTransport>, MediaError> {
        let n = self.next_transport.fetch_add(1, Ordering::Relaxed);
        let handle = SimTransportHandle {
            label: format!("transport-{n}"),
            inner: Arc::new(Mutex::new(TransportInner {
                observer: Some(observer),
                ..TransportInner::default()
            })),
        };
        lock(&self.transports).push(handle.clone());

        Ok(Box::new(SimTransport {
            handle,
            options: self.options.clone(),
            log: self.log.clone(),
            closing: Notify::new(),
        }))
    }
}
