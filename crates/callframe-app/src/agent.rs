//! Call agent runtime.
//!
//! Wires the sans-IO [`CallMachine`] to its I/O collaborators: the
//! [`SignalingChannel`] for envelopes and a [`ConnectionController`] per
//! session for media.
//!
//! # Concurrency
//!
//! Relay deliveries, local intents and transport callbacks arrive on
//! independent tasks. They all funnel into one dispatch loop:
//!
//! 1. the machine runs under a synchronous mutex that is never held across an
//!    await, so transitions are applied one at a time and immediately
//! 2. the returned actions execute outside that lock
//! 3. completions come back as events tagged with their session and go
//!    through the machine again
//!
//! The controller sits behind an async mutex that only guards bookkeeping.
//! Transport operations run on a shared handle taken out of the controller and
//! are awaited after the lock is released. A hang-up therefore changes the
//! call state and tears the media down at once, even while an offer or answer
//! is still being produced; the closed transport fails that operation and its
//! completion is discarded as stale.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use callframe_core::{
    CallAction, CallEvent, CallMachine, CallNotification, CallSession, CallState,
    ConnectionController, Environment, MediaEngine, MediaError, PeerTransport, Role, SessionError,
    SessionId, TransportEvent,
    controller::{flush_candidates, negotiate_answer, negotiate_offer},
};
use callframe_proto::{Envelope, EnvelopeKind};
use callframe_signaling::{EnvelopeHandler, Relay, SignalingChannel, SignalingError};
use tokio::{
    sync::{Mutex as AsyncMutex, broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::AgentConfig,
    error::{AgentError, signaling_error_kind},
    observer::NotificationHub,
};

/// Media side of the current session.
struct ActiveCall {
    session: SessionId,
    controller: ConnectionController,
    _pump: JoinHandle<()>,
}

struct Inner<E: Environment, R: Relay> {
    config: AgentConfig,
    machine: Mutex<CallMachine<E>>,
    call: AsyncMutex<Option<ActiveCall>>,
    channel: SignalingChannel<R>,
    engine: Arc<dyn MediaEngine>,
    notifications: NotificationHub,
}

/// One peer's call endpoint.
///
/// Cheap to clone; clones share the same session.
pub struct CallAgent<E: Environment, R: Relay> {
    inner: Arc<Inner<E, R>>,
}

impl<E: Environment, R: Relay> Clone for CallAgent<E, R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment, R: Relay> CallAgent<E, R> {
    /// Register with the relay and start listening for envelopes.
    ///
    /// # Errors
    ///
    /// - `AgentError::InvalidConfig` if the configuration is rejected
    /// - `AgentError::Signaling` if the relay refuses registration
    pub async fn connect(
        config: AgentConfig,
        relay: Arc<R>,
        engine: Arc<dyn MediaEngine>,
        env: E,
    ) -> Result<Self, AgentError> {
        config.validate()?;

        let channel = SignalingChannel::new(relay, config.local_address.clone());
        channel.announce_presence().await?;

        let inner = Arc::new(Inner {
            machine: Mutex::new(CallMachine::new(env, config.local_address.clone())),
            call: AsyncMutex::new(None),
            channel,
            engine,
            notifications: NotificationHub::new(config.notification_capacity),
            config,
        });

        let handler = Arc::new(InboundHandler { inner: Arc::downgrade(&inner) });
        inner.channel.subscribe(handler).await?;

        info!(address = %inner.config.local_address, "call agent online");
        Ok(Self { inner })
    }

    /// Local address.
    pub fn address(&self) -> &str {
        &self.inner.config.local_address
    }

    /// Current call state.
    pub fn state(&self) -> CallState {
        self.inner.machine().state()
    }

    /// Current session id, terminal or not.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.machine().session().map(CallSession::id)
    }

    /// Remote peer of the current session.
    pub fn peer(&self) -> Option<String> {
        self.inner.machine().session().map(|s| s.peer().to_string())
    }

    /// Subscribe to call notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.inner.notifications.subscribe()
    }

    /// Call `peer`.
    ///
    /// Local media is acquired before the session is created, so a missing
    /// camera or an unreachable peer leaves no session behind.
    ///
    /// # Errors
    ///
    /// - `AgentError::Busy` if a call is in progress
    /// - `AgentError::Session` for an empty or self address
    /// - `AgentError::Signaling` (`TargetUnreachable`) if `peer` is not
    ///   registered
    /// - `AgentError::Media` (`DeviceUnavailable`) if there is no camera
    pub async fn start_call(&self, peer: &str) -> Result<SessionId, AgentError> {
        let inner = &self.inner;

        {
            let machine = inner.machine();
            if machine.is_active() {
                return Err(AgentError::Busy { state: machine.state() });
            }
        }

        Envelope::new(peer, self.address(), EnvelopeKind::Offer, "").map_err(SessionError::from)?;

        if !inner.channel.is_reachable(peer).await? {
            let error = SignalingError::TargetUnreachable { target: peer.to_string() };
            inner.report(&AgentError::from(error.clone()));
            return Err(error.into());
        }

        let (mut controller, events) =
            ConnectionController::new(Arc::clone(&inner.engine), inner.config.media_config())?;
        if let Err(e) = controller.create_local_media() {
            let error = AgentError::from(e);
            inner.report(&error);
            return Err(error);
        }

        let mut call = inner.call.lock().await;
        let (actions, session) = {
            let mut machine = inner.machine();
            let actions = machine.handle(CallEvent::StartCall { peer: peer.to_string() })?;
            let session = machine.session().map(CallSession::id);
            (actions, session)
        };
        let Some(session) = session else {
            return Err(SessionError::NoSession { operation: "start_call".to_string() }.into());
        };

        *call = Some(ActiveCall {
            session,
            controller,
            _pump: inner.spawn_pump(session, events),
        });
        drop(call);

        info!(%session, %peer, "calling");
        inner.run(actions).await;
        Ok(session)
    }

    /// Answer the pending incoming call.
    ///
    /// Local media is acquired first. If that fails the session fails, the
    /// caller is told the call ended, and the error is returned.
    ///
    /// # Errors
    ///
    /// - `AgentError::NoIncomingCall` if there is nothing to answer
    /// - `AgentError::Media` if local media cannot be acquired
    pub async fn accept_incoming_call(&self) -> Result<(), AgentError> {
        let inner = &self.inner;
        let session = inner.incoming_session().ok_or(AgentError::NoIncomingCall)?;

        // The offer's own PrepareTransport may not have run yet.
        if let Some(failure) = inner.prepare_transport(session).await {
            inner.dispatch(failure).await?;
            return Err(MediaError::NoTransport.into());
        }

        let acquired = {
            let mut call = inner.call.lock().await;
            match call.as_mut().filter(|c| c.session == session) {
                Some(active) => active.controller.create_local_media().map(|_| ()),
                None => Err(MediaError::NoTransport),
            }
        };

        if let Err(e) = acquired {
            inner
                .dispatch(CallEvent::LocalFailure { session, kind: e.kind(), detail: e.to_string() })
                .await?;
            return Err(e.into());
        }

        inner.dispatch(CallEvent::AcceptCall).await?;
        Ok(())
    }

    /// Decline the pending incoming call.
    ///
    /// # Errors
    ///
    /// - `AgentError::NoIncomingCall` if there is nothing to decline
    pub async fn reject_incoming_call(&self) -> Result<(), AgentError> {
        if self.inner.incoming_session().is_none() {
            return Err(AgentError::NoIncomingCall);
        }
        self.inner.dispatch(CallEvent::RejectCall).await?;
        Ok(())
    }

    /// End the current call. No-op without one.
    ///
    /// The state is `Ended` as soon as this is called; the method returns once
    /// the peer was notified and local media released.
    pub async fn hang_up(&self) -> Result<(), AgentError> {
        self.inner.dispatch(CallEvent::HangUp).await?;
        Ok(())
    }

    /// Mute or unmute the microphone.
    ///
    /// # Errors
    ///
    /// - `AgentError::NoActiveCall` without a call
    /// - `AgentError::Media` if local media was not acquired
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), AgentError> {
        self.inner.with_controller(|c| c.set_audio_enabled(enabled)).await
    }

    /// Pause or resume the camera.
    ///
    /// # Errors
    ///
    /// - `AgentError::NoActiveCall` without a call
    /// - `AgentError::Media` if local media was not acquired
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), AgentError> {
        self.inner.with_controller(|c| c.set_video_enabled(enabled)).await
    }

    /// Swap between front and back camera.
    ///
    /// # Errors
    ///
    /// - `AgentError::NoActiveCall` without a call
    /// - `AgentError::Media` if local media was not acquired
    pub async fn switch_camera(&self) -> Result<(), AgentError> {
        self.inner.with_controller(ConnectionController::switch_camera).await
    }

    /// Hang up, stop listening, and withdraw from the relay.
    ///
    /// # Errors
    ///
    /// - `AgentError::Signaling` if the relay refuses deregistration
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        self.hang_up().await?;
        self.inner.channel.unsubscribe().await;

        if let Some(mut active) = self.inner.call.lock().await.take() {
            active.controller.teardown();
        }

        self.inner.channel.withdraw_presence().await?;
        info!(address = %self.address(), "call agent offline");
        Ok(())
    }
}

impl<E: Environment, R: Relay> Inner<E, R> {
    fn machine(&self) -> MutexGuard<'_, CallMachine<E>> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn step(&self, event: CallEvent) -> Result<Vec<CallAction>, SessionError> {
        self.machine().handle(event)
    }

    fn incoming_session(&self) -> Option<SessionId> {
        let machine = self.machine();
        machine
            .session()
            .filter(|s| s.role() == Role::Callee && s.state() == CallState::OfferReceived)
            .map(CallSession::id)
    }

    fn report(&self, error: &AgentError) {
        if let Some(kind) = error.kind() {
            self.notifications.publish(CallNotification::Error {
                session: None,
                kind,
                detail: error.to_string(),
            });
        }
    }

    async fn with_controller(
        &self,
        f: impl FnOnce(&mut ConnectionController) -> Result<(), MediaError>,
    ) -> Result<(), AgentError> {
        let session = self
            .machine()
            .session()
            .filter(|s| !s.state().is_terminal())
            .map(CallSession::id)
            .ok_or(AgentError::NoActiveCall)?;

        let mut call = self.call.lock().await;
        let active =
            call.as_mut().filter(|c| c.session == session).ok_or(AgentError::NoActiveCall)?;
        Ok(f(&mut active.controller)?)
    }
}

impl<E: Environment, R: Relay> Inner<E, R> {
    /// Feed `event` to the machine and run everything that follows from it.
    async fn dispatch(self: &Arc<Self>, event: CallEvent) -> Result<(), SessionError> {
        let actions = self.step(event)?;
        self.run(actions).await;
        Ok(())
    }

    async fn run(self: &Arc<Self>, actions: Vec<CallAction>) {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            let Some(event) = self.execute(action).await else {
                continue;
            };

            match self.step(event) {
                Ok(more) => queue.extend(more),
                Err(e) => warn!(error = %e, "completion rejected by call machine"),
            }
        }
    }

    async fn execute(self: &Arc<Self>, action: CallAction) -> Option<CallEvent> {
        match action {
            CallAction::PrepareTransport { session } => self.prepare_transport(session).await,

            CallAction::CreateOffer { session } => {
                let transport = match self.transport_for(session).await? {
                    Ok(transport) => transport,
                    Err(e) => return Some(local_failure(session, &e)),
                };
                Some(match negotiate_offer(&*transport).await {
                    Ok(description) => CallEvent::LocalDescriptionReady { session, description },
                    Err(e) => local_failure(session, &e),
                })
            },

            CallAction::CreateAnswer { session } => {
                let transport = match self.transport_for(session).await? {
                    Ok(transport) => transport,
                    Err(e) => return Some(local_failure(session, &e)),
                };
                Some(match negotiate_answer(&*transport).await {
                    Ok(description) => CallEvent::LocalDescriptionReady { session, description },
                    Err(e) => local_failure(session, &e),
                })
            },

            CallAction::ApplyRemoteDescription { session, description } => {
                let transport = match self.transport_for(session).await? {
                    Ok(transport) => transport,
                    Err(e) => return Some(local_failure(session, &e)),
                };
                if let Err(e) = transport.set_remote_description(&description).await {
                    return Some(local_failure(session, &e));
                }

                let buffered = {
                    let mut call = self.call.lock().await;
                    live_mut(&mut call, session)?.controller.remote_description_installed()
                };
                flush_candidates(&*transport, buffered).await;
                Some(CallEvent::RemoteDescriptionApplied { session })
            },

            CallAction::AddRemoteCandidate { session, candidate } => {
                let routed = {
                    let mut call = self.call.lock().await;
                    live_mut(&mut call, session)?.controller.route_remote_candidate(&candidate)
                };
                let result = match routed {
                    Ok(Some(transport)) => transport.add_ice_candidate(&candidate).await,
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(%session, error = %e, "remote candidate refused");
                }
                None
            },

            CallAction::Send { session, envelope } => match self.channel.send(&envelope).await {
                Ok(()) => None,
                Err(e) => Some(CallEvent::SendFailed {
                    session,
                    kind: signaling_error_kind(&e),
                    detail: e.to_string(),
                }),
            },

            CallAction::SendBestEffort { envelope } => {
                if let Err(e) = self.channel.send(&envelope).await {
                    debug!(to = %envelope.target, error = %e, "best-effort send failed");
                }
                None
            },

            CallAction::Teardown { session } => {
                let mut call = self.call.lock().await;
                if call.as_ref().is_some_and(|c| c.session == session) {
                    if let Some(mut active) = call.take() {
                        active.controller.teardown();
                    }
                }
                None
            },

            CallAction::Notify(notification) => {
                self.notifications.publish(notification);
                None
            },
        }
    }

    /// Negotiation object of `session`, taken out of the lock. `None` for a
    /// stale session.
    async fn transport_for(
        &self,
        session: SessionId,
    ) -> Option<Result<Arc<dyn PeerTransport>, MediaError>> {
        let call = self.call.lock().await;
        live(&call, session).map(|active| active.controller.transport())
    }

    async fn prepare_transport(self: &Arc<Self>, session: SessionId) -> Option<CallEvent> {
        let mut call = self.call.lock().await;
        if call.as_ref().is_some_and(|c| c.session == session) {
            return None;
        }

        match ConnectionController::new(Arc::clone(&self.engine), self.config.media_config()) {
            Ok((controller, events)) => {
                if let Some(mut previous) = call.take() {
                    previous.controller.teardown();
                }
                *call = Some(ActiveCall {
                    session,
                    controller,
                    _pump: self.spawn_pump(session, events),
                });
                None
            },
            Err(e) => Some(local_failure(session, &e)),
        }
    }

    /// Forward transport callbacks of `session` into the machine.
    ///
    /// Ends when the transport is released or the agent is dropped.
    fn spawn_pump(
        self: &Arc<Self>,
        session: SessionId,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };

                let event = match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        CallEvent::LocalCandidate { session, candidate }
                    },
                    TransportEvent::StateChanged(state) => {
                        CallEvent::TransportStateChanged { session, state }
                    },
                    TransportEvent::RemoteMedia(stream) => CallEvent::RemoteMedia { session, stream },
                };

                if let Err(e) = inner.dispatch(event).await {
                    warn!(%session, error = %e, "transport event rejected");
                }
            }
            debug!(%session, "transport event pump finished");
        })
    }
}

fn live(call: &Option<ActiveCall>, session: SessionId) -> Option<&ActiveCall> {
    let active = call.as_ref().filter(|c| c.session == session);
    if active.is_none() {
        debug!(%session, "skipping media operation for stale session");
    }
    active
}

fn live_mut(call: &mut Option<ActiveCall>, session: SessionId) -> Option<&mut ActiveCall> {
    let active = call.as_mut().filter(|c| c.session == session);
    if active.is_none() {
        debug!(%session, "skipping media operation for stale session");
    }
    active
}

fn local_failure(session: SessionId, error: &MediaError) -> CallEvent {
    CallEvent::LocalFailure { session, kind: error.kind(), detail: error.to_string() }
}

/// Routes relay deliveries into the agent without keeping it alive.
struct InboundHandler<E: Environment, R: Relay> {
    inner: Weak<Inner<E, R>>,
}

#[async_trait]
impl<E: Environment, R: Relay> EnvelopeHandler for InboundHandler<E, R> {
    async fn on_envelope(&self, envelope: Envelope) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if let Err(e) = inner.dispatch(CallEvent::EnvelopeReceived(envelope)).await {
            warn!(error = %e, "inbound envelope rejected");
        }
    }
}
