//! Callframe loopback demo.
//!
//! Places one call between two in-process agents over the simulated relay and
//! media engine, keeps it up for a while, then hangs up.
//!
//! # Usage
//!
//! ```bash
//! # Default peers and STUN servers
//! callframe
//!
//! # Custom peers, a TURN server and a longer call
//! callframe --caller alice --callee bob \
//!     --ice-server turn:turn.example.org:3478 --turn-username u --turn-credential p \
//!     --duration-ms 5000
//! ```

use std::{error::Error, sync::Arc, time::Duration};

use callframe_app::{AgentConfig, CallAgent, CallNotification};
use callframe_core::{CallState, IceServer, MediaEngine, TransportConfig};
use callframe_harness::{SimEnv, SimMediaEngine, SimRelay};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type DemoAgent = CallAgent<SimEnv, SimRelay>;

/// Callframe loopback call
#[derive(Parser, Debug)]
#[command(name = "callframe")]
#[command(about = "Run one simulated audio/video call between two local peers")]
#[command(version)]
struct Args {
    /// Address of the calling peer
    #[arg(long, default_value = "alice")]
    caller: String,

    /// Address of the called peer
    #[arg(long, default_value = "bob")]
    callee: String,

    /// ICE server URL (`stun:` or `turn:`), repeatable
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Username for `turn:` servers
    #[arg(long)]
    turn_username: Option<String>,

    /// Credential for `turn:` servers
    #[arg(long)]
    turn_credential: Option<String>,

    /// How long the connected call stays up
    #[arg(long, default_value = "1000")]
    duration_ms: u64,

    /// Seed for session ids and relay fault injection
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Seconds to wait for the call to connect
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// ICE servers from the command line.
    ///
    /// A `turn:` URL needs both `--turn-username` and `--turn-credential`.
    fn transport(&self) -> Result<TransportConfig, String> {
        if self.ice_servers.is_empty() {
            return Ok(TransportConfig::default());
        }

        let ice_servers = self
            .ice_servers
            .iter()
            .map(|url| {
                if !url.starts_with("turn:") {
                    return Ok(IceServer::stun(url.as_str()));
                }
                match (&self.turn_username, &self.turn_credential) {
                    (Some(user), Some(credential)) => {
                        Ok(IceServer::turn(url.as_str(), user.as_str(), credential.as_str()))
                    },
                    _ => Err(format!(
                        "{url} needs both --turn-username and --turn-credential"
                    )),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransportConfig { ice_servers, ..TransportConfig::default() })
    }

    fn config(&self, address: &str, transport: &TransportConfig) -> AgentConfig {
        AgentConfig { transport: transport.clone(), ..AgentConfig::new(address) }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let transport = args.transport()?;
    let relay = Arc::new(SimRelay::with_seed(args.seed));
    let caller =
        connect(args.config(&args.caller, &transport), Arc::clone(&relay), args.seed).await?;
    let callee =
        connect(args.config(&args.callee, &transport), relay, args.seed.wrapping_add(1)).await?;

    tokio::spawn(auto_answer(callee.clone(), callee.subscribe()));
    let mut events = caller.subscribe();

    let session = caller.start_call(&args.callee).await?;
    info!(%session, from = %args.caller, to = %args.callee, "call placed");

    let timeout = Duration::from_secs(args.connect_timeout);
    match tokio::time::timeout(timeout, until_settled(&mut events)).await {
        Ok(CallState::Connected) => {
            info!(duration_ms = args.duration_ms, "call connected");
            tokio::time::sleep(Duration::from_millis(args.duration_ms)).await;
            caller.hang_up().await?;
        },
        Ok(state) => warn!(?state, "call did not connect"),
        Err(_) => {
            warn!(?timeout, "timed out waiting for the call to connect");
            caller.hang_up().await?;
        },
    }

    // Let the callee observe the end of the call before going offline.
    let _ = tokio::time::timeout(Duration::from_secs(1), wait_terminal(&callee)).await;

    caller.shutdown().await?;
    callee.shutdown().await?;
    info!(caller = ?caller.state(), callee = ?callee.state(), "demo finished");
    Ok(())
}

async fn connect(
    config: AgentConfig,
    relay: Arc<SimRelay>,
    seed: u64,
) -> Result<DemoAgent, Box<dyn Error>> {
    let engine: Arc<dyn MediaEngine> = Arc::new(SimMediaEngine::default());
    let agent = CallAgent::connect(config, relay, engine, SimEnv::with_seed(seed)).await?;
    Ok(agent)
}

/// Accept every incoming call and log the rest.
async fn auto_answer(agent: DemoAgent, mut events: broadcast::Receiver<CallNotification>) {
    loop {
        match events.recv().await {
            Ok(CallNotification::IncomingCall { session, peer }) => {
                info!(%session, %peer, "incoming call, answering");
                if let Err(e) = agent.accept_incoming_call().await {
                    warn!(error = %e, "answer failed");
                }
            },
            Ok(notification) => log_notification(agent.address(), &notification),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notifications dropped");
            },
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Wait for `Connected` or a terminal state, logging along the way.
async fn until_settled(events: &mut broadcast::Receiver<CallNotification>) -> CallState {
    loop {
        match events.recv().await {
            Ok(CallNotification::StateChanged { state, .. })
                if state == CallState::Connected || state.is_terminal() =>
            {
                return state;
            },
            Ok(notification) => log_notification("caller", &notification),
            Err(broadcast::error::RecvError::Lagged(_)) => {},
            Err(broadcast::error::RecvError::Closed) => return CallState::Idle,
        }
    }
}

async fn wait_terminal(agent: &DemoAgent) {
    while !agent.state().is_terminal() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn log_notification(who: &str, notification: &CallNotification) {
    match notification {
        CallNotification::StateChanged { session, state } => {
            info!(%who, %session, ?state, "state changed");
        },
        CallNotification::ConnectionStateChanged { session, state } => {
            info!(%who, %session, ?state, "media path");
        },
        CallNotification::RemoteMediaAvailable { session, stream } => {
            info!(
                %who,
                %session,
                stream = %stream.id,
                audio = stream.audio_tracks,
                video = stream.video_tracks,
                "remote media"
            );
        },
        CallNotification::CallEnded { session, peer, state, duration } => {
            info!(%who, %session, %peer, ?state, ?duration, "call ended");
        },
        CallNotification::Error { session, kind, detail } => {
            warn!(%who, ?session, %kind, %detail, "call error");
        },
        CallNotification::IncomingCall { session, peer } => {
            info!(%who, %session, %peer, "incoming call");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("callframe").chain(extra.iter().copied())).unwrap()
    }

    #[test]
    fn no_servers_uses_defaults() {
        assert_eq!(parse(&[]).transport().unwrap(), TransportConfig::default());
    }

    #[test]
    fn turn_with_credentials_is_kept() {
        let args = parse(&[
            "--ice-server",
            "stun:stun.example.org:3478",
            "--ice-server",
            "turn:turn.example.org:3478",
            "--turn-username",
            "u",
            "--turn-credential",
            "p",
        ]);

        let transport = args.transport().unwrap();
        assert_eq!(transport.ice_servers, vec![
            IceServer::stun("stun:stun.example.org:3478"),
            IceServer::turn("turn:turn.example.org:3478", "u", "p"),
        ]);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let args = parse(&["--ice-server", "turn:turn.example.org:3478", "--turn-username", "u"]);

        let error = args.transport().unwrap_err();
        assert!(error.contains("turn:turn.example.org:3478"));
        assert!(error.contains("--turn-credential"));
    }

    #[test]
    fn config_carries_transport() {
        let args = parse(&["--ice-server", "stun:stun.example.org:3478"]);
        let transport = args.transport().unwrap();

        let config = args.config("alice", &transport);
        assert_eq!(config.local_address, "alice");
        assert_eq!(config.transport, transport);
    }
}
