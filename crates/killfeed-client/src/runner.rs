//! Client run loop.
//!
//! Connects, subscribes to the configured systems, logs everything the feed
//! pushes and disconnects on a shutdown signal or when the server goes away.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use killfeed_core::{ChannelSession, CloseReason, SessionConfig, SessionEvent};
use killfeed_protocol::{Endpoint, InboundEvent, Killmail};
use killfeed_transport::WebSocketTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Build a session from the configuration.
///
/// # Errors
///
/// Returns an error if the server URL or client identifier is invalid.
pub fn build_session(config: &Config) -> Result<ChannelSession> {
    let endpoint = Endpoint::new(&config.server_url, config.client_identifier.as_str())
        .context("Invalid server endpoint")?;

    let mut session_config = SessionConfig::new(endpoint)
        .with_topic(config.topic.as_str())
        .with_join_timeout(config.join_timeout())
        .with_event_capacity(config.event_capacity)
        .with_pending_limit(config.pending_limit);
    if let Some(interval) = config.heartbeat_interval() {
        session_config = session_config.with_heartbeat(interval);
    }

    Ok(ChannelSession::new(
        Arc::new(WebSocketTransport::default()),
        session_config,
    ))
}

/// Run the client until shutdown.
///
/// # Errors
///
/// Returns an error if the session cannot be built or joined.
pub async fn run(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let session = Arc::new(build_session(&config)?);
    let events = session.events().subscribe_all();
    let event_task = tokio::spawn(log_events(events));

    let response = match session.connect().await {
        Ok(response) => response,
        Err(e) => {
            metrics::record_error("connect");
            event_task.abort();
            return Err(e).context("Failed to join the killmail channel");
        }
    };
    metrics::record_connection();
    info!(
        subscription_id = ?session.subscription_id(),
        response = %response,
        "Connected to killmail feed"
    );

    let result = drive(&session, &config, event_task).await;

    session.disconnect().await;
    metrics::record_disconnection();
    info!("Goodbye");

    result
}

async fn drive(
    session: &Arc<ChannelSession>,
    config: &Config,
    mut event_task: JoinHandle<()>,
) -> Result<()> {
    if !config.systems.is_empty() {
        let systems = session.subscribe_to_topics(&config.systems).await?;
        metrics::set_subscribed_systems(systems.len());
    }

    let status = session.get_status().await?;
    info!(status = %serde_json::to_string(&status)?, "Current status");

    let unsubscribe_task = config.unsubscribe.clone().map(|unsubscribe| {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(unsubscribe.after_secs)).await;
            match session.unsubscribe_from_topics(&unsubscribe.systems).await {
                Ok(remaining) => metrics::set_subscribed_systems(remaining.len()),
                Err(e) => {
                    metrics::record_error("unsubscribe");
                    warn!(error = %e, "Delayed unsubscribe failed");
                }
            }
        })
    });

    info!("Listening for killmail updates, press Ctrl+C to stop");

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result.context("Failed to install signal handlers")?;
            info!("Shutdown signal received");
        }
        _ = &mut event_task => {
            info!("Session ended");
        }
    }

    if let Some(task) = unsubscribe_task {
        task.abort();
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Log session events until the session closes.
async fn log_events(mut events: broadcast::Receiver<Arc<SessionEvent>>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event consumer lagging");
                metrics::record_lagged(skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        metrics::record_event(event.kind());

        match &*event {
            SessionEvent::Inbound(inbound) => log_inbound(inbound),
            SessionEvent::Closed(reason) => {
                match reason {
                    CloseReason::Disconnected => debug!("Session closed"),
                    CloseReason::PeerClosed => warn!("Connection closed by server"),
                    CloseReason::TransportError(e) => {
                        metrics::record_error("transport");
                        error!(error = %e, "Connection lost");
                    }
                    CloseReason::JoinFailed(e) => debug!(error = %e, "Join failed"),
                }
                break;
            }
        }
    }
}

fn log_inbound(event: &InboundEvent) {
    match event {
        InboundEvent::KillmailUpdate {
            system_id,
            killmails,
            timestamp,
        } => {
            metrics::record_killmails(killmails.len());
            info!(
                system_id,
                count = killmails.len(),
                timestamp = timestamp.as_deref().unwrap_or("-"),
                "New killmails"
            );
            for (i, killmail) in killmails.iter().enumerate() {
                info!("  [{}] {}", i + 1, summarize(killmail));
            }
        }
        InboundEvent::KillCountUpdate { system_id, count } => {
            info!(system_id, count, "Kill count update");
        }
        InboundEvent::Reply {
            reference,
            status,
            response,
        } => {
            if status.is_ok() {
                debug!(reference = ?reference, response = %response, "Command succeeded");
            } else {
                metrics::record_error("reply");
                error!(reference = ?reference, %status, response = %response, "Command failed");
            }
        }
        InboundEvent::JoinReply { .. } => {}
        InboundEvent::Unrecognized { topic, event, .. } => {
            debug!(topic = %topic, event = %event, "Unhandled event");
        }
    }
}

/// One-line description of a killmail.
fn summarize(killmail: &Killmail) -> String {
    let mut line = match killmail.killmail_id {
        Some(id) => format!("Killmail {id}"),
        None => "Killmail (no id)".to_string(),
    };

    if let Some(victim) = &killmail.victim {
        let name = victim.character_name.as_deref().unwrap_or("Unknown");
        let ship = victim.ship_type_name.as_deref().unwrap_or("Unknown ship");
        line.push_str(&format!(", victim: {name} ({ship})"));
    }

    if !killmail.attackers.is_empty() {
        line.push_str(&format!(", attackers: {}", killmail.attackers.len()));
    }

    line
}
