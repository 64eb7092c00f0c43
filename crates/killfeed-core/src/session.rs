//! The channel session.
//!
//! A [`ChannelSession`] owns one transport connection and one joined channel
//! topic on it. Its lifecycle is
//!
//! ```text
//! Unconnected --connect()--> Connecting --ok reply--> Joined --disconnect() / peer close--> Closed
//!                                 \--failure--------------------------------------------------^
//! ```
//!
//! `Closed` is terminal; reconnecting means building a new session.
//!
//! After the join the receiving half of the connection moves to a background
//! task that decodes frames in arrival order, reconciles replies against the
//! outstanding requests and hands every event to the [`Dispatcher`].
//! Commands are sent from the caller's task through the sending half, which
//! sits behind an async mutex shared with that task.

use crate::dispatch::{Dispatcher, DEFAULT_EVENT_CAPACITY};
use crate::error::{JoinFailure, SessionError};
use crate::event::{CloseReason, SessionEvent};
use crate::subscriptions::{OpKind, SubscriptionLedger, DEFAULT_PENDING_LIMIT};
use killfeed_protocol::{
    codec, Endpoint, InboundEvent, OutboundCommand, Ref, ReplyStatus, SystemId, JOIN_REF,
    LOBBY_TOPIC,
};
use killfeed_transport::{FrameSink, FrameStream, Transport};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Default time to wait for the join reply.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where to connect.
    pub endpoint: Endpoint,
    /// Channel topic to join.
    pub topic: String,
    /// Upper bound on connect + join.
    pub join_timeout: Duration,
    /// Broadcast capacity per consumer.
    pub event_capacity: usize,
    /// Interval for socket heartbeats. `None` disables them.
    pub heartbeat_interval: Option<Duration>,
    /// Requests kept waiting for a reply before the oldest is given up on.
    pub pending_limit: usize,
}

impl SessionConfig {
    /// Create a configuration for the killmail lobby on `endpoint`.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            topic: LOBBY_TOPIC.to_string(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            heartbeat_interval: None,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    /// Set the channel topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the join timeout.
    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the per-consumer event capacity.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the bound on unanswered requests.
    #[must_use]
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit.max(1);
        self
    }

    /// Enable socket heartbeats.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Joined,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Unconnected => "unconnected",
            SessionState::Connecting => "connecting",
            SessionState::Joined => "joined",
            SessionState::Closed => "closed",
        })
    }
}

/// What an outstanding correlation id was sent for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Status,
    Leave,
    Heartbeat,
}

/// Locally known session status.
///
/// Built before the server answers the status request, so it may disagree
/// with the server's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub subscription_id: Option<String>,
    pub subscribed_systems: BTreeSet<SystemId>,
    pub connected: bool,
}

struct SessionInner {
    state: SessionState,
    subscription_id: Option<String>,
    ledger: SubscriptionLedger,
    outstanding: BTreeMap<Ref, RequestKind>,
}

/// State shared between the session handle and its receive task.
struct Shared {
    topic: String,
    pending_limit: usize,
    running: AtomicBool,
    next_ref: AtomicU64,
    inner: Mutex<SessionInner>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    dispatcher: Dispatcher,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_ref(&self) -> Ref {
        Ref(self.next_ref.fetch_add(1, Ordering::SeqCst))
    }

    async fn send(&self, command: &OutboundCommand) -> Result<(), SessionError> {
        let text = codec::encode(command)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SessionError::NotConnected)?;
        sink.send(text).await?;
        trace!(event = %command.event, reference = %command.reference, "Sent command");
        Ok(())
    }

    /// Send a command whose reply is tracked by correlation id.
    ///
    /// The request is registered before the frame goes out so a fast reply
    /// always finds it, and forgotten again if sending fails. Past the pending
    /// limit the oldest unanswered request is dropped.
    async fn send_tracked(
        &self,
        command: &OutboundCommand,
        kind: RequestKind,
    ) -> Result<(), SessionError> {
        {
            let mut inner = self.inner();
            inner.outstanding.insert(command.reference, kind);
            while inner.outstanding.len() > self.pending_limit {
                let Some((reference, expired)) = inner.outstanding.pop_first() else {
                    break;
                };
                warn!(reference = %reference, request = ?expired, "Giving up on unanswered request");
                if matches!(expired, RequestKind::Subscribe | RequestKind::Unsubscribe) {
                    inner.ledger.discard(reference);
                }
            }
        }

        if let Err(e) = self.send(command).await {
            let mut inner = self.inner();
            inner.outstanding.remove(&command.reference);
            inner.ledger.discard(command.reference);
            return Err(e);
        }
        Ok(())
    }

    fn handle_frame(&self, data: &[u8]) {
        let frame = match codec::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = data.len(), "Failed to decode frame");
                return;
            }
        };

        let event = InboundEvent::classify(frame, JOIN_REF);
        match &event {
            InboundEvent::Reply {
                reference,
                status,
                response,
            } => self.resolve_reply(*reference, status, response),
            InboundEvent::KillmailUpdate {
                system_id,
                killmails,
                ..
            } => {
                debug!(system_id, count = killmails.len(), "Killmail update");
            }
            InboundEvent::KillCountUpdate { system_id, count } => {
                debug!(system_id, count, "Kill count update");
            }
            InboundEvent::JoinReply { status, .. } => {
                debug!(%status, "Join reply after join completed");
            }
            InboundEvent::Unrecognized { topic, event, .. } => {
                debug!(topic = %topic, event = %event, "Unrecognized event");
            }
        }

        self.dispatcher.dispatch(SessionEvent::Inbound(event));
    }

    fn resolve_reply(&self, reference: Option<Ref>, status: &ReplyStatus, response: &Value) {
        let Some(reference) = reference else {
            debug!(%status, "Reply without ref");
            return;
        };

        let request = {
            let mut inner = self.inner();
            let request = inner.outstanding.remove(&reference);
            if matches!(
                request,
                Some(RequestKind::Subscribe) | Some(RequestKind::Unsubscribe)
            ) {
                inner.ledger.resolve(reference, status.is_ok());
            }
            request
        };

        if status.is_ok() {
            debug!(reference = %reference, ?request, %response, "Command succeeded");
        } else {
            warn!(reference = %reference, ?request, %status, %response, "Command failed");
        }
    }

    async fn send_heartbeat(&self) {
        let command = OutboundCommand::heartbeat(self.next_ref());
        if let Err(e) = self.send_tracked(&command, RequestKind::Heartbeat).await {
            debug!(error = %e, "Failed to send heartbeat");
        }
    }
}

/// Client side of one channel over one connection.
pub struct ChannelSession {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    receiver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSession {
    /// Create an unconnected session.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            topic: config.topic.clone(),
            pending_limit: config.pending_limit.max(1),
            running: AtomicBool::new(false),
            next_ref: AtomicU64::new(JOIN_REF.value() + 1),
            inner: Mutex::new(SessionInner {
                state: SessionState::Unconnected,
                subscription_id: None,
                ledger: SubscriptionLedger::with_limit(config.pending_limit),
                outstanding: BTreeMap::new(),
            }),
            sink: tokio::sync::Mutex::new(None),
            dispatcher: Dispatcher::new(config.event_capacity),
        };

        Self {
            config,
            transport,
            shared: Arc::new(shared),
            shutdown,
            receiver: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect and join the channel.
    ///
    /// Sends exactly one `phx_join` with the reserved ref and waits for its
    /// reply, bounded by the join timeout. Frames that arrive before the
    /// reply are skipped. On success returns the reply's `response` payload.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless the session is
    /// unconnected, and [`SessionError::ConnectionFailure`] if the join does
    /// not succeed; the session is then closed and a
    /// [`Closed`](SessionEvent::Closed) event is dispatched.
    pub async fn connect(&self) -> Result<Value, SessionError> {
        {
            let mut inner = self.shared.inner();
            if inner.state != SessionState::Unconnected {
                return Err(SessionError::InvalidState(inner.state));
            }
            inner.state = SessionState::Connecting;
        }

        let url = self.config.endpoint.url();
        info!(url = %url, topic = %self.config.topic, transport = self.transport.name(), "Connecting");

        let joined = match tokio::time::timeout(self.config.join_timeout, self.join(&url)).await {
            Ok(result) => result,
            Err(_) => Err(JoinFailure::Timeout(self.config.join_timeout)),
        };

        let (mut sink, stream, response) = match joined {
            Ok(parts) => parts,
            Err(failure) => {
                warn!(error = %failure, "Connection failed");
                self.shared.inner().state = SessionState::Closed;
                self.shared
                    .dispatcher
                    .dispatch(SessionEvent::Closed(CloseReason::JoinFailed(failure.to_string())));
                return Err(SessionError::ConnectionFailure(failure));
            }
        };

        let subscription_id = response
            .get("subscription_id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        // The sink slot stays locked until the receive task is registered, so
        // a concurrent disconnect() either wins the state check below or
        // finds both the sink and the task to shut down.
        let mut slot = self.shared.sink.lock().await;
        let still_connecting = {
            let mut inner = self.shared.inner();
            let connecting = inner.state == SessionState::Connecting;
            if connecting {
                inner.state = SessionState::Joined;
                inner.subscription_id = subscription_id.clone();
                self.shared.running.store(true, Ordering::SeqCst);
            }
            connecting
        };
        if !still_connecting {
            drop(slot);
            debug!(topic = %self.config.topic, "Disconnected while joining");
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Ignoring close error");
            }
            self.shared
                .dispatcher
                .dispatch(SessionEvent::Closed(CloseReason::Disconnected));
            return Err(SessionError::ConnectionFailure(JoinFailure::Closed));
        }

        *slot = Some(sink);

        self.shared.dispatcher.dispatch(SessionEvent::Inbound(InboundEvent::JoinReply {
            reference: JOIN_REF,
            status: ReplyStatus::Ok,
            response: response.clone(),
        }));

        let handle = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            stream,
            self.shutdown.subscribe(),
            self.config.heartbeat_interval,
        ));
        *self.receiver.lock().await = Some(handle);
        drop(slot);

        info!(subscription_id = ?subscription_id, topic = %self.config.topic, "Joined channel");
        Ok(response)
    }

    async fn join(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>, Value), JoinFailure> {
        let connection = self
            .transport
            .connect(url)
            .await
            .map_err(JoinFailure::Transport)?;
        debug!(connection = %connection.id(), remote = ?connection.remote_addr(), "Transport connected");

        let (mut sink, mut stream) = connection.into_split();

        let join = OutboundCommand::join(self.config.topic.as_str(), JOIN_REF);
        let text = codec::encode(&join).map_err(|e| JoinFailure::Transport(e.into()))?;
        sink.send(text).await.map_err(JoinFailure::Transport)?;

        loop {
            let data = match stream.recv().await {
                Ok(Some(data)) => data,
                Ok(None) => return Err(JoinFailure::Closed),
                Err(e) => return Err(JoinFailure::Transport(e)),
            };

            let frame = match codec::decode(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable frame while joining");
                    continue;
                }
            };

            match InboundEvent::classify(frame, JOIN_REF) {
                InboundEvent::JoinReply {
                    status: ReplyStatus::Ok,
                    response,
                    ..
                } => return Ok((sink, stream, response)),
                InboundEvent::JoinReply {
                    status, response, ..
                } => {
                    let _ = sink.close().await;
                    return Err(JoinFailure::Rejected {
                        status: status.to_string(),
                        response,
                    });
                }
                other => {
                    debug!(kind = other.kind_name(), "Ignoring frame before join reply");
                }
            }
        }
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.shared.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Subscribe to systems.
    ///
    /// The returned set already includes `systems`; it does not wait for the
    /// server. An error reply arriving later rolls the change back.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the session is not running,
    /// or a transport error if the command could not be sent.
    pub async fn subscribe_to_topics(
        &self,
        systems: &[SystemId],
    ) -> Result<BTreeSet<SystemId>, SessionError> {
        self.change_subscription(OpKind::Subscribe, systems).await
    }

    /// Unsubscribe from systems.
    ///
    /// Mirror image of [`subscribe_to_topics`](Self::subscribe_to_topics).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the session is not running,
    /// or a transport error if the command could not be sent.
    pub async fn unsubscribe_from_topics(
        &self,
        systems: &[SystemId],
    ) -> Result<BTreeSet<SystemId>, SessionError> {
        self.change_subscription(OpKind::Unsubscribe, systems).await
    }

    async fn change_subscription(
        &self,
        kind: OpKind,
        systems: &[SystemId],
    ) -> Result<BTreeSet<SystemId>, SessionError> {
        self.ensure_running()?;

        let reference = self.shared.next_ref();
        let topic = self.config.topic.as_str();
        let (command, request) = match kind {
            OpKind::Subscribe => (
                OutboundCommand::subscribe_systems(topic, systems, reference),
                RequestKind::Subscribe,
            ),
            OpKind::Unsubscribe => (
                OutboundCommand::unsubscribe_systems(topic, systems, reference),
                RequestKind::Unsubscribe,
            ),
        };

        let visible = self.shared.inner().ledger.record(reference, kind, systems);
        self.shared.send_tracked(&command, request).await?;

        match kind {
            OpKind::Subscribe => {
                info!(systems = ?systems, total = visible.len(), "Subscribed to systems");
            }
            OpKind::Unsubscribe => {
                info!(systems = ?systems, remaining = visible.len(), "Unsubscribed from systems");
            }
        }
        Ok(visible)
    }

    /// Request the server's status and return the local snapshot.
    ///
    /// The server's answer arrives later as a
    /// [`Reply`](InboundEvent::Reply) event.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the session is not running,
    /// or a transport error if the command could not be sent.
    pub async fn get_status(&self) -> Result<StatusSnapshot, SessionError> {
        self.ensure_running()?;

        let command = OutboundCommand::get_status(self.config.topic.as_str(), self.shared.next_ref());
        self.shared.send_tracked(&command, RequestKind::Status).await?;

        Ok(self.status())
    }

    /// Local status without contacting the server.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let inner = self.shared.inner();
        StatusSnapshot {
            subscription_id: inner.subscription_id.clone(),
            subscribed_systems: inner.ledger.current(),
            connected: self.shared.running.load(Ordering::SeqCst),
        }
    }

    /// Leave the channel and close the connection.
    ///
    /// Best effort and idempotent: the leave frame is sent at most once and
    /// only while the connection is open, every error on the way is
    /// discarded, and the receive task is stopped and awaited.
    pub async fn disconnect(&self) {
        let previous = {
            let mut inner = self.shared.inner();
            self.shared.running.store(false, Ordering::SeqCst);
            std::mem::replace(&mut inner.state, SessionState::Closed)
        };

        let sink = self.shared.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if previous == SessionState::Joined && sink.is_open() {
                let reference = self.shared.next_ref();
                let leave = OutboundCommand::leave(self.config.topic.as_str(), reference);
                self.shared
                    .inner()
                    .outstanding
                    .insert(reference, RequestKind::Leave);
                match codec::encode(&leave) {
                    Ok(text) => {
                        if let Err(e) = sink.send(text).await {
                            debug!(error = %e, "Ignoring leave send error");
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring leave encode error"),
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Ignoring close error");
            }
        }

        self.shutdown.send_replace(true);
        if let Some(handle) = self.receiver.lock().await.take() {
            if let Err(e) = handle.await {
                debug!(error = %e, "Receive task ended abnormally");
            }
        }

        if previous != SessionState::Closed {
            info!(topic = %self.config.topic, "Disconnected");
        }
    }

    /// Check if the session is joined and receiving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.inner().state
    }

    /// Subscription id assigned by the server on join.
    #[must_use]
    pub fn subscription_id(&self) -> Option<String> {
        self.shared.inner().subscription_id.clone()
    }

    /// Visible subscription set, including unanswered changes.
    #[must_use]
    pub fn subscriptions(&self) -> BTreeSet<SystemId> {
        self.shared.inner().ledger.current()
    }

    /// Subscriptions the server has acknowledged.
    #[must_use]
    pub fn confirmed_subscriptions(&self) -> BTreeSet<SystemId> {
        self.shared.inner().ledger.confirmed().clone()
    }

    /// Correlation ids still waiting for a reply, in send order.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<(Ref, RequestKind)> {
        self.shared
            .inner()
            .outstanding
            .iter()
            .map(|(reference, kind)| (*reference, *kind))
            .collect()
    }

    /// The event dispatcher. Register consumers here, before or after
    /// connecting.
    #[must_use]
    pub fn events(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("topic", &self.config.topic)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

async fn next_heartbeat(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut stream: Box<dyn FrameStream>,
    mut shutdown: watch::Receiver<bool>,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    debug!(topic = %shared.topic, "Receive loop started");

    let reason = loop {
        if !shared.running.load(Ordering::SeqCst) || *shutdown.borrow() {
            break CloseReason::Disconnected;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => break CloseReason::Disconnected,

            result = stream.recv() => match result {
                Ok(Some(data)) => shared.handle_frame(&data),
                Ok(None) => {
                    info!(topic = %shared.topic, "Connection closed by peer");
                    break CloseReason::PeerClosed;
                }
                Err(e) => {
                    warn!(topic = %shared.topic, error = %e, "Transport error");
                    break CloseReason::TransportError(e.to_string());
                }
            },

            _ = next_heartbeat(&mut ticker) => shared.send_heartbeat().await,
        }
    };

    shared.running.store(false, Ordering::SeqCst);
    {
        let mut inner = shared.inner();
        inner.state = SessionState::Closed;
        inner.outstanding.clear();
    }

    debug!(topic = %shared.topic, reason = %reason, "Receive loop stopped");
    shared.dispatcher.dispatch(SessionEvent::Closed(reason));
}
