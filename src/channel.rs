// file: src/channel.rs
// description: per-job notification channels, connection lifecycle and event fan-out

use crate::{
    client_state::{ClientState, SharedClientState},
    config::ChannelConfig,
    error::{SyncError, SyncResult},
    events::{LifecycleEvent, LifecycleReceiver, LifecycleSender, create_lifecycle_channel},
    monitoring::{
        CONNECTED_GAUGE, ChannelHealth, EVENTS_DISPATCHED_COUNTER, EVENTS_DROPPED_COUNTER,
        FRAMES_RECEIVED_COUNTER, RECONNECT_COUNTER,
    },
    protocol::{EnginePacket, OpenHandshake, SocketPacket},
    reconnect::{next_delay, with_jitter},
    registry::{Listener, ListenerRegistry},
    transport::{Connection, Connector},
    types::{ChannelEvent, EventKind, JobId},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use url::Url;
use uuid::Uuid;

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The live connection currently bound to a job scope.
struct Link {
    connection_id: Uuid,
    cancel: CancellationToken,
    state: SharedClientState,
    task: JoinHandle<()>,
}

impl Link {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

/// Listener scope and connection slot for one job.
struct JobScope {
    job_id: JobId,
    registry: ListenerRegistry,
    link: Mutex<Option<Link>>,
}

impl JobScope {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            registry: ListenerRegistry::new(),
            link: Mutex::new(None),
        }
    }

    fn is_current(&self, connection_id: Uuid) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|link| link.connection_id == connection_id)
    }

    /// Called by a connection task on exit; leaves newer links alone.
    fn release(&self, connection_id: Uuid) {
        let mut link = lock(&self.link);
        if link
            .as_ref()
            .is_some_and(|l| l.connection_id == connection_id)
        {
            *link = None;
        }
    }

    fn shutdown(&self) {
        if let Some(link) = lock(&self.link).take() {
            link.cancel.cancel();
        }
        self.registry.clear();
    }
}

/// Owns one notification connection per subscribed job and fans incoming
/// events out to the listeners registered for that job.
///
/// Share it behind an `Arc`; every method takes `&self`. `connect` spawns
/// onto the current tokio runtime.
pub struct ChannelManager<C: Connector> {
    connector: Arc<C>,
    config: Arc<ChannelConfig>,
    scopes: Mutex<HashMap<JobId, Arc<JobScope>>>,
    lifecycle: LifecycleSender,
}

impl<C: Connector> ChannelManager<C> {
    pub fn new(connector: C, config: ChannelConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config: Arc::new(config),
            scopes: Mutex::new(HashMap::new()),
            lifecycle: create_lifecycle_channel(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn scope(&self, job_id: &JobId) -> Arc<JobScope> {
        lock(&self.scopes)
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(JobScope::new(job_id.clone())))
            .clone()
    }

    fn existing_scope(&self, job_id: &JobId) -> Option<Arc<JobScope>> {
        lock(&self.scopes).get(job_id).cloned()
    }

    /// Opens the channel for `job_id`.
    ///
    /// A no-op returning `Ok(false)` while that job already has a live
    /// connection. Other jobs are unaffected. Listeners registered for the
    /// job (before or after this call) stay registered across transport drops.
    pub fn connect(&self, job_id: &JobId) -> SyncResult<bool> {
        let scope = self.scope(job_id);
        let mut slot = lock(&scope.link);
        if slot.as_ref().is_some_and(Link::is_live) {
            debug!(job_id = %job_id, "Channel already open, connect ignored");
            return Ok(false);
        }

        let endpoint = self.config.endpoint_for(job_id)?;
        let connection_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let state: SharedClientState =
            Arc::new(tokio::sync::Mutex::new(ClientState::new(connection_id)));

        let task = ConnectionTask {
            connector: self.connector.clone(),
            config: self.config.clone(),
            scope: scope.clone(),
            endpoint,
            connection_id,
            cancel: cancel.clone(),
            state: state.clone(),
            lifecycle: self.lifecycle.clone(),
        };
        let span = info_span!("channel", job_id = %job_id, connection_id = %connection_id);
        let handle = tokio::spawn(task.run().instrument(span));

        *slot = Some(Link {
            connection_id,
            cancel,
            state,
            task: handle,
        });
        Ok(true)
    }

    /// Tears down the job's connection, if any, and clears every listener
    /// registered for the job. Frames still in flight from the old
    /// connection are never delivered.
    pub fn disconnect(&self, job_id: &JobId) {
        let scope = lock(&self.scopes).remove(job_id);
        if let Some(scope) = scope {
            scope.shutdown();
            info!(job_id = %job_id, "Channel disconnected and listeners cleared");
        }
    }

    pub fn disconnect_all(&self) {
        let scopes: Vec<Arc<JobScope>> = lock(&self.scopes).drain().map(|(_, s)| s).collect();
        for scope in scopes {
            scope.shutdown();
        }
    }

    /// Registers `listener` for `kind` on the job's scope. Returns false if
    /// this exact listener was already registered.
    pub fn on(&self, job_id: &JobId, kind: EventKind, listener: Listener) -> bool {
        self.scope(job_id).registry.add(kind, listener)
    }

    /// Removes one listener; returns false if it was not registered.
    pub fn off(&self, job_id: &JobId, kind: EventKind, listener: &Listener) -> bool {
        self.existing_scope(job_id)
            .is_some_and(|scope| scope.registry.remove(kind, listener))
    }

    pub fn listener_count(&self, job_id: &JobId, kind: EventKind) -> usize {
        self.existing_scope(job_id)
            .map_or(0, |scope| scope.registry.listener_count(kind))
    }

    pub fn is_connected(&self, job_id: &JobId) -> bool {
        self.existing_scope(job_id)
            .is_some_and(|scope| lock(&scope.link).as_ref().is_some_and(Link::is_live))
    }

    pub fn connected_jobs(&self) -> Vec<JobId> {
        let scopes: Vec<Arc<JobScope>> = lock(&self.scopes).values().cloned().collect();
        scopes
            .into_iter()
            .filter(|scope| lock(&scope.link).as_ref().is_some_and(Link::is_live))
            .map(|scope| scope.job_id.clone())
            .collect()
    }

    pub fn lifecycle(&self) -> LifecycleReceiver {
        self.lifecycle.subscribe()
    }

    pub async fn health(&self, job_id: &JobId) -> Option<ChannelHealth> {
        let state = {
            let scope = self.existing_scope(job_id)?;
            let link = lock(&scope.link);
            link.as_ref()?.state.clone()
        };
        let state = state.lock().await;
        Some(state.health(job_id.as_str()))
    }
}

impl<C: Connector> Drop for ChannelManager<C> {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

enum Flow {
    Continue,
    Joined,
    Stop(String),
}

struct ConnectionTask<C: Connector> {
    connector: Arc<C>,
    config: Arc<ChannelConfig>,
    scope: Arc<JobScope>,
    endpoint: Url,
    connection_id: Uuid,
    cancel: CancellationToken,
    state: SharedClientState,
    lifecycle: LifecycleSender,
}

impl<C: Connector> ConnectionTask<C> {
    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine.
        let _ = self.lifecycle.send(event);
    }

    fn job_id(&self) -> JobId {
        self.scope.job_id.clone()
    }

    async fn run(self) {
        let policy = &self.config.reconnect;
        let mut delay = policy.initial_delay;

        loop {
            let established = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.establish() => result,
            };

            match established {
                Ok((mut conn, open)) => {
                    delay = policy.initial_delay;
                    CONNECTED_GAUGE.increment(1.0);
                    let outcome = self.pump(&mut conn, &open).await;
                    CONNECTED_GAUGE.decrement(1.0);

                    if self.cancel.is_cancelled() {
                        self.say_goodbye(&mut conn).await;
                        break;
                    }

                    let reason = match outcome {
                        Ok(reason) => reason,
                        Err(e) => e.to_string(),
                    };
                    warn!(reason = %reason, "Channel dropped");
                    self.state.lock().await.disconnect(Some(reason.clone()));
                    self.emit(LifecycleEvent::Disconnected {
                        job_id: self.job_id(),
                        reason,
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to open channel");
                    self.state.lock().await.disconnect(Some(e.to_string()));
                    self.emit(LifecycleEvent::ConnectionFailed {
                        job_id: self.job_id(),
                        error: e.to_string(),
                    });
                }
            }

            if !policy.enabled {
                break;
            }

            let next = self.state.lock().await.begin_reconnect(policy);
            let Some(attempt) = next else {
                error!(
                    "Maximum reconnection attempts ({}) reached",
                    policy.max_attempts
                );
                self.emit(LifecycleEvent::ConnectionFailed {
                    job_id: self.job_id(),
                    error: SyncError::MaxReconnectsExceeded.to_string(),
                });
                break;
            };

            let wait = with_jitter(delay, policy);
            RECONNECT_COUNTER.increment(1);
            warn!(
                attempt,
                delay_ms = wait.as_millis() as u64,
                "Reconnecting"
            );
            self.emit(LifecycleEvent::Reconnecting {
                job_id: self.job_id(),
                attempt,
                delay: wait,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
            delay = next_delay(delay, policy);
        }

        self.scope.release(self.connection_id);
        self.emit(LifecycleEvent::Closed {
            job_id: self.job_id(),
        });
        debug!("Connection task exited");
    }

    /// Dials the endpoint and completes the Engine.IO and Socket.IO handshakes.
    async fn establish(&self) -> SyncResult<(C::Conn, OpenHandshake)> {
        self.emit(LifecycleEvent::Connecting {
            job_id: self.job_id(),
            url: self.endpoint.to_string(),
        });

        let limit = self.config.timeout;
        let mut conn = timeout(limit, self.connector.open(&self.endpoint))
            .await
            .map_err(|_| SyncError::Timeout)??;

        let open = timeout(limit, self.await_open(&mut conn))
            .await
            .map_err(|_| SyncError::Timeout)??;

        conn.send_text(EnginePacket::Message(SocketPacket::connect()).encode())
            .await?;
        timeout(limit, self.await_join(&mut conn))
            .await
            .map_err(|_| SyncError::Timeout)??;

        self.state.lock().await.mark_connected(open.sid.clone());
        info!(
            sid = %open.sid,
            ping_interval_ms = open.ping_interval,
            "Channel established to {}",
            self.endpoint
        );
        self.emit(LifecycleEvent::Connected {
            job_id: self.job_id(),
            connection_id: self.connection_id,
        });
        Ok((conn, open))
    }

    async fn await_open(&self, conn: &mut C::Conn) -> SyncResult<OpenHandshake> {
        loop {
            let text = conn.recv_text().await?.ok_or(SyncError::ConnectionClosed)?;
            self.record_frame().await;
            match EnginePacket::parse(&text)? {
                EnginePacket::Open(open) => return Ok(open),
                EnginePacket::Close => return Err(SyncError::ConnectionClosed),
                other => trace!("Ignoring {:?} before open", other),
            }
        }
    }

    async fn await_join(&self, conn: &mut C::Conn) -> SyncResult<()> {
        loop {
            let text = conn.recv_text().await?.ok_or(SyncError::ConnectionClosed)?;
            match self.handle_frame(conn, &text).await? {
                Flow::Joined => return Ok(()),
                Flow::Continue => {}
                Flow::Stop(reason) => {
                    return Err(SyncError::HandshakeFailed { reason });
                }
            }
        }
    }

    /// Reads frames until the peer goes away, the heartbeat lapses or the
    /// task is cancelled. `Ok` carries the reason for an orderly close.
    async fn pump(&self, conn: &mut C::Conn, open: &OpenHandshake) -> SyncResult<String> {
        let liveness = open.liveness_window();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok("disconnect requested".to_string()),
                next = timeout(liveness, conn.recv_text()) => next,
            };

            let text = match next {
                Err(_) => {
                    warn!(
                        window_ms = liveness.as_millis() as u64,
                        "No heartbeat from server"
                    );
                    return Err(SyncError::Timeout);
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => return Ok("transport closed by server".to_string()),
                Ok(Ok(Some(text))) => text,
            };

            match self.handle_frame(conn, &text).await? {
                Flow::Continue | Flow::Joined => {}
                Flow::Stop(reason) => return Ok(reason),
            }
        }
    }

    async fn record_frame(&self) {
        FRAMES_RECEIVED_COUNTER.increment(1);
        self.state.lock().await.record_frame();
    }

    async fn record_drop(&self) {
        EVENTS_DROPPED_COUNTER.increment(1);
        self.state.lock().await.record_drop();
    }

    async fn handle_frame(&self, conn: &mut C::Conn, text: &str) -> SyncResult<Flow> {
        self.record_frame().await;
        trace!("Received frame: {}", text);

        let packet = match EnginePacket::parse(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    error = %e,
                    "Dropping malformed frame: {}",
                    text.chars().take(100).collect::<String>()
                );
                self.record_drop().await;
                return Ok(Flow::Continue);
            }
        };

        match packet {
            EnginePacket::Ping(body) => {
                conn.send_text(EnginePacket::Pong(body).encode()).await?;
            }
            EnginePacket::Close => return Ok(Flow::Stop("server closed the session".into())),
            EnginePacket::Message(SocketPacket::Connect { .. }) => return Ok(Flow::Joined),
            EnginePacket::Message(SocketPacket::ConnectError { message, .. }) => {
                return Err(SyncError::ConnectRejected { message });
            }
            EnginePacket::Message(SocketPacket::Disconnect { .. }) => {
                return Ok(Flow::Stop("server disconnected the namespace".into()));
            }
            EnginePacket::Message(SocketPacket::Event { name, payload, .. }) => {
                self.deliver(&name, payload).await;
            }
            EnginePacket::Message(SocketPacket::Binary { attachments, .. }) => {
                warn!(attachments, "Binary events are not supported, dropping");
                self.record_drop().await;
            }
            EnginePacket::Message(SocketPacket::Ack { .. })
            | EnginePacket::Pong(_)
            | EnginePacket::Noop
            | EnginePacket::Upgrade
            | EnginePacket::Open(_) => {}
        }
        Ok(Flow::Continue)
    }

    async fn deliver(&self, name: &str, payload: serde_json::Value) {
        let event = match ChannelEvent::decode(name, payload, &self.scope.job_id) {
            Ok(event) => event,
            Err(e) => {
                warn!(event = name, error = %e, "Dropping undecodable event");
                self.record_drop().await;
                return;
            }
        };

        if !self.scope.is_current(self.connection_id) {
            debug!(event = name, "Dropping event from a retired connection");
            self.record_drop().await;
            return;
        }

        let report = self.scope.registry.dispatch(&event);
        EVENTS_DISPATCHED_COUNTER.increment(1);
        self.state.lock().await.record_dispatch();
        trace!(
            event = name,
            delivered = report.delivered,
            panicked = report.panicked,
            "Event dispatched"
        );
    }

    async fn say_goodbye(&self, conn: &mut C::Conn) {
        let farewell = EnginePacket::Message(SocketPacket::disconnect()).encode();
        if timeout(GOODBYE_TIMEOUT, conn.send_text(farewell)).await.is_err() {
            debug!("Namespace disconnect not acknowledged in time");
        }
        let _ = timeout(GOODBYE_TIMEOUT, conn.close()).await;
        self.state.lock().await.disconnect(None);
    }
}
