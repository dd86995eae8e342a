/// file: src/client_state.rs
/// description: per-connection bookkeeping shared between the connection task and the manager
use crate::monitoring::ChannelHealth;
use crate::reconnect::ReconnectConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ClientState {
    pub connection_id: uuid::Uuid,
    pub session_id: Option<String>,
    pub is_connected: bool,
    /// Attempts since the last successful handshake.
    pub reconnect_attempt: u32,
    /// Reconnections over the lifetime of this link.
    pub reconnect_count: u32,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub total_frames: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub last_error: Option<String>,
    pub started_at: Instant,
    pub last_disconnection_time: Option<Instant>,
}

impl ClientState {
    pub fn new(connection_id: uuid::Uuid) -> Self {
        Self {
            connection_id,
            session_id: None,
            is_connected: false,
            reconnect_attempt: 0,
            reconnect_count: 0,
            last_frame_time: None,
            total_frames: 0,
            events_dispatched: 0,
            events_dropped: 0,
            last_error: None,
            started_at: Instant::now(),
            last_disconnection_time: None,
        }
    }

    /// Marks the transport as open; the attempt counter restarts for the next outage.
    pub fn mark_connected(&mut self, session_id: String) {
        self.session_id = Some(session_id);
        self.is_connected = true;
        self.reconnect_attempt = 0;
        self.last_frame_time = Some(Utc::now());
    }

    /// Counts the next attempt within the current outage, or returns `None`
    /// once `policy` has run out. An abandoned attempt is not counted.
    pub fn begin_reconnect(&mut self, policy: &ReconnectConfig) -> Option<u32> {
        let attempt = self.reconnect_attempt + 1;
        if policy.exhausted(attempt) {
            return None;
        }
        self.reconnect_attempt = attempt;
        self.reconnect_count += 1;
        Some(attempt)
    }

    pub fn record_frame(&mut self) {
        self.last_frame_time = Some(Utc::now());
        self.total_frames += 1;
    }

    pub fn record_dispatch(&mut self) {
        self.events_dispatched += 1;
    }

    pub fn record_drop(&mut self) {
        self.events_dropped += 1;
    }

    pub fn disconnect(&mut self, reason: Option<String>) {
        self.is_connected = false;
        self.session_id = None;
        self.last_disconnection_time = Some(Instant::now());
        if reason.is_some() {
            self.last_error = reason;
        }
    }

    pub fn health(&self, job_id: &str) -> ChannelHealth {
        ChannelHealth {
            job_id: job_id.to_string(),
            is_connected: self.is_connected,
            last_frame_time: self.last_frame_time,
            total_frames: self.total_frames,
            events_dispatched: self.events_dispatched,
            events_dropped: self.events_dropped,
            reconnect_count: self.reconnect_count,
            uptime: chrono::Duration::from_std(self.started_at.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }
}

pub type SharedClientState = Arc<Mutex<ClientState>>;
