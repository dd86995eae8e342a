use crate::error::SyncError;
use anyhow::Result;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock};
use tracing::{error, info};

// Global metrics
pub static FRAMES_RECEIVED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("lesson_sync_frames_received_total"));
pub static EVENTS_DISPATCHED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("lesson_sync_events_dispatched_total"));
pub static EVENTS_DROPPED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("lesson_sync_events_dropped_total"));
pub static LISTENER_PANICS_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("lesson_sync_listener_panics_total"));
pub static RECONNECT_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("lesson_sync_reconnects_total"));
pub static TRANSITIONS_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("lesson_sync_status_transitions_total"));
pub static CONNECTED_GAUGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge!("lesson_sync_active_connections"));

pub async fn setup_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "lesson-sync")
        .add_global_label("version", env!("CARGO_PKG_VERSION"));

    match builder.install() {
        Ok(_) => {
            info!(
                "Prometheus metrics server started on http://{}/metrics",
                addr
            );

            FRAMES_RECEIVED_COUNTER.absolute(0);
            EVENTS_DISPATCHED_COUNTER.absolute(0);
            EVENTS_DROPPED_COUNTER.absolute(0);
            LISTENER_PANICS_COUNTER.absolute(0);
            RECONNECT_COUNTER.absolute(0);
            TRANSITIONS_COUNTER.absolute(0);
            CONNECTED_GAUGE.set(0.0);

            Ok(())
        }
        Err(e) => {
            error!("Failed to start metrics server: {}", e);
            Err(SyncError::MetricsError(e.to_string()).into())
        }
    }
}

/// Point-in-time health of one job's connection.
#[derive(Debug)]
pub struct ChannelHealth {
    pub job_id: String,
    pub is_connected: bool,
    pub last_frame_time: Option<chrono::DateTime<chrono::Utc>>,
    pub total_frames: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub reconnect_count: u32,
    pub uptime: chrono::Duration,
}

impl ChannelHealth {
    pub fn is_healthy(&self) -> bool {
        self.is_connected
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "job_id": self.job_id,
            "status": if self.is_healthy() { "healthy" } else { "unhealthy" },
            "last_frame_time": self.last_frame_time,
            "total_frames": self.total_frames,
            "events_dispatched": self.events_dispatched,
            "events_dropped": self.events_dropped,
            "reconnect_count": self.reconnect_count,
            "uptime_seconds": self.uptime.num_seconds(),
            "timestamp": chrono::Utc::now()
        })
    }
}
