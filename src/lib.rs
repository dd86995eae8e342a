#![doc = include_str!("../docs/rustdoc.md")]

/// HTTP client for the lesson-plan service REST API.
pub mod api;
/// Per-job notification channels and listener fan-out.
pub mod channel;
/// Command-line argument definitions.
pub mod cli;
/// Shared connection state and integrity counters.
pub mod client_state;
/// Runtime configuration model.
pub mod config;
/// Error types used across the crate.
pub mod error;
/// Connection lifecycle notifications.
pub mod events;
/// Terminal output formatters.
pub mod formatter;
/// Metrics and health status structures.
pub mod monitoring;
/// Engine.IO / Socket.IO framing.
pub mod protocol;
/// Job status state machine driven by channel events.
pub mod reconciler;
/// Reconnection backoff policy.
pub mod reconnect;
/// Ordered, identity-keyed listener registry.
pub mod registry;
/// Tracing/logging initialization.
pub mod tracing_setup;
/// WebSocket transport behind the connector seam.
pub mod transport;
/// Job model and typed channel events.
pub mod types;
/// Status display and presentation loop.
pub mod ui;

/// Primary crate error type.
pub use error::SyncError;

pub use channel::ChannelManager;
pub use reconciler::JobStatusReconciler;
