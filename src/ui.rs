/// file: src/ui.rs
/// description: terminal presentation of job snapshots and connection lifecycle
use crate::{
    config::DisplayConfig,
    events::{LifecycleEvent, LifecycleReceiver},
    formatter::{Colors, SnapshotFormatter},
    types::{JobId, JobSnapshot},
};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::debug;

/// What the reconcilers and listeners push to the display.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    Snapshot(JobSnapshot),
    Discussion {
        job_id: JobId,
        content: serde_json::Value,
    },
}

pub type DisplaySender = mpsc::UnboundedSender<DisplayEvent>;

pub struct StatusDisplay {
    lifecycle: LifecycleReceiver,
    updates: mpsc::UnboundedReceiver<DisplayEvent>,
    formatter: SnapshotFormatter,
    quiet_mode: bool,
    colored: bool,
    watched: Vec<JobId>,
    latest: BTreeMap<JobId, JobSnapshot>,
    // jobs whose connection task gave up
    closed: HashSet<JobId>,
    started: Instant,
}

impl StatusDisplay {
    pub fn new(
        lifecycle: LifecycleReceiver,
        options: &DisplayConfig,
        watched: Vec<JobId>,
    ) -> (Self, DisplaySender) {
        let (tx, updates) = mpsc::unbounded_channel();
        let display = Self {
            lifecycle,
            updates,
            formatter: SnapshotFormatter::new(options.format.clone(), options.colored, options.quiet),
            quiet_mode: options.quiet,
            colored: options.colored,
            watched,
            latest: BTreeMap::new(),
            closed: HashSet::new(),
            started: Instant::now(),
        };
        (display, tx)
    }

    /// Every watched job is terminal or can no longer receive updates.
    pub fn finished(&self) -> bool {
        self.watched.iter().all(|job_id| {
            self.closed.contains(job_id)
                || self
                    .latest
                    .get(job_id)
                    .is_some_and(|snapshot| snapshot.status.is_terminal())
        })
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.latest.values().cloned().collect()
    }

    /// Renders until [`finished`](Self::finished) holds or every sender is dropped.
    pub async fn run(&mut self) -> Vec<JobSnapshot> {
        self.print_startup_banner();
        self.formatter.print_header();

        let mut lifecycle_open = true;
        while !self.finished() {
            tokio::select! {
                update = self.updates.recv() => match update {
                    Some(event) => self.handle_update(event),
                    None => break,
                },
                event = self.lifecycle.recv(), if lifecycle_open => match event {
                    Ok(event) => self.handle_lifecycle(event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Display lagged behind lifecycle events");
                    }
                    Err(RecvError::Closed) => lifecycle_open = false,
                },
            }
        }

        self.print_summary();
        self.snapshots()
    }

    pub fn print_summary(&self) {
        self.formatter
            .print_summary(&self.snapshots(), self.started.elapsed().as_secs());
    }

    fn handle_update(&mut self, event: DisplayEvent) {
        match event {
            DisplayEvent::Snapshot(snapshot) => {
                self.formatter.print_snapshot(&snapshot);
                self.latest.insert(snapshot.job_id.clone(), snapshot);
            }
            DisplayEvent::Discussion { job_id, content } => {
                self.formatter.print_discussion(&job_id, &content);
            }
        }
    }

    fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connecting { job_id, url } => {
                self.print_connection_status("CONNECTING", &format!("{job_id} via {url}"));
            }
            LifecycleEvent::Connected {
                job_id,
                connection_id,
            } => {
                self.print_connection_status("CONNECTED", &format!("{job_id} (ID: {connection_id})"));
            }
            LifecycleEvent::Disconnected { job_id, reason } => {
                self.print_connection_status("DISCONNECTED", &format!("{job_id}: {reason}"));
            }
            LifecycleEvent::Reconnecting {
                job_id,
                attempt,
                delay,
            } => {
                self.print_reconnect_info(&job_id, delay, attempt);
            }
            LifecycleEvent::ConnectionFailed { job_id, error } => {
                self.print_error("CONNECTION FAILED", &format!("{job_id}: {error}"));
            }
            LifecycleEvent::Closed { job_id } => {
                self.print_connection_status("CLOSED", job_id.as_str());
                self.closed.insert(job_id);
            }
        }
    }

    fn paint(&self, color: &'static str) -> (&'static str, &'static str, &'static str) {
        if self.colored {
            (Colors::BOLD, color, Colors::RESET)
        } else {
            ("", "", "")
        }
    }

    fn print_startup_banner(&self) {
        if self.quiet_mode {
            return;
        }
        let (bold, cyan, reset) = self.paint(Colors::BRIGHT_CYAN);
        let (_, green, _) = self.paint(Colors::BRIGHT_GREEN);
        let (_, yellow, _) = self.paint(Colors::BRIGHT_YELLOW);

        println!();
        println!(
            "{bold}{cyan}╔══════════════════════════════════════════════════════════════════════════════╗{reset}"
        );
        println!(
            "{bold}{cyan}║                       LESSON PLAN GENERATION STATUS                          ║{reset}"
        );
        println!(
            "{bold}{cyan}╠══════════════════════════════════════════════════════════════════════════════╣{reset}"
        );
        println!(
            "{bold}{cyan}║{reset} Version: {green}{:<8}{reset} │ Jobs: {yellow}{:<4}{reset}{:<46}{bold}{cyan}║{reset}",
            env!("CARGO_PKG_VERSION"),
            self.watched.len(),
            ""
        );
        println!(
            "{bold}{cyan}╚══════════════════════════════════════════════════════════════════════════════╝{reset}"
        );
        println!();
    }

    fn print_connection_status(&self, status: &str, message: &str) {
        if self.quiet_mode {
            return;
        }

        let (color, symbol) = match status {
            "CONNECTING" => (Colors::BRIGHT_YELLOW, "*"),
            "CONNECTED" => (Colors::BRIGHT_GREEN, "+"),
            "DISCONNECTED" => (Colors::BRIGHT_RED, "X"),
            "CLOSED" => (Colors::BRIGHT_MAGENTA, "!"),
            _ => (Colors::WHITE, "-"),
        };
        let (bold, color, reset) = self.paint(color);

        println!("{bold}{color}[{status}]{reset} {symbol} {message}");
    }

    fn print_error(&self, error_type: &str, message: &str) {
        let (bold, color, reset) = self.paint(Colors::BRIGHT_RED);
        let (_, red, _) = self.paint(Colors::RED);
        println!("{bold}{color}[{error_type}]{reset} ! {red}{message}{reset}");
    }

    fn print_reconnect_info(&self, job_id: &JobId, delay: Duration, attempt: u32) {
        if self.quiet_mode {
            return;
        }
        let (bold, color, reset) = self.paint(Colors::BRIGHT_YELLOW);
        println!(
            "{bold}{color}[RECONNECTING]{reset} > {job_id}: attempt {attempt} in {:.1}s...",
            delay.as_secs_f64()
        );
    }
}
