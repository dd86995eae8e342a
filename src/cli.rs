use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "lesson-sync",
    about = "follow lesson-plan generation jobs in real time over the notification channel",
    version
)]
pub struct Args {
    /// Job (lesson plan) ID to follow; repeat to follow several jobs
    #[arg(short, long)]
    pub lesson_id: Vec<String>,

    /// Notification server URL
    #[arg(short, long, default_value = "ws://localhost:8000")]
    pub url: String,

    /// Socket.IO endpoint path
    #[arg(long, default_value = "/socket.io/")]
    pub path: String,

    /// HTTP API root used to seed each job's current status (e.g. http://localhost:8000)
    #[arg(long, env = "LESSON_SYNC_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for the HTTP API
    #[arg(long, env = "LESSON_SYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Status assumed for every job when no API URL is given
    #[arg(long, default_value = "queued")]
    pub initial_status: String,

    /// Progress assumed for every job when no API URL is given
    #[arg(long, default_value = "0")]
    pub initial_progress: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,

    /// Connection and handshake timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Re-establish dropped connections with exponential backoff
    #[arg(long)]
    pub auto_reconnect: bool,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    pub reconnect_delay: u64,

    /// Upper bound for the reconnection delay in seconds
    #[arg(long, default_value = "30")]
    pub max_reconnect_delay: u64,

    /// Maximum number of reconnection attempts (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_reconnects: u32,

    /// Output format: table, json, minimal
    #[arg(long, default_value = "table")]
    pub format: String,

    /// Disable colored output (useful for piping to files)
    #[arg(long)]
    pub no_color: bool,

    /// Quiet mode - only status transitions, no connection chatter
    #[arg(long)]
    pub quiet: bool,

    /// Print discussion updates between the generating agents
    #[arg(long)]
    pub show_discussion: bool,
}
