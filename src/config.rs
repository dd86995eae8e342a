/// file: src/config.rs
/// description: configuration for the notification channel, the HTTP collaborator and the CLI display
use crate::cli::Args;
use crate::formatter::OutputFormat;
use crate::protocol::{DEFAULT_PATH, endpoint_url};
use crate::reconnect::ReconnectConfig;
use crate::types::{JobId, JobStatus};
use anyhow::{Result, bail};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub channel: ChannelConfig,
    pub api: ApiConfig,
    pub jobs: JobsConfig,
    pub metrics: MetricsConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL of the notification server (`ws`, `wss`, `http` or `https`).
    pub url: Url,
    pub path: String,
    /// Applies to each connection attempt and to the Socket.IO handshake.
    pub timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            path: DEFAULT_PATH.to_string(),
            timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn endpoint_for(&self, job_id: &JobId) -> crate::error::SyncResult<Url> {
        endpoint_url(&self.url, &self.path, job_id)
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Service root; requests go to `<base_url>/api/v1/...`.
    pub base_url: Option<Url>,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub job_ids: Vec<JobId>,
    /// Used when the HTTP API is not configured.
    pub initial_status: JobStatus,
    pub initial_progress: i64,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub format: OutputFormat,
    pub colored: bool,
    pub quiet: bool,
    pub show_discussion: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.lesson_id.is_empty() {
            bail!("at least one --lesson-id is required");
        }

        let mut channel = ChannelConfig::new(Url::parse(&args.url)?);
        channel.path = args.path.clone();
        channel.timeout = Duration::from_secs(args.timeout);
        channel.reconnect = ReconnectConfig {
            enabled: args.auto_reconnect,
            initial_delay: Duration::from_secs(args.reconnect_delay),
            max_delay: Duration::from_secs(args.max_reconnect_delay),
            max_attempts: args.max_reconnects,
            ..ReconnectConfig::default()
        };
        // Fail on an unusable scheme here rather than on the first connect.
        channel.endpoint_for(&JobId::from("probe"))?;

        let api_url = args.api_url.as_deref().map(Url::parse).transpose()?;

        Ok(Config {
            channel,
            api: ApiConfig {
                base_url: api_url,
                token: args.token.clone(),
                timeout: Duration::from_secs(args.timeout),
            },
            jobs: JobsConfig {
                job_ids: args.lesson_id.iter().map(|id| JobId::from(id.as_str())).collect(),
                initial_status: args.initial_status.parse()?,
                initial_progress: args.initial_progress,
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
            display: DisplayConfig {
                format: OutputFormat::from(args.format.as_str()),
                colored: !args.no_color,
                quiet: args.quiet,
                show_discussion: args.show_discussion,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(extra: &[&str]) -> Result<Config> {
        let mut argv = vec!["lesson-sync"];
        argv.extend_from_slice(extra);
        Config::from_args(&Args::parse_from(argv))
    }

    #[test]
    fn defaults_follow_base_contract() {
        let config = parse(&["--lesson-id", "abc"]).unwrap();
        assert!(!config.channel.reconnect.enabled);
        assert_eq!(config.channel.path, "/socket.io/");
        assert_eq!(config.jobs.job_ids, vec![JobId::from("abc")]);
        assert_eq!(config.jobs.initial_status, JobStatus::Queued);
        assert!(config.api.base_url.is_none());
    }

    #[test]
    fn reconnect_flags_map_onto_policy() {
        let config = parse(&[
            "--lesson-id",
            "abc",
            "--lesson-id",
            "def",
            "--auto-reconnect",
            "--reconnect-delay",
            "2",
            "--max-reconnect-delay",
            "20",
            "--max-reconnects",
            "5",
        ])
        .unwrap();
        let reconnect = &config.channel.reconnect;
        assert!(reconnect.enabled);
        assert_eq!(reconnect.initial_delay, Duration::from_secs(2));
        assert_eq!(reconnect.max_delay, Duration::from_secs(20));
        assert_eq!(reconnect.max_attempts, 5);
        assert_eq!(config.jobs.job_ids.len(), 2);
    }

    #[test]
    fn rejects_missing_job_and_bad_inputs() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--lesson-id", "a", "--url", "ftp://example.com"]).is_err());
        assert!(parse(&["--lesson-id", "a", "--initial-status", "paused"]).is_err());
    }
}
