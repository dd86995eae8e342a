use crate::types::{JobId, JobSnapshot, JobStatus};

// ANSI color codes
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";

    // Colors
    pub const RED: &'static str = "\x1b[31m";
    pub const GREEN: &'static str = "\x1b[32m";
    pub const YELLOW: &'static str = "\x1b[33m";
    pub const BLUE: &'static str = "\x1b[34m";
    pub const CYAN: &'static str = "\x1b[36m";
    pub const WHITE: &'static str = "\x1b[37m";
    pub const GRAY: &'static str = "\x1b[90m";

    // Bright colors
    pub const BRIGHT_RED: &'static str = "\x1b[91m";
    pub const BRIGHT_GREEN: &'static str = "\x1b[92m";
    pub const BRIGHT_YELLOW: &'static str = "\x1b[93m";
    pub const BRIGHT_BLUE: &'static str = "\x1b[94m";
    pub const BRIGHT_MAGENTA: &'static str = "\x1b[95m";
    pub const BRIGHT_CYAN: &'static str = "\x1b[96m";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Minimal,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "minimal" => OutputFormat::Minimal,
            _ => OutputFormat::Table,
        }
    }
}

const BAR_WIDTH: usize = 24;

/// Renders `progress` (0..=100) as a fixed-width bar.
pub fn progress_bar(progress: u8, width: usize) -> String {
    let filled = (usize::from(progress.min(100)) * width + 50) / 100;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

pub struct SnapshotFormatter {
    format: OutputFormat,
    colored: bool,
    quiet: bool,
    update_count: u64,
}

impl SnapshotFormatter {
    pub fn new(format: OutputFormat, colored: bool, quiet: bool) -> Self {
        Self {
            format,
            colored,
            quiet,
            update_count: 0,
        }
    }

    pub fn print_header(&self) {
        if self.quiet || self.format != OutputFormat::Table {
            return;
        }
        let (gray, reset) = self.paint(Colors::GRAY);
        println!(
            "{gray}┌─────────────────────────────────────┬────────────┬──────────────────────────────┐{reset}"
        );
        println!(
            "{gray}│{reset} {:<35} {gray}│{reset} {:<10} {gray}│{reset} {:<28} {gray}│{reset}",
            "JOB", "STATUS", "PROGRESS"
        );
        println!(
            "{gray}├─────────────────────────────────────┼────────────┼──────────────────────────────┤{reset}"
        );
    }

    pub fn print_snapshot(&mut self, snapshot: &JobSnapshot) {
        self.update_count += 1;
        println!("{}", self.format_snapshot(snapshot));
    }

    pub fn format_snapshot(&self, snapshot: &JobSnapshot) -> String {
        match self.format {
            OutputFormat::Table => self.table_row(snapshot),
            OutputFormat::Json => self.json_row(snapshot),
            OutputFormat::Minimal => self.minimal_row(snapshot),
        }
    }

    fn status_color(&self, status: JobStatus) -> &'static str {
        if !self.colored {
            return "";
        }
        match status {
            JobStatus::Draft => Colors::GRAY,
            JobStatus::Queued => Colors::BRIGHT_YELLOW,
            JobStatus::Processing => Colors::BRIGHT_BLUE,
            JobStatus::Completed => Colors::BRIGHT_GREEN,
            JobStatus::Failed => Colors::BRIGHT_RED,
        }
    }

    fn paint(&self, color: &'static str) -> (&'static str, &'static str) {
        if self.colored {
            (color, Colors::RESET)
        } else {
            ("", "")
        }
    }

    fn table_row(&self, snapshot: &JobSnapshot) -> String {
        let (gray, reset) = self.paint(Colors::GRAY);
        let color = self.status_color(snapshot.status);
        let progress = if snapshot.status.shows_progress() || snapshot.status.is_terminal() {
            format!("{} {:>3}%", progress_bar(snapshot.progress, BAR_WIDTH - 2), snapshot.progress)
        } else {
            String::new()
        };
        let mut row = format!(
            "{gray}│{reset} {:<35} {gray}│{reset} {color}{:<10}{reset} {gray}│{reset} {:<28} {gray}│{reset}",
            truncate(snapshot.job_id.as_str(), 35),
            snapshot.status.as_str().to_uppercase(),
            progress,
        );
        if let Some(error) = &snapshot.error {
            let (red, reset) = self.paint(Colors::RED);
            row.push_str(&format!("\n{gray}│{reset}   {red}{error}{reset}"));
        }
        row
    }

    fn json_row(&self, snapshot: &JobSnapshot) -> String {
        let json_obj = serde_json::json!({
            "update": self.update_count,
            "job_id": snapshot.job_id,
            "status": snapshot.status,
            "progress": snapshot.progress,
            "error": snapshot.error,
            "local_time": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        });
        serde_json::to_string(&json_obj).unwrap_or_default()
    }

    fn minimal_row(&self, snapshot: &JobSnapshot) -> String {
        let color = self.status_color(snapshot.status);
        let reset = if self.colored { Colors::RESET } else { "" };
        let mut row = format!(
            "{} {} {}{}{} {}%",
            chrono::Local::now().format("%H:%M:%S"),
            snapshot.job_id,
            color,
            snapshot.status,
            reset,
            snapshot.progress
        );
        if let Some(error) = &snapshot.error {
            row.push_str(&format!(" ({error})"));
        }
        row
    }

    pub fn print_discussion(&self, job_id: &JobId, content: &serde_json::Value) {
        if self.format == OutputFormat::Json {
            let json_obj = serde_json::json!({ "job_id": job_id, "discussion": content });
            println!("{}", serde_json::to_string(&json_obj).unwrap_or_default());
            return;
        }
        let (dim, reset) = self.paint(Colors::DIM);
        let text = match content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!("{dim}  [{job_id}] {text}{reset}");
    }

    pub fn print_summary(&self, snapshots: &[JobSnapshot], duration_secs: u64) {
        if self.quiet || self.format == OutputFormat::Json {
            return;
        }
        let completed = snapshots
            .iter()
            .filter(|s| s.status == JobStatus::Completed)
            .count();
        let failed = snapshots
            .iter()
            .filter(|s| s.status == JobStatus::Failed)
            .count();

        println!();
        let (cyan, reset) = self.paint(Colors::BRIGHT_CYAN);
        let bold = if self.colored { Colors::BOLD } else { "" };
        println!(
            "{bold}{cyan}Summary: {} jobs, {} completed, {} failed, {} updates in {}s{reset}",
            snapshots.len(),
            completed,
            failed,
            self.update_count,
            duration_secs
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: JobStatus, progress: u8) -> JobSnapshot {
        JobSnapshot {
            job_id: JobId::from("abc"),
            status,
            progress,
            error: None,
        }
    }

    #[test]
    fn output_format_defaults_to_table() {
        assert_eq!(OutputFormat::from("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from("minimal"), OutputFormat::Minimal);
        assert_eq!(OutputFormat::from("csv"), OutputFormat::Table);
    }

    #[test]
    fn progress_bar_fills_proportionally() {
        assert_eq!(progress_bar(0, 10), "░".repeat(10));
        assert_eq!(progress_bar(100, 10), "█".repeat(10));
        assert_eq!(progress_bar(50, 10), format!("{}{}", "█".repeat(5), "░".repeat(5)));
        assert_eq!(progress_bar(250, 4), "█".repeat(4));
    }

    #[test]
    fn json_row_is_machine_readable() {
        let formatter = SnapshotFormatter::new(OutputFormat::Json, false, false);
        let mut failed = snapshot(JobStatus::Failed, 35);
        failed.error = Some("timeout".into());
        let value: serde_json::Value =
            serde_json::from_str(&formatter.format_snapshot(&failed)).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["progress"], 35);
        assert_eq!(value["error"], "timeout");
    }

    #[test]
    fn plain_rows_carry_no_ansi() {
        let formatter = SnapshotFormatter::new(OutputFormat::Minimal, false, false);
        let row = formatter.format_snapshot(&snapshot(JobStatus::Processing, 40));
        assert!(!row.contains('\x1b'));
        assert!(row.ends_with("abc processing 40%"));

        let table = SnapshotFormatter::new(OutputFormat::Table, false, false);
        let row = table.format_snapshot(&snapshot(JobStatus::Completed, 100));
        assert!(row.contains("COMPLETED"));
        assert!(row.contains("100%"));
    }

    #[test]
    fn long_ids_are_truncated() {
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
