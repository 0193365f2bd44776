// Output formatting and display for CLI

use crate::ipc::protocol::{LogSection, NameOutcome, ReloadReport, ResponseData};
use crate::process::{InstanceHandle, InstanceStatus, ProcessStatus, ReloadAction, StopOutcome};
use chrono::{DateTime, Local};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a daemon response to stdout; per-name failures go to stderr
pub fn print_response(data: &ResponseData) {
    match data {
        ResponseData::Started(outcomes) => {
            for outcome in outcomes {
                print_outcome(outcome, |handles| {
                    let pids: Vec<String> = handles.iter().map(|h| h.pid.to_string()).collect();
                    format!("{} started (pid {})", outcome.name.cyan(), pids.join(", "))
                });
            }
        }

        ResponseData::Stopped(outcomes) => {
            for outcome in outcomes {
                print_outcome(outcome, |stopped| describe_stop(&outcome.name, *stopped));
            }
        }

        ResponseData::Restarted(handles) => print_handles("restarted", handles),

        ResponseData::Status(statuses) => {
            if statuses.is_empty() {
                println!("{}", "No processes are managed".yellow());
            } else if statuses.len() == 1 {
                print_detailed_status(&statuses[0]);
            } else {
                print_status_table(statuses);
            }
        }

        ResponseData::Reloaded(reports) => print_reload(reports),

        ResponseData::Deleted(outcome) => {
            print_success_msg(&format!("Deleted ({})", stop_label(*outcome)));
        }

        ResponseData::Logs(sections) => print_logs(sections),

        ResponseData::Pong {
            pid,
            uptime,
            version,
        } => {
            println!("{}", "✓ Daemon is running".green().bold());
            println!("  {}: {}", "PID".bold(), pid);
            println!("  {}: {}", "Uptime".bold(), format_duration(uptime));
            println!("  {}: {}", "Version".bold(), version);
        }
    }
}

fn print_outcome<T>(outcome: &NameOutcome<T>, describe: impl FnOnce(&T) -> String) {
    match &outcome.result {
        Ok(value) => print_success_msg(&describe(value)),
        Err(error) => print_error(&error.message),
    }
}

fn print_handles(verb: &str, handles: &[InstanceHandle]) {
    for handle in handles {
        print_success_msg(&format!(
            "{}[{}] {} (pid {})",
            handle.name.cyan(),
            handle.index,
            verb,
            handle.pid
        ));
    }
}

fn describe_stop(name: &str, outcome: StopOutcome) -> String {
    format!("{} {}", name.cyan(), stop_label(outcome))
}

fn stop_label(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::Graceful => "stopped",
        StopOutcome::Killed => "killed after the grace period",
        StopOutcome::AlreadyStopped => "was not running",
    }
}

fn print_reload(reports: &[ReloadReport]) {
    let mut changed = 0;
    for report in reports {
        if let Some(error) = &report.error {
            print_error(&error.message);
            continue;
        }
        let verb = match report.action {
            ReloadAction::Unchanged => continue,
            ReloadAction::Started => "started",
            ReloadAction::Restarted => "restarted",
            ReloadAction::Removed => "removed",
        };
        changed += 1;
        print_success_msg(&format!("{} {}", report.name.cyan(), verb));
    }
    if changed == 0 {
        print_info("Nothing to reload");
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

fn print_status_table(statuses: &[InstanceStatus]) {
    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: usize,
        #[tabled(rename = "Profile")]
        profile: String,
    }

    let rows: Vec<StatusRow> = statuses
        .iter()
        .map(|s| StatusRow {
            name: truncate(&s.name, 20),
            index: s.index,
            status: format_status_colored(s.status),
            pid: s
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            memory: format_memory_usage(s.memory, s.memory_limit),
            uptime: if s.status.is_live() {
                format_duration(&s.uptime)
            } else {
                "-".to_string()
            },
            restarts: s.restarts,
            profile: s.profile.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} instance(s)", statuses.len())
            .dimmed()
            .italic()
    );
}

fn print_detailed_status(status: &InstanceStatus) {
    println!("\n{}", "Process Details".bold().underline());
    println!();
    println!("  {:<15} {}[{}]", "Name:".bold(), status.name.cyan(), status.index);
    println!(
        "  {:<15} {}",
        "Status:".bold(),
        format_status_colored(status.status)
    );

    if let Some(pid) = status.pid {
        println!("  {:<15} {}", "PID:".bold(), pid);
    }
    if let Some(started_at) = status.started_at {
        let datetime: DateTime<Local> = started_at.into();
        println!(
            "  {:<15} {}",
            "Started:".bold(),
            datetime.format("%Y-%m-%d %H:%M:%S")
        );
        println!("  {:<15} {}", "Uptime:".bold(), format_duration(&status.uptime));
    }

    println!(
        "  {:<15} {}",
        "Memory:".bold(),
        format_memory_usage(status.memory, status.memory_limit)
    );
    println!("  {:<15} {}", "Restarts:".bold(), status.restarts);
    if let Some(exit) = status.last_exit {
        println!("  {:<15} {}", "Last exit:".bold(), exit);
    }
    println!("  {:<15} {}", "Directory:".bold(), status.cwd.display());
    println!("  {:<15} {}", "Mode:".bold(), status.exec_mode);
    println!(
        "  {:<15} {}",
        "Profile:".bold(),
        status.profile.as_deref().unwrap_or("-")
    );
    if status.log_warnings > 0 {
        println!(
            "  {:<15} {}",
            "Log warnings:".bold(),
            status.log_warnings.to_string().yellow()
        );
    }

    println!();
}

fn print_logs(sections: &[LogSection]) {
    for section in sections {
        println!("\n{}", section.path.display().to_string().bold().underline());
        if section.lines.is_empty() {
            println!("{}", "(empty)".dimmed());
        }
        for line in &section.lines {
            println!("{}", line);
        }
    }
    println!();
}

fn format_status_colored(status: ProcessStatus) -> String {
    let text = status.to_string();
    match status {
        ProcessStatus::Running => text.green().to_string(),
        ProcessStatus::Starting | ProcessStatus::Stopping | ProcessStatus::RestartPending => {
            text.yellow().to_string()
        }
        ProcessStatus::Stopped | ProcessStatus::ExitedClean => text.bright_black().to_string(),
        ProcessStatus::ExitedError | ProcessStatus::Killed => text.red().to_string(),
        ProcessStatus::Errored => text.red().bold().to_string(),
    }
}

/// Two most significant units: `45s`, `3m 10s`, `2h 5m`, `4d 1h`
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();
    let units = [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")];

    let Some(pos) = units.iter().position(|(size, _)| secs >= *size) else {
        return "0s".to_string();
    };
    let (major, major_unit) = units[pos];
    let mut text = format!("{}{}", secs / major, major_unit);
    if let Some((minor, minor_unit)) = units.get(pos + 1) {
        let rest = (secs % major) / minor;
        if rest > 0 {
            text.push_str(&format!(" {}{}", rest, minor_unit));
        }
    }
    text
}

fn format_memory(bytes: u64) -> String {
    const UNITS: [(u64, &str, usize); 3] = [(1 << 30, "GB", 2), (1 << 20, "MB", 1), (1 << 10, "KB", 1)];

    UNITS
        .iter()
        .find(|(size, _, _)| bytes >= *size)
        .map(|(size, unit, precision)| {
            format!("{:.*}{}", precision, bytes as f64 / *size as f64, unit)
        })
        .unwrap_or_else(|| format!("{}B", bytes))
}

/// Sampled memory, with the ceiling when one is set
fn format_memory_usage(memory: Option<u64>, limit: Option<u64>) -> String {
    match (memory, limit) {
        (Some(used), Some(limit)) => format!("{} / {}", format_memory(used), format_memory(limit)),
        (Some(used), None) => format_memory(used),
        (None, _) => "-".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// Spinner shown while the daemon works on a request
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
        assert_eq!(format_duration(&Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(&Duration::ZERO), "0s");
    }

    #[test]
    fn test_format_memory_usage() {
        assert_eq!(format_memory_usage(None, Some(1024)), "-");
        assert_eq!(format_memory_usage(Some(512), None), "512B");
        assert_eq!(
            format_memory_usage(Some(2 * 1024 * 1024), Some(1024 * 1024 * 1024)),
            "2.0MB / 1.00GB"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("medusa-backend-worker-1", 10), "medusa-...");
    }

    #[test]
    fn test_stop_labels() {
        assert_eq!(describe_stop("api", StopOutcome::AlreadyStopped), format!("{} was not running", "api".cyan()));
        assert_eq!(stop_label(StopOutcome::Killed), "killed after the grace period");
    }
}
