//! Output formatting utilities

use chrono::{TimeZone, Utc};
use clap::ValueEnum;
use colored::Colorize;
use factory_lib::MachineState;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or the raw statuses as JSON
pub fn print_rows<R: Tabled, S: Serialize>(rows: Vec<R>, raw: &[S], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No replies".yellow());
                return;
            }
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => match serde_json::to_string_pretty(raw) {
            Ok(json) => println!("{}", json),
            Err(e) => print_error(&format!("Failed to encode replies: {}", e)),
        },
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format kilobytes as human-readable string
pub fn format_kb(kb: u64) -> String {
    const MB: u64 = 1024;
    const GB: u64 = MB * 1024;

    if kb >= GB {
        format!("{:.1}Gi", kb as f64 / GB as f64)
    } else if kb >= MB {
        format!("{:.1}Mi", kb as f64 / MB as f64)
    } else {
        format!("{}Ki", kb)
    }
}

/// UTC time of a UNIX timestamp, `-` when absent
pub fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Seconds elapsed since `ts` in the largest sensible unit
pub fn format_age(ts: Option<i64>, now: i64) -> String {
    let Some(ts) = ts else {
        return "-".to_string();
    };
    let secs = (now - ts).max(0);
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn optional(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

/// Color a slot state
pub fn color_state(state: MachineState) -> String {
    let text = state.as_str();
    match state {
        MachineState::Running => text.green().to_string(),
        MachineState::Starting => text.blue().to_string(),
        MachineState::Paused | MachineState::Shutdown => text.yellow().to_string(),
        MachineState::Zombie => text.red().to_string(),
        MachineState::Unknown => text.dimmed().to_string(),
    }
}

/// Color a shutdown message by its code
pub fn color_shutdown(message: Option<&str>) -> String {
    let Some(message) = message else {
        return "-".to_string();
    };
    match message.split_whitespace().next() {
        Some("200") | Some("300") => message.green().to_string(),
        Some(code) if code.starts_with('5') || code.starts_with('6') => {
            message.yellow().to_string()
        }
        _ => message.red().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_kb() {
        assert_eq!(format_kb(512), "512Ki");
        assert_eq!(format_kb(2048), "2.0Mi");
        assert_eq!(format_kb(16 * 1024 * 1024), "16.0Gi");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(None, 100), "-");
        assert_eq!(format_age(Some(100), 130), "30s");
        assert_eq!(format_age(Some(0), 7200), "2h");
        assert_eq!(format_age(Some(0), 3 * 86400 + 5), "3d");
        // A clock slightly behind a peer is not a negative age
        assert_eq!(format_age(Some(200), 100), "0s");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(Some(0)), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(None), "-");
    }
}
