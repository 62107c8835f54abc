//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Color a health, verdict or level string
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "ready" | "fired" => status.green().to_string(),
        "degraded" | "warning" | "skipped" => status.yellow().to_string(),
        "unhealthy" | "not ready" | "critical" => status.red().to_string(),
        "passed" => status.dimmed().to_string(),
        _ => status.to_string(),
    }
}

/// Render action seconds, blank when idle
pub fn format_secs(secs: u32) -> String {
    if secs == 0 {
        "-".to_string()
    } else {
        format!("{secs}s")
    }
}

/// Seconds since epoch as a UTC timestamp
pub fn format_timestamp(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| epoch_secs.to_string())
}
