//! Command implementations.
//!
//! Commands are grouped by concern: discovery, device control, and storage.

pub(crate) mod device;
pub(crate) mod discover;
pub(crate) mod files;

use crate::{CliError, use_fancy_output, was_interrupted};
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

/// Fail with `Cancelled` once Ctrl+C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// A 0-100 progress bar on stderr, hidden in quiet or non-TTY mode.
pub(crate) fn progress_bar(quiet: bool, message: &str) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style.progress_chars("#>-"));
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb
}

/// Progress bar position for a percentage.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn percent_position(percent: f32) -> u64 {
    percent
        .clamp(0.0, 100.0)
        .round() as u64
}

/// Human-readable byte count, e.g. `1.5 MB`.
pub(crate) fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for &next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(4 * 1024 * 1024), "4.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_percent_position() {
        assert_eq!(percent_position(0.0), 0);
        assert_eq!(percent_position(49.6), 50);
        assert_eq!(percent_position(100.0), 100);
        assert_eq!(percent_position(140.0), 100);
        assert_eq!(percent_position(-3.0), 0);
    }
}
