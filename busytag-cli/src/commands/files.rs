//! Storage and file transfer commands.

use anyhow::{Context, Result};
use busytag::{DeviceEvent, DeviceSession, is_firmware_name, validate_file_name};
use console::style;
use log::debug;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::{format_size, percent_position, progress_bar};
use crate::config::Config;
use crate::{Cli, CliError, Engine, connect, was_interrupted};

/// How long `firmware --wait` follows the device's flashing progress.
const FIRMWARE_WAIT: Duration = Duration::from_secs(300);

/// Turn an aborted transfer after Ctrl+C into a cancellation.
fn cancelled_if_interrupted(err: busytag::Error, what: &str) -> anyhow::Error {
    if was_interrupted() && matches!(err, busytag::Error::TransferAborted(_)) {
        CliError::Cancelled(format!("{what} cancelled")).into()
    } else {
        anyhow::Error::new(err).context(format!("{what} failed"))
    }
}

/// Name a local file will have on the device.
fn device_name(path: &Path, name: Option<&str>) -> Result<String> {
    let name = match name {
        Some(name) => name.to_string(),
        None => path
            .file_name()
            .map(|n| {
                n.to_string_lossy()
                    .into_owned()
            })
            .ok_or_else(|| {
                CliError::Usage(format!("'{}' has no file name", path.display()))
            })?,
    };
    validate_file_name(&name)?;
    Ok(name)
}

/// Upload `path` as `name` with a progress bar.
fn upload_file(cli: &Cli, session: &DeviceSession, path: &Path, name: &str) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("Failed to read {}", path.display()))?
        .len();

    if !cli.quiet {
        eprintln!(
            "{} Uploading {} as {} ({})",
            style("📤").cyan(),
            path.display(),
            style(name).cyan(),
            format_size(size)
        );
    }

    let pb = progress_bar(cli.quiet, name);
    let bar = pb.clone();
    let subscription = session.subscribe(move |event| {
        if let DeviceEvent::UploadProgress { percent, .. } = event {
            bar.set_position(percent_position(*percent));
        }
    });

    let result = session.upload(name, BufReader::new(file), size);
    session.unsubscribe(subscription);

    match result {
        Ok(()) => {
            pb.finish_and_clear();
            if !cli.quiet {
                eprintln!("{} Uploaded {}", style("✓").green(), style(name).cyan());
            }
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            Err(cancelled_if_interrupted(e, "Upload"))
        },
    }
}

/// Files command implementation.
pub(crate) fn cmd_files(cli: &Cli, config: &Config, engine: &Engine, json: bool) -> Result<()> {
    let conn = connect(cli, config, engine)?;
    let files = conn
        .list_files()
        .context("Failed to list files")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    if cli.quiet {
        for file in &files {
            println!("{}", file.name);
        }
        return Ok(());
    }

    eprintln!("{}", style("Files on device:").bold().underlined());
    if files.is_empty() {
        eprintln!("  {}", style("No files").dim());
    }
    let current = match conn.get_current_image() {
        Ok(current) => current,
        Err(e) => {
            debug!("Could not read current image: {e}");
            None
        },
    };
    for file in &files {
        let marker = if current.as_deref() == Some(file.name.as_str()) {
            style("▶").green()
        } else {
            style("•").dim()
        };
        eprintln!(
            "  {} {:<40} {:>10}",
            marker,
            file.name,
            format_size(file.size)
        );
    }
    Ok(())
}

/// Upload command implementation.
pub(crate) fn cmd_upload(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    path: &Path,
    name: Option<&str>,
    show: bool,
) -> Result<()> {
    let name = device_name(path, name)?;
    if !path.is_file() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let conn = connect(cli, config, engine)?;
    upload_file(cli, &conn, path, &name)?;

    if show {
        conn.show_picture(&name)
            .with_context(|| format!("Failed to show '{name}'"))?;
        if !cli.quiet {
            eprintln!("{} Showing {}", style("✓").green(), style(&name).cyan());
        }
    }
    Ok(())
}

/// Download command implementation.
pub(crate) fn cmd_download(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    name: &str,
    dest: &Path,
) -> Result<()> {
    validate_file_name(name)?;
    let target: PathBuf = if dest.is_dir() {
        dest.join(name)
    } else {
        dest.to_path_buf()
    };

    let conn = connect(cli, config, engine)?;
    let file =
        File::create(&target).with_context(|| format!("Failed to create {}", target.display()))?;
    let mut sink = BufWriter::new(file);

    let pb = progress_bar(cli.quiet, name);
    let bar = pb.clone();
    let subscription = conn.subscribe(move |event| {
        if let DeviceEvent::DownloadProgress { percent, .. } = event {
            bar.set_position(percent_position(*percent));
        }
    });
    let result = conn.download(name, &mut sink);
    conn.unsubscribe(subscription);

    let written = match result.map_err(|e| cancelled_if_interrupted(e, "Download")) {
        Ok(written) => sink
            .flush()
            .map(|()| written)
            .with_context(|| format!("Failed to write {}", target.display())),
        Err(e) => Err(e),
    };

    match written {
        Ok(written) => {
            pb.finish_and_clear();
            if !cli.quiet {
                eprintln!(
                    "{} Saved {} to {} ({})",
                    style("✓").green(),
                    style(name).cyan(),
                    target.display(),
                    format_size(written)
                );
            }
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            drop(sink);
            if let Err(rm) = fs::remove_file(&target) {
                debug!("Could not remove partial file {}: {rm}", target.display());
            }
            Err(e)
        },
    }
}

/// Delete command implementation.
pub(crate) fn cmd_delete(cli: &Cli, config: &Config, engine: &Engine, name: &str) -> Result<()> {
    validate_file_name(name)?;
    let conn = connect(cli, config, engine)?;
    conn.delete_file(name)
        .with_context(|| format!("Failed to delete '{name}'"))?;
    if !cli.quiet {
        eprintln!("{} Deleted {}", style("✓").green(), style(name).cyan());
    }
    Ok(())
}

/// Storage command implementation.
pub(crate) fn cmd_storage(cli: &Cli, config: &Config, engine: &Engine, json: bool) -> Result<()> {
    let conn = connect(cli, config, engine)?;
    let storage = conn
        .get_storage()
        .context("Failed to read storage size")?;
    let files = conn
        .list_files()
        .context("Failed to list files")?;

    if json {
        let info = serde_json::json!({
            "total": storage.total,
            "free": storage.free,
            "used": storage.used(),
            "files": files.len(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let total = storage
        .total
        .unwrap_or_default();
    let free = storage
        .free
        .unwrap_or_default();
    let used = storage
        .used()
        .unwrap_or_default();
    let usage = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    eprintln!("{}", style("Storage").bold().underlined());
    eprintln!("  Total: {}", format_size(total));
    eprintln!("  Free:  {}", format_size(free));
    eprintln!("  Used:  {}", format_size(used));
    eprintln!("  Usage: {usage:.1}%");
    eprintln!("  Files: {}", files.len());
    Ok(())
}

/// Whether a reported flashing percentage means the update is complete.
fn flashing_finished(percent: f32) -> bool {
    percent >= 100.0
}

/// Follow `FirmwareUpdateProgress` until it reaches 100 % or the device
/// drops off the bus to reboot.
fn wait_for_firmware(cli: &Cli, session: &DeviceSession) -> Result<()> {
    let pb = progress_bar(cli.quiet, "flashing");
    let bar = pb.clone();
    // Raw f32 bits of the last report; the bar position is rounded
    let reported = Arc::new(AtomicU32::new(0f32.to_bits()));
    let latest = Arc::clone(&reported);
    let subscription = session.subscribe(move |event| {
        if let DeviceEvent::FirmwareUpdateProgress(percent) = event {
            latest.store(percent.to_bits(), Ordering::SeqCst);
            bar.set_position(percent_position(*percent));
        }
    });

    let deadline = Instant::now() + FIRMWARE_WAIT;
    let outcome = loop {
        if was_interrupted() {
            break Err(CliError::Cancelled("Stopped waiting for firmware update".into()).into());
        }
        if flashing_finished(f32::from_bits(reported.load(Ordering::SeqCst))) {
            break Ok(());
        }
        if Instant::now() >= deadline {
            break Err(anyhow::anyhow!(
                "Device did not finish the firmware update within {} s",
                FIRMWARE_WAIT.as_secs()
            ));
        }
        if let Err(e) = session.pump_events(Duration::from_millis(500)) {
            if e.is_link_fault() {
                debug!("Link dropped while flashing: {e}");
                break Ok(());
            }
            break Err(anyhow::Error::new(e).context("Lost track of the firmware update"));
        }
    };

    session.unsubscribe(subscription);
    match &outcome {
        Ok(()) => pb.finish_and_clear(),
        Err(_) => pb.abandon(),
    }
    outcome
}

/// Firmware command implementation.
pub(crate) fn cmd_firmware(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    path: &Path,
    wait: bool,
) -> Result<()> {
    let name = device_name(path, None)?;
    if !is_firmware_name(&name) {
        return Err(CliError::Usage("Only .bin files are supported for firmware updates".into()).into());
    }
    if !path.is_file() {
        anyhow::bail!("Firmware file not found: {}", path.display());
    }

    let conn = connect(cli, config, engine)?;
    if !cli.quiet {
        eprintln!(
            "{} Do not unplug the device during a firmware update",
            style("⚠").yellow().bold()
        );
    }
    upload_file(cli, &conn, path, &name)?;
    conn.activate_storage_scan()
        .context("Failed to start the firmware update")?;

    if wait {
        wait_for_firmware(cli, &conn)?;
        if !cli.quiet {
            eprintln!("{} Firmware update finished, device is restarting", style("✓").green());
        }
    } else if !cli.quiet {
        eprintln!(
            "{} Firmware uploaded. The device will apply the update",
            style("✓").green()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_from_path() {
        let name = device_name(Path::new("/tmp/images/coffee.gif"), None).unwrap();
        assert_eq!(name, "coffee.gif");
    }

    #[test]
    fn test_device_name_override() {
        let name = device_name(Path::new("/tmp/a.gif"), Some("b.gif")).unwrap();
        assert_eq!(name, "b.gif");
    }

    #[test]
    fn test_device_name_too_long() {
        let long = format!("{}.gif", "x".repeat(40));
        let err = device_name(Path::new("/tmp/a.gif"), Some(&long)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<busytag::Error>(),
            Some(busytag::Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_device_name_missing() {
        let err = device_name(Path::new("/"), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_flashing_finished_needs_full_hundred() {
        assert!(!flashing_finished(0.0));
        assert!(!flashing_finished(99.5));
        assert!(!flashing_finished(99.99));
        assert!(flashing_finished(100.0));
        // The bar would already show 100 for this report
        assert_eq!(percent_position(99.5), 100);
    }

    #[test]
    fn test_cancelled_only_after_interrupt() {
        let err = cancelled_if_interrupted(busytag::Error::TransferAborted("x".into()), "Upload");
        // No Ctrl+C in tests, so the library error is kept
        assert!(err.downcast_ref::<busytag::Error>().is_some());
    }
}
