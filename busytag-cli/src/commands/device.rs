//! Display and device control commands.

use anyhow::{Context, Result};
use busytag::LedMask;
use console::style;
use log::debug;
use std::thread;
use std::time::{Duration, Instant};

use super::{ensure_not_interrupted, format_size};
use crate::config::Config;
use crate::presets::{find_pattern, parse_color, pattern_catalog, scale};
use crate::{Cli, CliError, Engine, connect};

/// Reconnect attempts after a restart.
const RECONNECT_ATTEMPTS: u32 = 5;

/// Pause before each reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, engine: &Engine, json: bool) -> Result<()> {
    let conn = connect(cli, config, engine)?;
    let brightness = conn
        .get_brightness()
        .context("Failed to read brightness")?;
    let storage = conn
        .get_storage()
        .context("Failed to read storage size")?;
    let current = conn
        .get_current_image()
        .context("Failed to read current image")?;

    if json {
        let info = serde_json::json!({
            "port": conn.port,
            "identity": conn.identity,
            "brightness": brightness,
            "storage": storage,
            "current_image": current,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let identity = &conn.identity;
    eprintln!("\n{}", style("Device").bold().underlined());
    eprintln!("  Port:         {}", conn.port);
    eprintln!("  Name:         {}", style(&identity.name).cyan().bold());
    eprintln!("  Manufacturer: {}", identity.manufacturer);
    eprintln!("  Device ID:    {}", identity.id);
    eprintln!("  Firmware:     {}", identity.firmware_version);
    eprintln!("  Brightness:   {brightness}%");
    if let (Some(total), Some(free)) = (storage.total, storage.free) {
        eprintln!(
            "  Storage:      {} free of {}",
            format_size(free),
            format_size(total)
        );
    }
    eprintln!(
        "  Showing:      {}",
        current.as_deref().unwrap_or("(nothing)")
    );
    Ok(())
}

/// Color command implementation.
pub(crate) fn cmd_color(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    color: &str,
    brightness: u8,
    leds: u8,
) -> Result<()> {
    let rgb = parse_color(color).map_err(CliError::Usage)?;
    let rgb = scale(rgb, brightness);
    let mask = LedMask::new(leds)?;

    let conn = connect(cli, config, engine)?;
    conn.set_color(rgb, mask)
        .context("Failed to set color")?;
    if !cli.quiet {
        eprintln!("{} Color set to {rgb}", style("✓").green());
    }
    Ok(())
}

/// Brightness command implementation.
pub(crate) fn cmd_brightness(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    level: Option<u8>,
) -> Result<()> {
    let conn = connect(cli, config, engine)?;
    match level {
        Some(level) => {
            conn.set_brightness(level)
                .context("Failed to set brightness")?;
            if !cli.quiet {
                eprintln!("{} Brightness set to {level}%", style("✓").green());
            }
        },
        None => {
            let level = conn
                .get_brightness()
                .context("Failed to read brightness")?;
            println!("{level}");
        },
    }
    Ok(())
}

/// Pattern --list implementation.
pub(crate) fn cmd_pattern_list(config: &Config) {
    for pattern in pattern_catalog(config) {
        println!("{:<16} {} steps", pattern.name, pattern.steps.len());
    }
}

/// Pattern command implementation.
pub(crate) fn cmd_pattern(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    name: &str,
    looping: bool,
    priority: bool,
) -> Result<()> {
    let pattern = find_pattern(config, name).ok_or_else(|| {
        CliError::Usage(format!(
            "Unknown pattern '{name}'. Run 'busytag pattern --list' to see available patterns"
        ))
    })?;
    let steps = pattern
        .to_steps()
        .map_err(|e| CliError::Config(format!("Pattern '{}' is invalid: {e}", pattern.name)))?;

    let conn = connect(cli, config, engine)?;
    conn.set_pattern(&steps, looping, priority)
        .with_context(|| format!("Failed to set pattern '{}'", pattern.name))?;
    if !cli.quiet {
        eprintln!(
            "{} Playing pattern '{}'",
            style("✓").green(),
            style(&pattern.name).cyan()
        );
    }
    Ok(())
}

/// Show command implementation.
pub(crate) fn cmd_show(cli: &Cli, config: &Config, engine: &Engine, name: &str) -> Result<()> {
    let conn = connect(cli, config, engine)?;
    conn.show_picture(name)
        .with_context(|| format!("Failed to show '{name}'"))?;
    if !cli.quiet {
        eprintln!("{} Showing {}", style("✓").green(), style(name).cyan());
    }
    Ok(())
}

/// Format command implementation.
pub(crate) fn cmd_format(cli: &Cli, config: &Config, engine: &Engine, force: bool) -> Result<()> {
    if !force {
        return Err(CliError::Usage(
            "Formatting erases ALL files on the device. Pass --force to confirm".to_string(),
        )
        .into());
    }

    let conn = connect(cli, config, engine)?;
    if !cli.quiet {
        eprintln!("{} Formatting device storage...", style("⏳").yellow());
    }
    conn.format_disk()
        .context("Format failed")?;
    if !cli.quiet {
        eprintln!("{} Format completed", style("✓").green());
    }
    Ok(())
}

/// Sleep for `delay`, waking early on Ctrl+C.
fn interruptible_sleep(delay: Duration) -> Result<()> {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        ensure_not_interrupted()?;
        thread::sleep(Duration::from_millis(100));
    }
    ensure_not_interrupted()
}

/// Restart command implementation.
pub(crate) fn cmd_restart(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    reconnect: bool,
) -> Result<()> {
    let conn = connect(cli, config, engine)?;
    conn.restart()
        .context("Failed to restart device")?;
    conn.disconnect();
    if !cli.quiet {
        eprintln!("{} Restart command sent", style("✓").green());
    }
    if !reconnect {
        return Ok(());
    }

    for attempt in 1..=RECONNECT_ATTEMPTS {
        interruptible_sleep(RECONNECT_DELAY)?;
        if !cli.quiet {
            eprintln!(
                "{} Reconnecting to {} (attempt {attempt}/{RECONNECT_ATTEMPTS})...",
                style("⏳").yellow(),
                conn.port
            );
        }
        match conn.connect(&conn.port) {
            Ok(identity) => {
                if !cli.quiet {
                    eprintln!(
                        "{} {} is back, firmware {}",
                        style("✓").green(),
                        style(&identity.name).cyan(),
                        identity.firmware_version
                    );
                }
                return Ok(());
            },
            Err(e) => debug!("Reconnect attempt {attempt} failed: {e}"),
        }
    }

    Err(CliError::DeviceNotFound(format!(
        "Device did not come back on {} after {RECONNECT_ATTEMPTS} attempts",
        conn.port
    ))
    .into())
}
