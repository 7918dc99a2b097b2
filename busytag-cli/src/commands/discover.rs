//! Device discovery commands.

use anyhow::{Context, Result};
use busytag::discovery::DEFAULT_SCAN_INTERVAL;
use console::style;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, Engine, was_interrupted};

fn ports_json(ports: &[String]) -> String {
    let entries: Vec<serde_json::Value> = ports
        .iter()
        .map(|port| serde_json::json!({ "port": port }))
        .collect();
    serde_json::to_string(&entries).unwrap_or_default()
}

/// List command implementation.
pub(crate) fn cmd_list(cli: &Cli, engine: &Engine, json: bool) -> Result<()> {
    let ports = engine
        .discovery
        .scan_once()
        .context("Failed to scan serial ports")?;

    if json {
        println!("{}", ports_json(&ports));
        return Ok(());
    }

    if cli.quiet {
        for port in &ports {
            println!("{port}");
        }
        return Ok(());
    }

    eprintln!("{}", style("BusyTag devices:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No devices found").dim());
    } else {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), style(port).cyan());
        }
    }

    let skipped = engine
        .discovery
        .known_invalid_ports();
    if !skipped.is_empty() {
        eprintln!(
            "  {} skipped other devices on: {}",
            style("ℹ").blue(),
            skipped.join(", ")
        );
    }
    Ok(())
}

/// Watch command implementation: print the device list whenever it changes
/// until Ctrl+C.
pub(crate) fn cmd_watch(
    cli: &Cli,
    config: &Config,
    engine: &Engine,
    interval_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let interval = interval_ms
        .or(config.discovery.scan_interval_ms)
        .map_or(DEFAULT_SCAN_INTERVAL, Duration::from_millis);

    let subscription = engine
        .discovery
        .subscribe(move |ports| {
            if json {
                println!("{}", ports_json(ports));
            } else if ports.is_empty() {
                println!("no devices");
            } else {
                println!("{}", ports.join(" "));
            }
        });

    if !cli.quiet {
        eprintln!(
            "{} Watching for devices every {} ms (Ctrl+C to stop)",
            style("→").green().bold(),
            interval.as_millis()
        );
    }

    engine
        .discovery
        .start_periodic_search(interval)
        .context("Failed to start device search")?;

    while !was_interrupted()
        && engine
            .discovery
            .is_searching()
    {
        thread::sleep(Duration::from_millis(100));
    }

    engine
        .discovery
        .stop_periodic_search();
    engine
        .discovery
        .unsubscribe(subscription);
    Ok(())
}
