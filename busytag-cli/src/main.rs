//! busytag CLI - Command-line tool for BusyTag USB LED badges.
//!
//! ## Features
//!
//! - Discover attached devices and watch for plug/unplug
//! - Set solid colors, brightness and LED patterns
//! - Upload, download, list, show and delete files in device storage
//! - Firmware update, storage format and restart with reconnect
//! - TOML configuration and environment variable support

use anyhow::{Context, Result};
use busytag::{
    DeviceIdentity, DeviceSession, DiscoveryConfig, DiscoveryManager, SessionConfig,
    TransferConfig,
};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;
mod presets;

use commands::{device, discover, files};
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl+C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// busytag - Control BusyTag USB LED badges from the command line.
///
/// Environment variables:
///   BUSYTAG_PORT        - Default serial port
///   BUSYTAG_BAUD        - Baud rate (default: 115200)
///   BUSYTAG_TIMEOUT_MS  - Per-command timeout in milliseconds
#[derive(Parser)]
#[command(name = "busytag")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    busytag list\n  \
    busytag -p /dev/ttyACM0 color red --brightness 50\n  \
    busytag upload coffee.gif --show\n  \
    busytag restart --reconnect")]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BUSYTAG_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "BUSYTAG_BAUD")]
    baud: Option<u32>,

    /// Per-command timeout in milliseconds.
    #[arg(long = "timeout", global = true, env = "BUSYTAG_TIMEOUT_MS", value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Scan serial ports for BusyTag devices.
    #[command(visible_alias = "scan")]
    List {
        /// Output the device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Keep scanning and print the device list whenever it changes.
    Watch {
        /// Scan interval in milliseconds.
        #[arg(long, value_name = "MS")]
        interval: Option<u64>,

        /// Print each change as a JSON array.
        #[arg(long)]
        json: bool,
    },

    /// Show device identity, brightness, storage and current image.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Set a solid color.
    Color {
        /// Color name, RRGGBB hex, or r,g,b.
        color: String,

        /// Scale the color to this percentage (0-100).
        #[arg(long, default_value = "100", value_parser = clap::value_parser!(u8).range(0..=100))]
        brightness: u8,

        /// LED zone mask (1-127).
        #[arg(long, default_value = "127", value_parser = clap::value_parser!(u8).range(1..=127))]
        leds: u8,
    },

    /// Get or set display brightness.
    #[command(visible_alias = "bright")]
    Brightness {
        /// New brightness (0-100); prints the current level when omitted.
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: Option<u8>,
    },

    /// Play an LED pattern from the catalog.
    Pattern {
        /// Pattern name (see --list).
        #[arg(required_unless_present = "list")]
        name: Option<String>,

        /// List available patterns.
        #[arg(long)]
        list: bool,

        /// Play the pattern once instead of looping.
        #[arg(long)]
        once: bool,

        /// Interrupt whatever the device is showing.
        #[arg(long)]
        priority: bool,
    },

    /// List files in device storage.
    #[command(visible_alias = "ls")]
    Files {
        /// Output the file list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Display a stored file.
    #[command(visible_alias = "display")]
    Show {
        /// File name on the device.
        name: String,
    },

    /// Upload a file to device storage.
    Upload {
        /// Local file to upload.
        path: PathBuf,

        /// Name on the device (defaults to the local file name).
        #[arg(long)]
        name: Option<String>,

        /// Display the file after uploading.
        #[arg(long)]
        show: bool,
    },

    /// Download a file from device storage.
    Download {
        /// File name on the device.
        name: String,

        /// Local destination (file or directory).
        dest: PathBuf,
    },

    /// Delete a file from device storage.
    #[command(visible_alias = "remove")]
    Delete {
        /// File name on the device.
        name: String,
    },

    /// Show storage usage.
    #[command(visible_alias = "space")]
    Storage {
        /// Output storage figures as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Upload a firmware image and let the device flash it.
    Firmware {
        /// Firmware image (.bin).
        path: PathBuf,

        /// Wait and show the device's flashing progress.
        #[arg(long)]
        wait: bool,
    },

    /// Erase all files from device storage.
    Format {
        /// Confirm erasing all data.
        #[arg(long)]
        force: bool,
    },

    /// Restart the device.
    #[command(visible_alias = "reboot")]
    Restart {
        /// Wait for the device to come back and reconnect.
        #[arg(long)]
        reconnect: bool,
    },
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration.
    #[error("{0}")]
    Config(String),
    /// No device to talk to.
    #[error("{0}")]
    DeviceNotFound(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotFound(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<busytag::Error>() {
        Some(busytag::Error::InvalidArgument(_)) => 2,
        Some(busytag::Error::PortUnavailable { .. }) => 4,
        Some(busytag::Error::TransferAborted(_)) => 130,
        _ => 1,
    }
}

/// The engine objects shared by all commands.
pub(crate) struct Engine {
    pub(crate) session: Arc<DeviceSession>,
    pub(crate) discovery: Arc<DiscoveryManager>,
}

impl Engine {
    fn new(cli: &Cli, config: &Config) -> Self {
        Self {
            session: Arc::new(DeviceSession::native(session_config(cli, config))),
            discovery: Arc::new(DiscoveryManager::native(discovery_config(cli, config))),
        }
    }

    /// Cancel transfers and stop discovery on Ctrl+C.
    fn install_interrupt_handler(&self) {
        let session = Arc::clone(&self.session);
        let discovery = Arc::clone(&self.discovery);
        let result = ctrlc::set_handler(move || {
            INTERRUPTED.store(true, Ordering::SeqCst);
            session.cancel_transfer();
            discovery.stop_periodic_search();
        });
        if let Err(e) = result {
            debug!("Could not install Ctrl+C handler: {e}");
        }
    }
}

/// Build session settings from CLI arguments and config.
fn session_config(cli: &Cli, config: &Config) -> SessionConfig {
    let mut session = SessionConfig::default();
    if let Some(baud) = cli
        .baud
        .or(config.connection.baud)
    {
        session.baud_rate = baud;
    }
    if let Some(ms) = cli
        .timeout_ms
        .or(config.connection.timeout_ms)
    {
        session = session.with_command_timeout(Duration::from_millis(ms));
    }

    let mut transfer = TransferConfig::default();
    if let Some(size) = config.transfer.chunk_size {
        transfer = transfer.with_chunk_size(size);
    }
    if let Some(ms) = config.transfer.chunk_timeout_ms {
        transfer = transfer.with_chunk_timeout(Duration::from_millis(ms));
    }
    session.with_transfer(transfer)
}

/// Build discovery settings from CLI arguments and config.
fn discovery_config(cli: &Cli, config: &Config) -> DiscoveryConfig {
    let mut discovery = DiscoveryConfig::default();
    if let Some(baud) = cli
        .baud
        .or(config.connection.baud)
    {
        discovery.baud_rate = baud;
    }
    if let Some(prefix) = &config.discovery.device_prefix {
        discovery
            .device_prefix
            .clone_from(prefix);
    }
    if let Some(ms) = config.discovery.probe_timeout_ms {
        discovery.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = config.discovery.quiet_interval_secs {
        discovery.quiet_interval = Duration::from_secs(secs);
    }
    discovery
}

/// An open session that disconnects when dropped.
pub(crate) struct Connection<'a> {
    session: &'a DeviceSession,
    /// Port the session is connected to.
    pub(crate) port: String,
    /// Identity from the handshake.
    pub(crate) identity: DeviceIdentity,
}

impl Deref for Connection<'_> {
    type Target = DeviceSession;

    fn deref(&self) -> &DeviceSession {
        self.session
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        self.session
            .disconnect();
    }
}

/// Pick the port: `--port`/`BUSYTAG_PORT`, then the config file, then a scan.
pub(crate) fn get_port(cli: &Cli, config: &Config, engine: &Engine) -> Result<String> {
    if let Some(port) = cli
        .port
        .clone()
        .or_else(|| {
            config
                .connection
                .port
                .clone()
        })
    {
        return Ok(port);
    }

    debug!("No port given, scanning for devices");
    let found = engine
        .discovery
        .scan_once()
        .context("Failed to scan serial ports")?;
    match found.as_slice() {
        [] => Err(CliError::DeviceNotFound(
            "No BusyTag device found. Is it plugged in?".to_string(),
        )
        .into()),
        [port] => Ok(port.clone()),
        many => Err(CliError::Usage(format!(
            "Found multiple devices ({}). Choose one with --port",
            many.join(", ")
        ))
        .into()),
    }
}

/// Resolve the port and open a session on it.
pub(crate) fn connect<'a>(cli: &Cli, config: &Config, engine: &'a Engine) -> Result<Connection<'a>> {
    let port = get_port(cli, config, engine)?;
    debug!("Connecting to {port}");
    let identity = engine
        .session
        .connect(&port)
        .with_context(|| format!("Failed to connect to {port}"))?;
    if !cli.quiet {
        eprintln!(
            "{} Connected to {} on {}",
            style("✓").green(),
            style(&identity.name).cyan(),
            port
        );
    }
    Ok(Connection {
        session: &engine.session,
        port,
        identity,
    })
}

fn main() {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "busytag v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let engine = Engine::new(cli, &config);
    engine.install_interrupt_handler();

    match &cli.command {
        Commands::List { json } => {
            discover::cmd_list(cli, &engine, *json)?;
        },
        Commands::Watch { interval, json } => {
            discover::cmd_watch(cli, &config, &engine, *interval, *json)?;
        },
        Commands::Info { json } => {
            device::cmd_info(cli, &config, &engine, *json)?;
        },
        Commands::Color {
            color,
            brightness,
            leds,
        } => {
            device::cmd_color(cli, &config, &engine, color, *brightness, *leds)?;
        },
        Commands::Brightness { level } => {
            device::cmd_brightness(cli, &config, &engine, *level)?;
        },
        Commands::Pattern {
            name,
            list,
            once,
            priority,
        } => {
            if *list {
                device::cmd_pattern_list(&config);
            } else if let Some(name) = name {
                device::cmd_pattern(cli, &config, &engine, name, !*once, *priority)?;
            }
        },
        Commands::Files { json } => {
            files::cmd_files(cli, &config, &engine, *json)?;
        },
        Commands::Show { name } => {
            device::cmd_show(cli, &config, &engine, name)?;
        },
        Commands::Upload { path, name, show } => {
            files::cmd_upload(cli, &config, &engine, path, name.as_deref(), *show)?;
        },
        Commands::Download { name, dest } => {
            files::cmd_download(cli, &config, &engine, name, dest)?;
        },
        Commands::Delete { name } => {
            files::cmd_delete(cli, &config, &engine, name)?;
        },
        Commands::Storage { json } => {
            files::cmd_storage(cli, &config, &engine, *json)?;
        },
        Commands::Firmware { path, wait } => {
            files::cmd_firmware(cli, &config, &engine, path, *wait)?;
        },
        Commands::Format { force } => {
            device::cmd_format(cli, &config, &engine, *force)?;
        },
        Commands::Restart { reconnect } => {
            device::cmd_restart(cli, &config, &engine, *reconnect)?;
        },
    }

    Ok(())
}
