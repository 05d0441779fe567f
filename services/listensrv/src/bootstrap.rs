//! Service Bootstrap
//!
//! Command-line arguments and logging setup for listensrv

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use voltage_listener::{Framing, ListenerConfig};

/// Command-line arguments for listensrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "listensrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Listener-mode Modbus master - waits for the slave to dial in and polls it",
    long_about = None
)]
pub struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(short = 'c', long, env = "LISTENER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host, overrides the config file
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port, overrides the config file
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Wire framing: tagged (MBAP) or encapsulated (RTU over TCP)
    #[arg(long, value_parser = parse_framing)]
    pub framing: Option<Framing>,

    /// Slave id to poll
    #[arg(long, default_value_t = 1)]
    pub slave_id: u8,

    /// First holding register to read
    #[arg(long, default_value_t = 0)]
    pub start: u16,

    /// Number of holding registers to read
    #[arg(long, default_value_t = 10)]
    pub count: u16,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Drive the accepted socket from the runtime's event poll instead of a
    /// reader thread
    #[arg(long)]
    pub event_poll: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// Directory for daily rolling log files; console only when unset
    #[arg(long, env = "VOLTAGE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

fn parse_framing(value: &str) -> std::result::Result<Framing, String> {
    match value.to_ascii_lowercase().as_str() {
        "tagged" | "mbap" | "xa" => Ok(Framing::Tagged),
        "encapsulated" | "encap" | "rtu" => Ok(Framing::Encapsulated),
        other => Err(format!("unknown framing '{}'", other)),
    }
}

impl Args {
    /// Config from file and environment, with command-line overrides on top
    pub fn listener_config(&self) -> Result<ListenerConfig> {
        let mut config = ListenerConfig::load(self.config.as_deref())
            .context("Failed to load listener configuration")?;

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }

        config.validate().context("Invalid listener configuration")?;
        Ok(config)
    }
}

/// Initialize logging: console always, daily rolling file when `log_dir` is
/// set. `RUST_LOG` takes precedence over `level`.
///
/// Keep the returned guard alive for the life of the process.
pub fn init_logging(level: &str, log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},voltage_listener={}", level, level)))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let console_layer = fmt::layer().with_ansi(true).with_target(false).boxed();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "listensrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
