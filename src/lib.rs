use std::env;
use std::path::PathBuf;
use clap::Parser;
use crate::error::AppRunError;

pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod session;

/// Bridges line-delimited JSON commands on stdin to a BLE adapter and
/// relays device events to stdout.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct Options {
    /// Path to the config file (defaults to <exe>.json or the OS config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    pub verbose: bool,

    /// Write the default config to the config file and exit
    #[arg(long)]
    pub write_default_config: bool,
}

pub fn init_logging(verbose: bool) {
    let level = if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        match fern::log_file(&log_file) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(err) => eprintln!("Failed to open LOG_FILE {}: {}", log_file, err),
        }
    }

    if let Err(err) = dispatch.apply() {
        eprintln!("Failed to initialize logger: {}", err);
    }
}

pub fn run(options: Options) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(host::run_bridge(options))
}
