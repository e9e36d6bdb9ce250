use clap::Parser;
use log::{error, info};
use ble_bridge::{init_logging, run, Options};
use ble_bridge::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let options = Options::parse();
    init_logging(options.verbose);
    info!(concat!("BLE bridge ", env!("CARGO_PKG_VERSION")));

    match run(options) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another bridge instance is already running");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
