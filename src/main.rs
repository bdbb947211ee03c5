use std::{
    process::{self, ExitCode},
    sync::Arc,
};

use hass_bridge::{
    config::Config,
    core::bridge::{termination_signals, Bridge, ShutdownOutcome},
    logger::LoggerManager,
    print_error,
};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::new() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            print_error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let logger_manager = match LoggerManager::new(config.logger.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            print_error!("Failed to setup Log Manager: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger_manager.init() {
        print_error!("Failed to init Log Manager: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting hass-bridge version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.logger.level);
    debug!("{:#?}", config.transport);

    let signals = termination_signals();
    let bridge = match Bridge::connect(config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "Failed to start bridge");
            return ExitCode::FAILURE;
        }
    };

    match bridge.run(signals).await {
        Ok(ShutdownOutcome::Graceful) => ExitCode::SUCCESS,
        Ok(outcome) => {
            // Returning would wait on blocking tasks such as pending DNS lookups.
            error!(?outcome, "Forcing exit");
            process::exit(i32::from(outcome.exit_code()))
        }
        Err(e) => {
            error!(error = %e, "Bridge stopped");
            ExitCode::FAILURE
        }
    }
}
