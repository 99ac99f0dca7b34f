//! Entry point for the orchestrator agent daemon.

use orchestrator_agent::cli::Cli;
use orchestrator_agent::config::AgentConfig;
use orchestrator_agent::defaults::{AGENT_CONFIG_PATH, AGENT_VERSION};
use orchestrator_agent::event::channel::pub_sub;
use orchestrator_agent::identity::install_rustls_default_crypto_provider;
use orchestrator_agent::logging;
use orchestrator_agent::orchestrator::runner::create_shutdown_signal_handler;
use orchestrator_agent::orchestrator::OrchestratorRunner;
use std::error::Error;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

fn main() -> ExitCode {
    let cli = Cli::init();

    let config = match AgentConfig::load(Path::new(AGENT_CONFIG_PATH)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let guards = match logging::init(cli.log_level, &config.log_dir, &config.debug_log_dir) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match _main(config, guards) {
        Err(e) => {
            error!("The orchestrator agent exited with an error: {e}");
            ExitCode::FAILURE
        }
        Ok(()) => {
            info!("The orchestrator agent exited successfully");
            ExitCode::SUCCESS
        }
    }
}

/// Separated from [main] so errors are logged exactly once, in string form,
/// instead of being printed again by the runtime on return.
fn _main(config: AgentConfig, _guards: Vec<WorkerGuard>) -> Result<(), Box<dyn Error>> {
    info!(version = AGENT_VERSION, "starting orchestrator agent");
    install_rustls_default_crypto_provider();

    let (application_event_publisher, application_event_consumer) = pub_sub();
    create_shutdown_signal_handler(application_event_publisher)?;

    OrchestratorRunner::new(config, application_event_consumer).run()?;

    info!("exiting gracefully");
    Ok(())
}
