use std::{path::PathBuf, process::ExitCode};

use clap::{error::ErrorKind, Parser};
use koruza_control::{cli, config::Config, logging, server};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// Where the daemon's log files go.
const LOG_DIR: &str = "/var/log/koruza-control";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return ExitCode::SUCCESS;
    }

    if !cli.daemon {
        eprintln!("ERROR: This build only provides the broker daemon, pass -d to run it!");
        return ExitCode::from(1);
    }

    let Some(config_path) = cli.config else {
        eprintln!("ERROR: A configuration file is required (-c <path>)!");
        return ExitCode::from(1);
    };

    logging::init(cli.foreground, Some(PathBuf::from(LOG_DIR))).await;

    let config = match Config::new_from_path(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::from(2);
        }
    };

    let socket = config.socket.clone();

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            eprintln!("ERROR: Could not install signal handler: {e}");
            return ExitCode::from(2);
        }
    };

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            ExitCode::SUCCESS
        }
        _ = hangup.recv() => {
            info!("Told to hang up, quitting");
            ExitCode::SUCCESS
        }
        result = server::run(config) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server stopped: {e}");
                eprintln!("ERROR: {e}");
                ExitCode::from(2)
            }
        },
    };

    // The socket file is recreated on startup; leave no stale one behind.
    let _ = std::fs::remove_file(&socket);

    code
}
