// CLI entry point for the lottery server.
//
// Parses configuration (flags or environment, see `config.rs`), opens the bet
// store, starts the listener, and blocks until SIGTERM/SIGINT or a listener
// failure. See `server.rs` for the networking architecture.
//
// Usage:
//   server [OPTIONS]
//     --port <PORT>              Listen port (default: 12345)
//     --listen-backlog <N>       Socket backlog (default: 5)
//     --agencies <N>             Agencies in the draw (default: 5)
//     --logging-level <LEVEL>    trace|debug|info|warn|error (default: info)
//     --bets-file <PATH>         Bet store file (default: bets.jsonl)
//     --in-memory                Keep bets in memory only
//     --winning-number <N>       Winning number (default: 7574)

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use lottery_server::config::Cli;
use lottery_server::logging::init_logging;
use lottery_server::server::{ServerHandle, start_server};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.logging_level);

    let storage = cli.storage();
    let store = match storage.open() {
        Ok(store) => store,
        Err(e) => {
            error!(action = "open_store", result = "fail", ?storage, error = %e);
            return ExitCode::FAILURE;
        }
    };
    let predicate = Arc::new(cli.predicate());
    let config = cli.into_server_config();

    let (handle, addr) = match start_server(&config, store, predicate) {
        Ok(started) => started,
        Err(e) => {
            error!(action = "start_server", result = "fail", error = %e);
            return ExitCode::FAILURE;
        }
    };
    info!(action = "listen", result = "success", %addr);

    if let Err(e) = register_signals(&handle) {
        error!(action = "register_signals", result = "fail", error = %e);
        if let Err(e) = handle.stop() {
            error!(action = "shutdown", result = "fail", error = %e);
        }
        return ExitCode::FAILURE;
    }

    match handle.wait() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(action = "accept_connections", result = "fail", error = %e);
            ExitCode::FAILURE
        }
    }
}

/// Cancel the server's shutdown token on SIGTERM or SIGINT.
#[cfg(unix)]
fn register_signals(handle: &ServerHandle) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    let flag = handle.shutdown_token().flag();
    signal_hook::flag::register(SIGTERM, Arc::clone(&flag))?;
    signal_hook::flag::register(SIGINT, flag)?;
    Ok(())
}

#[cfg(not(unix))]
fn register_signals(_handle: &ServerHandle) -> std::io::Result<()> {
    Ok(())
}
