// Command-line and environment configuration for the server binary.
//
// Every flag can also be set through an environment variable, which is how
// the server is usually configured when it runs in a container. Command-line
// flags win over the environment.
//
// `Cli` splits into the listener settings (`ServerConfig`, consumed by
// `start_server`) and the collaborators the binary builds itself: the bet
// store (`StorageConfig`) and the win predicate.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::draw::{DEFAULT_WINNING_NUMBER, WinningNumber};
use crate::logging;
use crate::server::ServerConfig;
use crate::store::{BetStore, FileBetStore, MemoryBetStore, StorageError};

#[derive(Parser, Debug, Clone)]
#[command(name = "server", about = "Collects agency bets and runs the lottery draw")]
pub struct Cli {
    /// TCP port to listen on (all interfaces).
    #[arg(long, env = "SERVER_PORT", default_value_t = 12345)]
    pub port: u16,

    /// Pending-connection backlog of the listening socket.
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    pub listen_backlog: i32,

    /// Number of agencies that must ask for winners before the draw.
    #[arg(long, env = "NUMBER_OF_AGENCIES", default_value = "5")]
    pub agencies: NonZeroUsize,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    #[arg(long, env = "LOGGING_LEVEL", default_value = "info", value_parser = parse_level)]
    pub logging_level: String,

    /// JSON-lines file the bets are appended to.
    #[arg(long, env = "BETS_FILE", default_value = "bets.jsonl")]
    pub bets_file: PathBuf,

    /// Keep bets in memory; `--bets-file` is ignored.
    #[arg(long)]
    pub in_memory: bool,

    /// Number a bet must have played to win the draw.
    #[arg(long, env = "WINNING_NUMBER", default_value_t = DEFAULT_WINNING_NUMBER)]
    pub winning_number: u32,
}

/// Where bets are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageConfig {
    Memory,
    File(PathBuf),
}

impl StorageConfig {
    /// Open the configured store. A file store keeps any bets already in it.
    pub fn open(&self) -> Result<Arc<dyn BetStore>, StorageError> {
        Ok(match self {
            StorageConfig::Memory => Arc::new(MemoryBetStore::new()),
            StorageConfig::File(path) => Arc::new(FileBetStore::open(path)?),
        })
    }
}

impl Cli {
    pub fn storage(&self) -> StorageConfig {
        if self.in_memory {
            StorageConfig::Memory
        } else {
            StorageConfig::File(self.bets_file.clone())
        }
    }

    pub fn predicate(&self) -> WinningNumber {
        WinningNumber(self.winning_number)
    }

    pub fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            listen_backlog: self.listen_backlog,
            number_of_agencies: self.agencies,
            ..ServerConfig::default()
        }
    }
}

fn parse_level(raw: &str) -> Result<String, String> {
    if logging::is_valid_level(raw) {
        Ok(raw.to_ascii_lowercase())
    } else {
        Err(format!(
            "expected one of {}",
            logging::LOG_LEVELS.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use lottery_protocol::{AgencyId, Bet};

    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("server").chain(args.iter().copied()))
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&[
            "--port",
            "4000",
            "--agencies",
            "3",
            "--logging-level",
            "DEBUG",
            "--bets-file",
            "/tmp/x.jsonl",
            "--winning-number",
            "42",
        ])
        .unwrap();
        assert_eq!(cli.logging_level, "debug");
        assert_eq!(cli.storage(), StorageConfig::File("/tmp/x.jsonl".into()));
        assert_eq!(cli.predicate(), WinningNumber(42));

        let config = cli.into_server_config();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4000);
        assert_eq!(config.number_of_agencies.get(), 3);
    }

    #[test]
    fn in_memory_selects_memory_store() {
        let cli = parse(&["--in-memory", "--agencies", "1"]).unwrap();
        assert_eq!(cli.storage(), StorageConfig::Memory);
    }

    #[test]
    fn zero_agencies_is_rejected() {
        assert!(parse(&["--agencies", "0"]).is_err());
    }

    #[test]
    fn unknown_logging_level_is_rejected() {
        assert!(parse(&["--logging-level", "verbose"]).is_err());
    }

    #[test]
    fn every_flag_has_help_text() {
        use clap::CommandFactory;

        for arg in Cli::command().get_arguments() {
            assert!(arg.get_help().is_some(), "--{} has no help", arg.get_id());
        }
    }

    #[test]
    fn file_storage_opens_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bets.jsonl");
        let bet = Bet::new(
            AgencyId(1),
            "Juan",
            "Perez",
            "30904465",
            NaiveDate::from_ymd_opt(1999, 3, 17).unwrap(),
            7574,
        );

        let store = StorageConfig::File(path.clone()).open().unwrap();
        store.store(std::slice::from_ref(&bet)).unwrap();
        drop(store);

        let reopened = StorageConfig::File(path).open().unwrap();
        assert_eq!(reopened.load_all().unwrap(), vec![bet]);
        assert!(StorageConfig::Memory.open().unwrap().load_all().unwrap().is_empty());
    }
}
