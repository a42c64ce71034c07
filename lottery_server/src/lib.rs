// lottery_server: bet collection and draw server for lottery agencies.
//
// Agencies connect over TCP, send their bets in batches, announce that they
// are done, and finally ask for the winners of their own agency. The draw
// happens only once every configured agency has asked; until then each asking
// session blocks.
//
// Module overview:
// - `server.rs`:  Listener, accept loop, per-connection threads, shutdown.
// - `session.rs`: One agency connection: read a message, act on it, reply.
// - `draw.rs`:    `DrawCoordinator` (one-shot barrier over all agencies) and
//                 the `WinPredicate` used to pick winning bets.
// - `store.rs`:   `BetStore` trait with in-memory and JSON-lines backends.
// - `config.rs`:  clap CLI with environment-variable fallbacks.
// - `logging.rs`: tracing subscriber setup for the binary.
//
// The wire format lives in the `lottery_protocol` crate.

pub mod config;
pub mod draw;
pub mod logging;
pub mod server;
pub mod session;
pub mod store;

pub use config::StorageConfig;
pub use draw::{DrawCoordinator, RendezvousError, WinPredicate, WinningNumber};
pub use server::{ServerConfig, ServerHandle, ShutdownToken, start_server};
pub use session::{AgencySession, DrawContext, SessionError, SessionState};
pub use store::{BetStore, FileBetStore, MemoryBetStore, StorageError};
