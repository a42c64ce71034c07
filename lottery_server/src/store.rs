// Bet storage shared by every agency session.
//
// `BetStore` is the seam between session handling and persistence. The
// server owns one store instance and hands an `Arc<dyn BetStore>` to every
// session thread, so implementations must be `Send + Sync` and safe under
// concurrent `store` calls.
//
// Contract:
// - `store` applies a whole batch atomically: a concurrent `load_all` sees
//   either every bet of the batch or none of them.
// - `load_all` returns bets in the order they were stored and reflects every
//   `store` call that completed before it.
//
// Two implementations:
// - `MemoryBetStore`: a mutex-guarded `Vec`, used by tests and `--in-memory`.
// - `FileBetStore`: an append-only JSON-lines file, one bet per line. The
//   batch is serialized in full before a single `write_all` under the store's
//   mutex, and readers take the same mutex, so a half-written batch is never
//   observed by this process. If the write or flush fails partway, the file
//   is truncated back to its length before the batch.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lottery_protocol::Bet;
use tracing::error;

/// Failure to persist or read back bets.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("bet storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("could not serialize bet: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt bet record on line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
    #[error("bet store lock poisoned by a panicking writer")]
    Poisoned,
}

/// Append-only collection of every accepted bet.
pub trait BetStore: Send + Sync {
    /// Append a batch of bets as one atomic unit.
    fn store(&self, bets: &[Bet]) -> Result<(), StorageError>;

    /// Snapshot of every stored bet, in store order.
    fn load_all(&self) -> Result<Vec<Bet>, StorageError>;
}

/// In-process bet store.
#[derive(Default)]
pub struct MemoryBetStore {
    bets: Mutex<Vec<Bet>>,
}

impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BetStore for MemoryBetStore {
    fn store(&self, bets: &[Bet]) -> Result<(), StorageError> {
        let mut stored = self.bets.lock().map_err(|_| StorageError::Poisoned)?;
        stored.extend_from_slice(bets);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
        let stored = self.bets.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(stored.clone())
    }
}

/// Bet store backed by a JSON-lines file.
pub struct FileBetStore {
    path: PathBuf,
    // Serializes appends against each other and against snapshot reads.
    file: Mutex<File>,
}

impl FileBetStore {
    /// Open (or create) the store file at `path`. Existing records are kept.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BetStore for FileBetStore {
    fn store(&self, bets: &[Bet]) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        for bet in bets {
            serde_json::to_writer(&mut buf, bet)?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().map_err(|_| StorageError::Poisoned)?;
        append_or_rollback(&mut *file, &buf)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
        let _guard = self.file.lock().map_err(|_| StorageError::Poisoned)?;
        let reader = BufReader::new(File::open(&self.path)?);
        let mut bets = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let bet = serde_json::from_str(&line).map_err(|source| StorageError::Corrupt {
                line: index + 1,
                source,
            })?;
            bets.push(bet);
        }
        Ok(bets)
    }
}

/// An append target that can be cut back to an earlier length.
trait Truncate: Write {
    fn current_len(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append `buf` in full, or leave `target` at its previous length.
fn append_or_rollback<T: Truncate>(target: &mut T, buf: &[u8]) -> io::Result<()> {
    let len = target.current_len()?;
    let written = target.write_all(buf).and_then(|()| target.flush());
    if let Err(e) = written {
        if let Err(rollback) = target.truncate_to(len) {
            error!(
                action = "store_bets",
                result = "fail",
                error = %rollback,
                "partial batch left in bet file"
            );
        }
        return Err(e);
    }
    Ok(())
}
