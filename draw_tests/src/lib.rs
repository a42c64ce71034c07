// Test-only agency client for end-to-end draw tests.
//
// Wraps a plain `TcpStream` with the protocol crate's codec and framing to
// give tests a synchronous API shaped like a real agency: send bet batches,
// announce no more bets, ask for winners. Every call blocks on the server's
// reply with a read timeout, so a hung server fails the test instead of
// hanging it.
//
// Also provides `start_test_server`, which runs a real `lottery_server` on a
// free localhost port with an in-memory store.
//
// See also: `tests/full_draw.rs` for the scenarios.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use lottery_protocol::{AgencyId, Bet, codec, read_message, write_message};
use lottery_server::WinPredicate;
use lottery_server::server::{ServerConfig, ServerHandle, start_server};
use lottery_server::store::MemoryBetStore;

/// Default timeout for blocking reads.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test waits before concluding that no reply is coming.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(200);

/// Start a server on `127.0.0.1` with an in-memory store.
pub fn start_test_server(
    agencies: usize,
    predicate: Arc<dyn WinPredicate>,
) -> (ServerHandle, SocketAddr) {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        number_of_agencies: NonZeroUsize::new(agencies).expect("at least one agency"),
        ..ServerConfig::default()
    };
    let started = start_server(&config, Arc::new(MemoryBetStore::new()), predicate)
        .expect("start_server failed");
    thread::sleep(Duration::from_millis(50));
    started
}

/// A test agency connected to the server.
pub struct TestAgency {
    pub agency: AgencyId,
    stream: TcpStream,
}

impl TestAgency {
    pub fn connect(addr: SocketAddr, agency: u32) -> Self {
        let stream = TcpStream::connect(addr).expect("TestAgency::connect failed");
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .expect("set_read_timeout failed");
        stream.set_nodelay(true).expect("set_nodelay failed");
        Self {
            agency: AgencyId(agency),
            stream,
        }
    }

    /// A bet from this agency with fixed personal data.
    pub fn bet(&self, document: &str, number: u32) -> Bet {
        Bet::new(
            self.agency,
            "Juan",
            "Perez",
            document,
            NaiveDate::from_ymd_opt(1999, 3, 17).expect("valid date"),
            number,
        )
    }

    /// Send a raw message without waiting for a reply.
    pub fn send_raw(&mut self, raw: &str) {
        write_message(&mut self.stream, raw).expect("write_message failed");
    }

    /// Send a raw message one byte per write, pausing between writes.
    pub fn send_byte_by_byte(&mut self, raw: &str) {
        for byte in raw.as_bytes() {
            self.stream
                .write_all(std::slice::from_ref(byte))
                .expect("write failed");
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn recv_raw(&mut self) -> io::Result<String> {
        read_message(&mut self.stream)
    }

    /// Decode an `ACK` reply and return its payload.
    pub fn recv_ack(&mut self) -> String {
        let raw = self.recv_raw().expect("no ACK received");
        codec::decode_ack(&raw).unwrap_or_else(|e| panic!("expected ACK, got {raw:?}: {e}"))
    }

    /// Send a batch and return the `ACK` payload (the stored count, or `0`).
    pub fn send_batch(&mut self, bets: &[Bet]) -> String {
        self.send_raw(&codec::encode_bet_batch(bets));
        self.recv_ack()
    }

    pub fn no_more_bets(&mut self) -> String {
        self.send_raw(&codec::encode_no_more_bets(self.agency));
        self.recv_ack()
    }

    /// Send `ASK` without waiting; pair with `recv_winners`.
    pub fn send_ask(&mut self) {
        self.send_raw(&codec::encode_ask_for_winners(self.agency));
    }

    pub fn recv_winners(&mut self) -> Vec<String> {
        let raw = self.recv_raw().expect("no WIN received");
        codec::decode_winners(&raw).unwrap_or_else(|e| panic!("expected WIN, got {raw:?}: {e}"))
    }

    pub fn ask_for_winners(&mut self) -> Vec<String> {
        self.send_ask();
        self.recv_winners()
    }

    /// Assert the server sends nothing within `SILENCE_WINDOW`.
    pub fn assert_silent(&mut self) {
        self.stream
            .set_read_timeout(Some(SILENCE_WINDOW))
            .expect("set_read_timeout failed");
        match self.recv_raw() {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            other => panic!("expected no reply, got {other:?}"),
        }
        self.stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .expect("set_read_timeout failed");
    }

    /// Assert the server closed the connection without sending anything.
    pub fn assert_closed(&mut self) {
        match self.recv_raw() {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            other => panic!("expected connection close, got {other:?}"),
        }
    }
}
