// Per-connection agency session.
//
// One `AgencySession` runs on its own thread for every accepted connection
// and drives a small state machine:
//
//   AwaitMessage --BET--> store batch, ACK[<count>] --> AwaitMessage
//   AwaitMessage --NMB--> ACK[NMB]                  --> AwaitMessage
//   AwaitMessage --ASK--> rendezvous, WIN[...]      --> Finished
//
// Anything else ends the session with an error:
// - A `BET` that fails to decode or to store is answered with `ACK[0]` before
//   the error is returned. Nothing from that batch is stored.
// - Unknown or unexpected tags, and undecodable `NMB`/`ASK`, end the session
//   without a reply.
// - If the draw is aborted while this session waits in `rendezvous`, no `WIN`
//   is sent.
//
// The agency id is taken from each message's payload; it is not bound to the
// connection and is not cross-checked against earlier bets.
//
// Shared state (bet store, coordinator, win predicate) arrives through a
// `DrawContext` built once by the server.

use std::io::{self, Read, Write};
use std::sync::Arc;

use lottery_protocol::codec::{self, DecodeError};
use lottery_protocol::{AgencyId, MessageTag, read_message, write_message};
use tracing::{debug, info, warn};

use crate::draw::{DrawCoordinator, RendezvousError, WinPredicate, winners_for};
use crate::store::{BetStore, StorageError};

/// Ack payload sent when a batch is rejected.
const REJECTED_BATCH_ACK: &str = "0";

/// Why a session ended early.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),
    #[error("unexpected {0} message from agency")]
    UnexpectedMessage(MessageTag),
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Aborted(#[from] RendezvousError),
}

/// Where a session is in its conversation with the agency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitMessage,
    Finished,
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct DrawContext {
    pub store: Arc<dyn BetStore>,
    pub coordinator: Arc<DrawCoordinator>,
    pub predicate: Arc<dyn WinPredicate>,
}

/// State machine for one agency connection.
pub struct AgencySession<S> {
    stream: S,
    context: DrawContext,
    state: SessionState,
}

impl<S: Read + Write> AgencySession<S> {
    pub fn new(stream: S, context: DrawContext) -> Self {
        Self {
            stream,
            context,
            state: SessionState::AwaitMessage,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until the agency has received its winners or an
    /// error ends the session.
    pub fn run(&mut self) -> Result<(), SessionError> {
        while self.state == SessionState::AwaitMessage {
            let raw = read_message(&mut self.stream)?;
            debug!(action = "receive_message", result = "success", msg = %raw);
            self.state = self.handle_message(&raw)?;
        }
        Ok(())
    }

    /// Act on one raw message and return the next state.
    pub fn handle_message(&mut self, raw: &str) -> Result<SessionState, SessionError> {
        let tag = codec::decode_type(raw)?;
        match MessageTag::from_wire(tag) {
            Some(MessageTag::Bet) => self.handle_bet_batch(raw),
            Some(MessageTag::NoMoreBets) => self.handle_no_more_bets(raw),
            Some(MessageTag::AskForWinners) => self.handle_ask_for_winners(raw),
            Some(other) => Err(SessionError::UnexpectedMessage(other)),
            None => Err(DecodeError::UnknownTag(tag.into()).into()),
        }
    }

    fn handle_bet_batch(&mut self, raw: &str) -> Result<SessionState, SessionError> {
        let bets = match codec::decode_bet_batch(raw) {
            Ok(bets) => bets,
            Err(e) => return Err(self.reject_batch(e.into())),
        };
        if let Err(e) = self.context.store.store(&bets) {
            return Err(self.reject_batch(e.into()));
        }

        let count = bets.len();
        info!(action = "receive_bet_batch", result = "success", count);
        self.reply(&codec::encode_ack(&count.to_string()))?;
        Ok(SessionState::AwaitMessage)
    }

    fn handle_no_more_bets(&mut self, raw: &str) -> Result<SessionState, SessionError> {
        let agency = codec::decode_no_more_bets(raw)?;
        info!(action = "no_more_bets", result = "success", %agency);
        self.reply(&codec::encode_ack(MessageTag::NoMoreBets.as_str()))?;
        Ok(SessionState::AwaitMessage)
    }

    fn handle_ask_for_winners(&mut self, raw: &str) -> Result<SessionState, SessionError> {
        let agency = codec::decode_ask_for_winners(raw)?;
        info!(action = "ask_for_winners", result = "in_progress", %agency);

        let ordinal = self.context.coordinator.rendezvous()?;
        if ordinal == 0 {
            info!(action = "draw", result = "success");
        }

        let winners = self.winners(agency)?;
        info!(
            action = "send_winners",
            result = "in_progress",
            %agency,
            count = winners.len()
        );
        self.reply(&codec::encode_winners(&winners))?;
        Ok(SessionState::Finished)
    }

    fn winners(&self, agency: AgencyId) -> Result<Vec<String>, SessionError> {
        let bets = self.context.store.load_all()?;
        Ok(winners_for(agency, &bets, self.context.predicate.as_ref()))
    }

    /// Answer a failed batch with `ACK[0]` and hand back the original error.
    fn reject_batch(&mut self, err: SessionError) -> SessionError {
        warn!(action = "receive_bet_batch", result = "fail", error = %err);
        if let Err(e) = self.reply(&codec::encode_ack(REJECTED_BATCH_ACK)) {
            warn!(action = "send_ack", result = "fail", error = %e);
        }
        err
    }

    fn reply(&mut self, msg: &str) -> io::Result<()> {
        write_message(&mut self.stream, msg)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::num::NonZeroUsize;
    use std::thread::{self, JoinHandle};

    use chrono::NaiveDate;
    use lottery_protocol::Bet;

    use super::*;
    use crate::draw::WinningNumber;
    use crate::store::MemoryBetStore;

    const JUAN: &str = r#"BET[{"agency":"1","first_name":"Juan","last_name":"Perez","document":"30904465","birthdate":"1999-03-17","number":"7573"}]"#;
    const JUAN_AND_ANA: &str = r#"BET[{"agency":"1","first_name":"Juan","last_name":"Perez","document":"30904465","birthdate":"1999-03-17","number":"7573"};{"agency":"1","first_name":"Ana","last_name":"Gomez","document":"11222333","birthdate":"1985-12-01","number":"1"}]"#;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn context(capacity: usize, store: Arc<dyn BetStore>) -> DrawContext {
        DrawContext {
            store,
            coordinator: Arc::new(DrawCoordinator::new(NonZeroUsize::new(capacity).unwrap())),
            predicate: Arc::new(WinningNumber(7573)),
        }
    }

    /// Run a session over the server half of a fresh TCP pair on a thread.
    fn spawn_session(context: DrawContext) -> (TcpStream, JoinHandle<Result<(), SessionError>>) {
        let (client, server) = tcp_pair();
        let handle = thread::spawn(move || AgencySession::new(server, context).run());
        (client, handle)
    }

    fn exchange(client: &mut TcpStream, msg: &str) -> String {
        write_message(client, msg).unwrap();
        read_message(client).unwrap()
    }

    fn assert_closed(client: &mut TcpStream) {
        let err = read_message(client).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    struct FailingStore;

    impl BetStore for FailingStore {
        fn store(&self, _bets: &[Bet]) -> Result<(), StorageError> {
            Err(StorageError::Io(io::Error::other("disk full")))
        }

        fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn bet_batch_is_stored_and_acked_with_count() {
        let store = Arc::new(MemoryBetStore::new());
        let (mut client, handle) = spawn_session(context(1, store.clone()));

        assert_eq!(exchange(&mut client, JUAN), "ACK[1]");
        assert_eq!(exchange(&mut client, JUAN_AND_ANA), "ACK[2]");

        let stored = store.load_all().unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].document, "30904465");
        assert_eq!(stored[0].birthdate, NaiveDate::from_ymd_opt(1999, 3, 17).unwrap());
        assert_eq!(stored[2].document, "11222333");

        drop(client);
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Connection(_))
        ));
    }

    #[test]
    fn malformed_batch_is_acked_with_zero_and_ends_session() {
        let store = Arc::new(MemoryBetStore::new());
        let (mut client, handle) = spawn_session(context(1, store.clone()));

        let broken = JUAN.replace(",\"number\":\"7573\"", "");
        assert_eq!(exchange(&mut client, &broken), "ACK[0]");
        assert_closed(&mut client);
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(DecodeError::MissingField("number")))
        ));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn empty_batch_is_acked_with_zero() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        assert_eq!(exchange(&mut client, "BET[]"), "ACK[0]");
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(DecodeError::EmptyBatch))
        ));
    }

    #[test]
    fn storage_failure_is_acked_with_zero() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(FailingStore)));
        assert_eq!(exchange(&mut client, JUAN), "ACK[0]");
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Storage(_))
        ));
    }

    #[test]
    fn no_more_bets_is_acked_with_tag() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        assert_eq!(exchange(&mut client, r#"NMB["agency":"1"]"#), "ACK[NMB]");
        drop(client);
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn ask_for_winners_returns_own_winning_documents() {
        let store = Arc::new(MemoryBetStore::new());
        let other_agency = JUAN.replace("\"agency\":\"1\"", "\"agency\":\"2\"");
        let (mut client, handle) = spawn_session(context(1, store));

        assert_eq!(exchange(&mut client, JUAN), "ACK[1]");
        assert_eq!(exchange(&mut client, &other_agency), "ACK[1]");
        assert_eq!(exchange(&mut client, r#"NMB["agency":"1"]"#), "ACK[NMB]");
        assert_eq!(
            exchange(&mut client, r#"ASK["agency":"1"]"#),
            r#"WIN["30904465"]"#
        );
        assert!(handle.join().unwrap().is_ok());
        assert_closed(&mut client);
    }

    #[test]
    fn ask_without_winning_bets_returns_empty_list() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        assert_eq!(exchange(&mut client, r#"ASK["agency":"1"]"#), "WIN[]");
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn aborted_draw_sends_no_winners() {
        let ctx = context(2, Arc::new(MemoryBetStore::new()));
        let coordinator = Arc::clone(&ctx.coordinator);
        let (mut client, handle) = spawn_session(ctx);

        write_message(&mut client, r#"ASK["agency":"1"]"#).unwrap();
        while coordinator.arrived() < 1 {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        coordinator.abort();

        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Aborted(RendezvousError::Aborted))
        ));
        assert_closed(&mut client);
    }

    #[test]
    fn unknown_tag_ends_session_without_reply() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        write_message(&mut client, "XYZ[]").unwrap();
        assert_closed(&mut client);
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(DecodeError::UnknownTag(_)))
        ));
    }

    #[test]
    fn server_side_tag_from_agency_is_unexpected() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        write_message(&mut client, "ACK[1]").unwrap();
        assert_closed(&mut client);
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::UnexpectedMessage(MessageTag::Ack))
        ));
    }

    #[test]
    fn malformed_no_more_bets_ends_session_without_reply() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        write_message(&mut client, r#"NMB["agency":"uno"]"#).unwrap();
        assert_closed(&mut client);
        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(DecodeError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn disconnect_mid_message_is_connection_error() {
        let (mut client, handle) = spawn_session(context(1, Arc::new(MemoryBetStore::new())));
        client.write_all(b"BET[{\"agency\"").unwrap();
        drop(client);
        match handle.join().unwrap() {
            Err(SessionError::Connection(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[test]
    fn handle_message_reports_next_state() {
        let store: Arc<dyn BetStore> = Arc::new(MemoryBetStore::new());
        let mut session = AgencySession::new(io::Cursor::new(Vec::new()), context(1, store));
        assert_eq!(session.state(), SessionState::AwaitMessage);
        assert_eq!(
            session.handle_message(r#"NMB["agency":"1"]"#).unwrap(),
            SessionState::AwaitMessage
        );
        assert_eq!(
            session.handle_message(r#"ASK["agency":"1"]"#).unwrap(),
            SessionState::Finished
        );
        assert!(matches!(
            session.handle_message("AC"),
            Err(SessionError::Protocol(DecodeError::TooShort { len: 2 }))
        ));
    }
}
