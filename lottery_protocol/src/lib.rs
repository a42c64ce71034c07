// lottery_protocol: wire protocol between lottery agencies and the server.
//
// This crate defines the bet value type, the protocol message vocabulary, the
// text codec, and the byte-stream framing used by `lottery_server` and by
// agency clients. It has no networking of its own and no shared state.
//
// Module overview:
// - `types.rs`:    `AgencyId` and the immutable `Bet` record.
// - `message.rs`:  `MessageTag` (the six three-letter codes) and the typed
//                  `Message` enum.
// - `codec.rs`:    Pure encode/decode between `Message`s and their
//                  `TAG[payload]` text form. Bet batches decode all-or-nothing.
// - `framing.rs`:  Delimiter-terminated reads and full writes over any
//                  `Read`/`Write` stream.
//
// Design decisions:
// - **Text, unescaped.** The protocol reserves `[ ] { } ; , "` and never
//   escapes them. Framing relies on that: a message ends when a read ends in
//   `]`.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, which fits the
//   server's thread-per-connection model and plain blocking sockets.

pub mod codec;
pub mod framing;
pub mod message;
pub mod types;

pub use codec::{DecodeError, DecodeResult};
pub use framing::{read_message, write_message};
pub use message::{Message, MessageTag};
pub use types::{AgencyId, Bet};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::NaiveDate;

    use super::*;

    /// Frame an encoded message, read it back, decode it.
    fn wire_roundtrip(msg: &Message) -> Message {
        let mut wire = Vec::new();
        write_message(&mut wire, &msg.encode()).unwrap();
        let mut cursor = Cursor::new(&wire);
        let raw = read_message(&mut cursor).unwrap();
        codec::decode(&raw).unwrap()
    }

    #[test]
    fn bet_batch_survives_framing() {
        let birthdate = NaiveDate::from_ymd_opt(1999, 3, 17).unwrap();
        let msg = Message::BetBatch {
            bets: vec![
                Bet::new(AgencyId(1), "Juan", "Perez", "30904465", birthdate, 7573),
                Bet::new(AgencyId(1), "Maria", "Lopez", "27111222", birthdate, 7574),
            ],
        };
        assert_eq!(wire_roundtrip(&msg), msg);
    }

    #[test]
    fn winners_survive_framing() {
        let msg = Message::Winners {
            documents: vec!["30904465".into(), "27111222".into()],
        };
        assert_eq!(wire_roundtrip(&msg), msg);
        let empty = Message::Winners { documents: vec![] };
        assert_eq!(wire_roundtrip(&empty), empty);
    }

    #[test]
    fn bet_serializes_for_storage() {
        let bet = Bet::new(
            AgencyId(3),
            "Ana",
            "Gomez",
            "11222333",
            NaiveDate::from_ymd_opt(1985, 12, 1).unwrap(),
            42,
        );
        let json = serde_json::to_string(&bet).unwrap();
        assert!(json.contains("\"birthdate\":\"1985-12-01\""));
        let back: Bet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bet);
    }
}
