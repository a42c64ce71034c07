// Protocol messages exchanged between agencies and the lottery server.
//
// Every message on the wire is `TAG[payload]` where `TAG` is one of the six
// fixed three-letter codes in `MessageTag`. `Message` is the typed form of a
// decoded message; the text form is produced and parsed by `codec.rs`.
//
// Direction:
// - Agency → server: `BetBatch` (BET), `NoMoreBets` (NMB), `AskForWinners` (ASK).
// - Server → agency: `Ack` (ACK), `Winners` (WIN).
// - `Wait` (WIT) is reserved for retry-later signaling. The server never sends
//   it today, but it is part of the vocabulary and must encode/decode.

use std::fmt;

use crate::codec;
use crate::types::{AgencyId, Bet};

/// Length in bytes of every message tag.
pub const TAG_LEN: usize = 3;

/// Three-letter message type prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Ack,
    Bet,
    NoMoreBets,
    AskForWinners,
    Winners,
    Wait,
}

impl MessageTag {
    pub const ALL: [MessageTag; 6] = [
        MessageTag::Ack,
        MessageTag::Bet,
        MessageTag::NoMoreBets,
        MessageTag::AskForWinners,
        MessageTag::Winners,
        MessageTag::Wait,
    ];

    /// The wire spelling of this tag.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageTag::Ack => "ACK",
            MessageTag::Bet => "BET",
            MessageTag::NoMoreBets => "NMB",
            MessageTag::AskForWinners => "ASK",
            MessageTag::Winners => "WIN",
            MessageTag::Wait => "WIT",
        }
    }

    /// Look up a tag by its wire spelling. Returns `None` for anything that is
    /// not one of the six known codes.
    pub fn from_wire(tag: &str) -> Option<MessageTag> {
        MessageTag::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Acknowledgement with an opaque payload (batch size or echoed tag).
    Ack { payload: String },
    /// One or more bets submitted by an agency.
    BetBatch { bets: Vec<Bet> },
    /// The agency has finished submitting bets.
    NoMoreBets { agency: AgencyId },
    /// The agency requests its winners (blocks until the draw).
    AskForWinners { agency: AgencyId },
    /// Winning documents for the asking agency, in draw order.
    Winners { documents: Vec<String> },
    /// Reserved: retry later.
    Wait,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Ack { .. } => MessageTag::Ack,
            Message::BetBatch { .. } => MessageTag::Bet,
            Message::NoMoreBets { .. } => MessageTag::NoMoreBets,
            Message::AskForWinners { .. } => MessageTag::AskForWinners,
            Message::Winners { .. } => MessageTag::Winners,
            Message::Wait => MessageTag::Wait,
        }
    }

    /// Render this message in its wire form.
    pub fn encode(&self) -> String {
        match self {
            Message::Ack { payload } => codec::encode_ack(payload),
            Message::BetBatch { bets } => codec::encode_bet_batch(bets),
            Message::NoMoreBets { agency } => codec::encode_no_more_bets(*agency),
            Message::AskForWinners { agency } => codec::encode_ask_for_winners(*agency),
            Message::Winners { documents } => codec::encode_winners(documents),
            Message::Wait => codec::encode_wait(),
        }
    }
}
