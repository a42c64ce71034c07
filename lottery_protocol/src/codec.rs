// Text codec for the lottery protocol.
//
// Grammar:
//
//   message := TAG "[" payload "]"
//   BET     := entry (";" entry)*
//   entry   := "{" field ("," field)* "}"
//   field   := "\"" key "\"" ":" "\"" value "\""
//   NMB/ASK := "\"agency\":\"<integer>\""
//   WIN     := ("\"" document "\"" ("," "\"" document "\"")*)?
//   ACK     := opaque text
//   WIT     := empty
//
// Nothing is escaped. Field values must not contain any of `RESERVED_CHARS`;
// the encoder does not check and the decoder cannot recover if they do.
//
// Every typed decoder validates the tag and the `[`/`]` delimiters before
// looking at the payload. Bet batches decode all-or-nothing: one bad entry
// fails the whole batch.
//
// All functions are pure; framing over a byte stream lives in `framing.rs`.

use chrono::NaiveDate;

use crate::message::{Message, MessageTag, TAG_LEN};
use crate::types::{AgencyId, Bet};

pub const START_MSG_DELIMITER: char = '[';
pub const END_MSG_DELIMITER: char = ']';
const START_BET_DELIMITER: char = '{';
const END_BET_DELIMITER: char = '}';
const BET_BATCH_SEPARATOR: char = ';';
const FIELD_SEPARATOR: char = ',';
const KEY_VALUE_SEPARATOR: char = ':';
const WINNERS_SEPARATOR: char = ',';
const QUOTE: char = '"';

/// Characters that may not appear inside any field value.
pub const RESERVED_CHARS: [char; 7] = ['[', ']', '{', '}', ';', ',', '"'];

/// Date layout of the `birthdate` field.
const BIRTHDATE_FORMAT: &str = "%Y-%m-%d";

/// Why a raw message could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message does not start with a 3-byte type tag ({len} bytes)")]
    TooShort { len: usize },
    #[error("unknown message type {0:?}")]
    UnknownTag(String),
    #[error("unexpected message type: expected {expected}, received {found}")]
    UnexpectedTag { expected: MessageTag, found: String },
    #[error("message is not framed as {tag}[...]")]
    MalformedFrame { tag: MessageTag },
    #[error("bet batch is empty")]
    EmptyBatch,
    #[error("malformed bet entry #{index}: {entry:?}")]
    MalformedEntry { index: usize, entry: String },
    #[error("malformed field {0:?}")]
    MalformedField(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("duplicated field `{0}`")]
    DuplicateField(String),
    #[error("invalid value {value:?} for field `{field}`")]
    InvalidValue { field: &'static str, value: String },
    #[error("malformed winners list {0:?}")]
    MalformedWinners(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

// ============================= DECODE ============================== //

/// Extract the three-byte type prefix of a raw message.
///
/// A message shorter than the tag is `TooShort`. A character that straddles
/// the tag boundary cannot belong to any known tag, so the prefix up to the
/// end of that character is reported as `UnknownTag`.
pub fn decode_type(raw: &str) -> DecodeResult<&str> {
    if raw.len() < TAG_LEN {
        return Err(DecodeError::TooShort { len: raw.len() });
    }
    raw.get(..TAG_LEN).ok_or_else(|| {
        let end = (TAG_LEN..raw.len())
            .find(|&i| raw.is_char_boundary(i))
            .unwrap_or(raw.len());
        DecodeError::UnknownTag(raw[..end].into())
    })
}

/// Decode any message by dispatching on its tag.
pub fn decode(raw: &str) -> DecodeResult<Message> {
    let tag = decode_type(raw)?;
    let tag = MessageTag::from_wire(tag).ok_or_else(|| DecodeError::UnknownTag(tag.into()))?;
    Ok(match tag {
        MessageTag::Ack => Message::Ack {
            payload: decode_ack(raw)?,
        },
        MessageTag::Bet => Message::BetBatch {
            bets: decode_bet_batch(raw)?,
        },
        MessageTag::NoMoreBets => Message::NoMoreBets {
            agency: decode_no_more_bets(raw)?,
        },
        MessageTag::AskForWinners => Message::AskForWinners {
            agency: decode_ask_for_winners(raw)?,
        },
        MessageTag::Winners => Message::Winners {
            documents: decode_winners(raw)?,
        },
        MessageTag::Wait => {
            decode_wait(raw)?;
            Message::Wait
        }
    })
}

/// Decode a `BET` message into its bets. Fails as a whole if any entry is
/// malformed or the payload is empty.
pub fn decode_bet_batch(raw: &str) -> DecodeResult<Vec<Bet>> {
    let payload = payload_of(raw, MessageTag::Bet)?;
    if payload.is_empty() {
        return Err(DecodeError::EmptyBatch);
    }
    payload
        .split(BET_BATCH_SEPARATOR)
        .enumerate()
        .map(|(index, entry)| decode_bet(index, entry))
        .collect()
}

/// Decode an `NMB` message into the declaring agency.
pub fn decode_no_more_bets(raw: &str) -> DecodeResult<AgencyId> {
    decode_agency_payload(payload_of(raw, MessageTag::NoMoreBets)?)
}

/// Decode an `ASK` message into the asking agency.
pub fn decode_ask_for_winners(raw: &str) -> DecodeResult<AgencyId> {
    decode_agency_payload(payload_of(raw, MessageTag::AskForWinners)?)
}

/// Decode an `ACK` message into its opaque payload.
pub fn decode_ack(raw: &str) -> DecodeResult<String> {
    payload_of(raw, MessageTag::Ack).map(str::to_owned)
}

/// Decode a `WIN` message into the list of winning documents.
pub fn decode_winners(raw: &str) -> DecodeResult<Vec<String>> {
    let payload = payload_of(raw, MessageTag::Winners)?;
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    payload
        .split(WINNERS_SEPARATOR)
        .map(|quoted| {
            unquote(quoted)
                .map(str::to_owned)
                .ok_or_else(|| DecodeError::MalformedWinners(payload.into()))
        })
        .collect()
}

/// Validate a `WIT` message. Its payload must be empty.
pub fn decode_wait(raw: &str) -> DecodeResult<()> {
    if payload_of(raw, MessageTag::Wait)?.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::MalformedFrame {
            tag: MessageTag::Wait,
        })
    }
}

/// Check the tag and delimiters, then return the text between `[` and `]`.
fn payload_of(raw: &str, expected: MessageTag) -> DecodeResult<&str> {
    let found = decode_type(raw)?;
    if found != expected.as_str() {
        return Err(DecodeError::UnexpectedTag {
            expected,
            found: found.into(),
        });
    }
    raw[TAG_LEN..]
        .strip_prefix(START_MSG_DELIMITER)
        .and_then(|rest| rest.strip_suffix(END_MSG_DELIMITER))
        .ok_or(DecodeError::MalformedFrame { tag: expected })
}

/// Strip one pair of surrounding double quotes. The inner text may not
/// contain further quotes.
fn unquote(s: &str) -> Option<&str> {
    s.strip_prefix(QUOTE)
        .and_then(|rest| rest.strip_suffix(QUOTE))
        .filter(|inner| !inner.contains(QUOTE))
}

/// Split `"key":"value"` into its unquoted halves.
fn decode_field(pair: &str) -> DecodeResult<(&str, &str)> {
    let malformed = || DecodeError::MalformedField(pair.into());
    let (key, value) = pair.split_once(KEY_VALUE_SEPARATOR).ok_or_else(malformed)?;
    Ok((unquote(key).ok_or_else(malformed)?, unquote(value).ok_or_else(malformed)?))
}

fn decode_agency_payload(payload: &str) -> DecodeResult<AgencyId> {
    let (key, value) = decode_field(payload)?;
    if key != "agency" {
        return Err(DecodeError::UnknownField(key.into()));
    }
    parse_agency(value)
}

fn parse_agency(value: &str) -> DecodeResult<AgencyId> {
    value.parse().map_err(|_| DecodeError::InvalidValue {
        field: "agency",
        value: value.into(),
    })
}

/// Field slots of one bet entry while it is being parsed.
#[derive(Default)]
struct BetFields<'a> {
    agency: Option<&'a str>,
    first_name: Option<&'a str>,
    last_name: Option<&'a str>,
    document: Option<&'a str>,
    birthdate: Option<&'a str>,
    number: Option<&'a str>,
}

impl<'a> BetFields<'a> {
    fn slot(&mut self, key: &str) -> Option<&mut Option<&'a str>> {
        match key {
            "agency" => Some(&mut self.agency),
            "first_name" => Some(&mut self.first_name),
            "last_name" => Some(&mut self.last_name),
            "document" => Some(&mut self.document),
            "birthdate" => Some(&mut self.birthdate),
            "number" => Some(&mut self.number),
            _ => None,
        }
    }

    fn into_bet(self) -> DecodeResult<Bet> {
        let agency = parse_agency(required(self.agency, "agency")?)?;
        let birthdate = required(self.birthdate, "birthdate")?;
        let birthdate = NaiveDate::parse_from_str(birthdate, BIRTHDATE_FORMAT).map_err(|_| {
            DecodeError::InvalidValue {
                field: "birthdate",
                value: birthdate.into(),
            }
        })?;
        let number = required(self.number, "number")?;
        let number = number.parse().map_err(|_| DecodeError::InvalidValue {
            field: "number",
            value: number.into(),
        })?;
        Ok(Bet {
            agency,
            first_name: required(self.first_name, "first_name")?.into(),
            last_name: required(self.last_name, "last_name")?.into(),
            document: required(self.document, "document")?.into(),
            birthdate,
            number,
        })
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> DecodeResult<&'a str> {
    value.ok_or(DecodeError::MissingField(field))
}

fn decode_bet(index: usize, entry: &str) -> DecodeResult<Bet> {
    let body = entry
        .strip_prefix(START_BET_DELIMITER)
        .and_then(|rest| rest.strip_suffix(END_BET_DELIMITER))
        .ok_or_else(|| DecodeError::MalformedEntry {
            index,
            entry: entry.into(),
        })?;

    let mut fields = BetFields::default();
    for pair in body.split(FIELD_SEPARATOR) {
        let (key, value) = decode_field(pair)?;
        let slot = fields
            .slot(key)
            .ok_or_else(|| DecodeError::UnknownField(key.into()))?;
        if slot.replace(value).is_some() {
            return Err(DecodeError::DuplicateField(key.into()));
        }
    }
    fields.into_bet()
}

// ============================= ENCODE ============================== //

fn encode_message(tag: MessageTag, payload: &str) -> String {
    format!("{tag}{START_MSG_DELIMITER}{payload}{END_MSG_DELIMITER}")
}

/// `ACK[<payload>]`.
pub fn encode_ack(payload: &str) -> String {
    encode_message(MessageTag::Ack, payload)
}

/// `WIN["doc1","doc2",...]`, or `WIN[]` when nobody won.
pub fn encode_winners(documents: &[String]) -> String {
    let payload = documents
        .iter()
        .map(|doc| format!("{QUOTE}{doc}{QUOTE}"))
        .collect::<Vec<_>>()
        .join(&WINNERS_SEPARATOR.to_string());
    encode_message(MessageTag::Winners, &payload)
}

/// `WIT[]`.
pub fn encode_wait() -> String {
    encode_message(MessageTag::Wait, "")
}

/// `BET[{...};{...}]`, fields in canonical order.
pub fn encode_bet_batch(bets: &[Bet]) -> String {
    let payload = bets
        .iter()
        .map(encode_bet)
        .collect::<Vec<_>>()
        .join(&BET_BATCH_SEPARATOR.to_string());
    encode_message(MessageTag::Bet, &payload)
}

/// `NMB["agency":"<id>"]`.
pub fn encode_no_more_bets(agency: AgencyId) -> String {
    encode_message(MessageTag::NoMoreBets, &encode_field("agency", &agency.to_string()))
}

/// `ASK["agency":"<id>"]`.
pub fn encode_ask_for_winners(agency: AgencyId) -> String {
    encode_message(
        MessageTag::AskForWinners,
        &encode_field("agency", &agency.to_string()),
    )
}

fn encode_field(key: &str, value: &str) -> String {
    format!("{QUOTE}{key}{QUOTE}{KEY_VALUE_SEPARATOR}{QUOTE}{value}{QUOTE}")
}

fn encode_bet(bet: &Bet) -> String {
    let fields = [
        encode_field("agency", &bet.agency.to_string()),
        encode_field("first_name", &bet.first_name),
        encode_field("last_name", &bet.last_name),
        encode_field("document", &bet.document),
        encode_field("birthdate", &bet.birthdate.format(BIRTHDATE_FORMAT).to_string()),
        encode_field("number", &bet.number.to_string()),
    ];
    format!(
        "{START_BET_DELIMITER}{}{END_BET_DELIMITER}",
        fields.join(&FIELD_SEPARATOR.to_string())
    )
}
