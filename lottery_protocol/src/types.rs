// Core value types for the lottery protocol.
//
// `AgencyId` identifies a bet-submitting agency on the wire (it is learned
// from message payloads, never from the connection). `Bet` is the immutable
// record carried inside `BET` batches and persisted by the server's bet store;
// it derives `Serialize`/`Deserialize` so storage backends can persist it
// without a second representation.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Agency identifier as sent in `agency` fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgencyId(pub u32);

impl fmt::Display for AgencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgencyId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(AgencyId)
    }
}

/// A single bet placed at an agency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub agency: AgencyId,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: NaiveDate,
    pub number: u32,
}

impl Bet {
    pub fn new(
        agency: AgencyId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        document: impl Into<String>,
        birthdate: NaiveDate,
        number: u32,
    ) -> Self {
        Self {
            agency,
            first_name: first_name.into(),
            last_name: last_name.into(),
            document: document.into(),
            birthdate,
            number,
        }
    }
}
