use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Location,
}

/// Identifier of the shared conversation room for a participant pair.
///
/// Both sides of a conversation derive the same room independently, so the
/// value is a pure function of the unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Resolves the room for `{a, b}`. Commutative: `for_pair(a, b)` and
    /// `for_pair(b, a)` return the same id.
    pub fn for_pair(a: UserId, b: UserId) -> Self {
        let (low, high) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        Self(format!("{}-{}", low.0, high.0))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
