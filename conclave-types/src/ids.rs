//! Strongly-typed identifiers used throughout the message protocol.
//!
//! `SessionId`, `AgentId`, and `ToolCallId` wrap plain strings because their
//! values originate outside this crate (a client-chosen session name, a
//! registered agent name such as `"METAGEN"`, or a tool-call id minted by the
//! language model). `TurnId` and `RequestId` are generated internally and use
//! UUIDs; `TurnId` uses v7 so turn ids sort in creation order.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(SessionId);
string_id!(AgentId);
string_id!(ToolCallId);

impl SessionId {
    /// Mints a fresh, client-opaque session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

macro_rules! uuid_id {
    ($name:ident, $ctor:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::$ctor())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(TurnId, now_v7);
uuid_id!(RequestId, new_v4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_round_trip_through_json() {
        let id = SessionId::new("s1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s1\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn turn_ids_are_creation_ordered() {
        let a = TurnId::generate();
        let b = TurnId::generate();
        assert!(a.0 <= b.0);
    }
}
