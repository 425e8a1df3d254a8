//! Identifier newtypes.
//!
//! The backend emits UUIDs as strings, but older payloads and tests use bare
//! numbers. Every id deserializes from either form and is held as a string.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl IdRepr {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Unsigned(n) => n.to_string(),
            Self::Signed(n) => n.to_string(),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Blank identifiers are never valid on the wire.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                IdRepr::deserialize(deserializer).map(|repr| Self(repr.into_string()))
            }
        }
    };
}

string_id!(
    /// Account identifier; also the key for per-user destinations.
    UserId
);
string_id!(
    /// Chat conversation identifier.
    ConversationId
);
string_id!(
    /// Chat message identifier.
    MessageId
);
string_id!(
    /// Notification identifier.
    NotificationId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strings_and_numbers() {
        let a: MessageId = serde_json::from_str("\"m-1\"").unwrap();
        let b: MessageId = serde_json::from_str("42").unwrap();
        let c: MessageId = serde_json::from_str("-3").unwrap();

        assert_eq!(a.as_str(), "m-1");
        assert_eq!(b.as_str(), "42");
        assert_eq!(c.as_str(), "-3");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = UserId::new("u1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u1\"");
    }

    #[test]
    fn blank_detection() {
        assert!(ConversationId::new("  ").is_blank());
        assert!(!ConversationId::new("c1").is_blank());
    }
}
