use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            /// Parse an identifier supplied by configuration or the wire
            pub fn parse(id: &str) -> Result<Self, CoreError> {
                let trimmed = id.trim();
                if trimmed.is_empty() {
                    return Err(CoreError::InvalidIdentifier(format!(
                        "empty {}",
                        stringify!($name)
                    )));
                }
                Ok($name(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
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
                $name(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of a peer in the permissioned cluster
    PeerId
);

string_id!(
    /// Identity of one agreement attempt
    RoundId
);

string_id!(
    /// Leader epoch; changes on re-election
    ViewId
);
