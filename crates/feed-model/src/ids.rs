use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::FeedModelError;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Fresh random id, used for locally minted records and tests.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wrap a backend-issued id, rejecting blanks.
            pub fn parse(raw: impl Into<String>) -> Result<Self, FeedModelError> {
                let raw = raw.into();
                if raw.trim().is_empty() {
                    return Err(FeedModelError::EmptyId($label));
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

opaque_id!(
    /// Post identifier, unique within the post collection
    PostId,
    "post id"
);
opaque_id!(CommentId, "comment id");
opaque_id!(
    /// Account identifier; doubles as the actor id on the push channel
    UserId,
    "user id"
);
opaque_id!(
    /// Server-assigned broadcast id, used to apply foreign events once
    EventId,
    "event id"
);
opaque_id!(NotificationId, "notification id");
opaque_id!(ViewId, "view id");
