//! Chats that receive the periodic notifications

use crate::Result;
use async_trait::async_trait;
use derive_more::{Display, From};

/// Opaque stable identifier of a Telegram chat
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
pub(crate) struct RecipientId(pub(crate) String);

impl From<teloxide::types::ChatId> for RecipientId {
    fn from(chat_id: teloxide::types::ChatId) -> Self {
        Self(chat_id.0.to_string())
    }
}

impl From<&str> for RecipientId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Recipient {
    pub(crate) id: RecipientId,

    /// Unix timestamp in seconds of the last successful notification.
    /// It is `0` if the recipient was never notified.
    pub(crate) last_notified_at: i64,
}

/// Durable mapping from the recipient to the time it was last notified at.
///
/// The inbound message handler is the only creator of the records, and the
/// control loop is the only writer of `last_notified_at`. The records are
/// never deleted.
#[async_trait]
pub(crate) trait RecipientStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Recipient>>;

    /// Creates the record with `last_notified_at = 0` if it doesn't exist yet.
    /// It's not an error if it already exists, the record is left intact.
    async fn upsert_new(&self, id: &RecipientId) -> Result;

    async fn update_last_notified(&self, id: &RecipientId, timestamp: i64) -> Result;
}
