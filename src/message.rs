use chrono::{DateTime, Utc};
use std::fmt;

/// A single chat message as ingested from a conversation source.
///
/// Messages are immutable once loaded and are the source of truth for
/// everything downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Conversation (thread) the message belongs to
    pub conversation_id: String,

    /// Message identifier, when the source provides one
    pub message_id: Option<String>,

    /// Creation time of the message
    pub timestamp: DateTime<Utc>,

    /// Author role as reported by the source (`user`, `assistant`, ...)
    pub author_role: String,

    /// Plain text content with all text parts joined
    pub text: String,
}

/// Deduplication key for a message.
///
/// The message id is preferred; sources without ids fall back to the
/// timestamp within the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    /// `(conversation_id, message_id)`
    Id(String, String),
    /// `(conversation_id, unix timestamp in milliseconds)`
    Timestamp(String, i64),
}

impl Message {
    /// Returns the deduplication key of this message.
    #[must_use]
    pub fn key(&self) -> MessageKey {
        match &self.message_id {
            Some(id) => MessageKey::Id(self.conversation_id.clone(), id.clone()),
            None => MessageKey::Timestamp(
                self.conversation_id.clone(),
                self.timestamp.timestamp_millis(),
            ),
        }
    }

    /// Returns the identifier written to `source_message_id`.
    ///
    /// Messages without an id are identified by their timestamp so the
    /// artifact identity stays stable across runs.
    #[must_use]
    pub fn source_message_id(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| format!("ts-{}", self.timestamp.timestamp_millis()))
    }

    /// Returns the identity key `(conversation_id, message_id)` used for
    /// artifact deduplication.
    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.conversation_id, self.source_message_id())
    }
}

/// Identity of a recipe artifact: the message it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    /// Source conversation id (`source_thread` in frontmatter)
    pub conversation_id: String,
    /// Source message id (`source_message_id` in frontmatter)
    pub message_id: String,
}

impl IdentityKey {
    /// Creates a new identity key.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conversation_id, self.message_id)
    }
}

/// Truncates text to at most `max_chars` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: Option<&str>) -> Message {
        Message {
            conversation_id: "c1".to_string(),
            message_id: id.map(str::to_string),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
            author_role: "assistant".to_string(),
            text: "Борщ".to_string(),
        }
    }

    #[test]
    fn test_key_prefers_message_id() {
        assert_eq!(
            message(Some("m1")).key(),
            MessageKey::Id("c1".to_string(), "m1".to_string())
        );
    }

    #[test]
    fn test_key_falls_back_to_timestamp() {
        let msg = message(None);
        assert_eq!(
            msg.key(),
            MessageKey::Timestamp("c1".to_string(), msg.timestamp.timestamp_millis())
        );
        assert!(msg.source_message_id().starts_with("ts-"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("суп дня", 3), "суп");
        assert_eq!(truncate_chars("soup", 10), "soup");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(IdentityKey::new("c1", "m1").to_string(), "c1/m1");
    }
}
