use crate::{
    config::SourceKind,
    error::{Error, Result},
    message::{Message, MessageKey},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Statistics collected while loading a source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    /// Conversations (threads) read
    pub conversations: usize,

    /// Messages kept after filtering and deduplication
    pub messages: usize,

    /// Duplicate messages dropped
    pub duplicates: usize,

    /// Messages dropped for empty text or an excluded role
    pub filtered: usize,

    /// Malformed entries skipped
    pub malformed: usize,
}

/// Loads conversation transcripts into an ordered, deduplicated sequence of
/// [`Message`]s.
pub(crate) struct SourceLoader {
    source: SourceKind,
    only_roles: Vec<String>,
}

/// A message before dedup and filtering, in document order.
struct RawMessage {
    id: Option<String>,
    timestamp: Option<f64>,
    role: String,
    text: String,
}

impl SourceLoader {
    pub(crate) fn new(source: SourceKind, only_roles: Vec<String>) -> Self {
        Self { source, only_roles }
    }

    /// Reads the source and returns its messages.
    ///
    /// Conversations keep source order (thread files are read in file-name
    /// order), and messages are ordered by timestamp within a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error only if the source itself cannot be opened.
    /// Malformed entries are logged and skipped.
    pub(crate) fn load(&self) -> Result<(Vec<Message>, LoadStats)> {
        let mut stats = LoadStats::default();
        let conversations = match &self.source {
            SourceKind::ThreadCache(dir) => Self::read_thread_cache(dir, &mut stats)?,
            SourceKind::ExportDump(file) => Self::read_export_dump(file, &mut stats)?,
        };

        let mut seen: HashSet<MessageKey> = HashSet::new();
        let mut messages = Vec::new();

        for (conversation_id, fallback_time, mut raw) in conversations {
            stats.conversations += 1;
            // stable sort keeps document order for equal timestamps
            raw.sort_by(|a, b| {
                let a = a.timestamp.unwrap_or(fallback_time);
                let b = b.timestamp.unwrap_or(fallback_time);
                a.total_cmp(&b)
            });

            for entry in raw {
                if entry.text.is_empty() || !self.role_allowed(&entry.role) {
                    stats.filtered += 1;
                    continue;
                }

                let Some(timestamp) = to_datetime(entry.timestamp.unwrap_or(fallback_time))
                else {
                    warn!(
                        "Skipping message {:?} in {}: timestamp out of range",
                        entry.id, conversation_id
                    );
                    stats.malformed += 1;
                    continue;
                };

                let message = Message {
                    conversation_id: conversation_id.clone(),
                    message_id: entry.id,
                    timestamp,
                    author_role: entry.role,
                    text: entry.text,
                };

                if !seen.insert(message.key()) {
                    trace!("Duplicate message {:?} dropped", message.key());
                    stats.duplicates += 1;
                    continue;
                }

                messages.push(message);
            }
        }

        stats.messages = messages.len();
        debug!(
            "Loaded {} messages from {} conversations ({} duplicates, {} filtered, {} malformed)",
            stats.messages, stats.conversations, stats.duplicates, stats.filtered, stats.malformed
        );

        Ok((messages, stats))
    }

    fn role_allowed(&self, role: &str) -> bool {
        self.only_roles.is_empty() || self.only_roles.iter().any(|r| r == role)
    }

    /// Reads every `*.json` file of a thread cache directory.
    fn read_thread_cache(
        dir: &Path,
        stats: &mut LoadStats,
    ) -> Result<Vec<(String, f64, Vec<RawMessage>)>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| Error::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut conversations = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_thread_file(&path) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => {
                    warn!("{}", e);
                    stats.malformed += 1;
                }
            }
        }

        Ok(conversations)
    }

    fn read_thread_file(path: &Path) -> Result<(String, f64, Vec<RawMessage>)> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let data: Value = serde_json::from_str(&text)
            .map_err(|e| Error::source_entry(path, e.to_string()))?;

        let thread_id = data
            .pointer("/thread/id")
            .and_then(id_string)
            .or_else(|| data.get("thread_id").and_then(id_string))
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
            .ok_or_else(|| Error::source_entry(path, "cannot determine thread id"))?;

        let entries = data
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::source_entry(path, "missing 'messages' array"))?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(obj) = entry.as_object() else {
                warn!("Skipping non-object message in {}", path.display());
                continue;
            };

            messages.push(RawMessage {
                id: obj.get("id").and_then(id_string),
                timestamp: obj.get("created_at").and_then(Value::as_f64),
                role: obj
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                text: thread_content_text(obj.get("content")),
            });
        }

        Ok((thread_id, 0.0, messages))
    }

    /// Reads a chat export dump: an array of conversations whose messages
    /// live in a `mapping` of tree nodes.
    fn read_export_dump(
        file: &Path,
        stats: &mut LoadStats,
    ) -> Result<Vec<(String, f64, Vec<RawMessage>)>> {
        let text = fs::read_to_string(file).map_err(|e| Error::io(file, e))?;
        let data: Value = serde_json::from_str(&text).map_err(|e| Error::source_entry(file, e.to_string()))?;
        let conversations = data
            .as_array()
            .ok_or_else(|| Error::source_entry(file, "expected a JSON array of conversations"))?;

        let mut result = Vec::with_capacity(conversations.len());
        for (index, conversation) in conversations.iter().enumerate() {
            let id = conversation
                .get("id")
                .and_then(id_string)
                .or_else(|| conversation.get("conversation_id").and_then(id_string));

            let (Some(id), Some(mapping)) = (
                id,
                conversation.get("mapping").and_then(Value::as_object),
            ) else {
                warn!(
                    "Skipping conversation #{} in {}: missing id or mapping",
                    index,
                    file.display()
                );
                stats.malformed += 1;
                continue;
            };

            let conversation_time = conversation
                .get("create_time")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);

            let messages = mapping
                .values()
                .filter_map(|node| node.get("message"))
                .filter_map(|message| {
                    let id = message.get("id").and_then(id_string)?;
                    Some(RawMessage {
                        id: Some(id),
                        timestamp: message
                            .get("create_time")
                            .and_then(Value::as_f64)
                            .filter(|t| *t > 0.0),
                        role: message
                            .pointer("/author/role")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        text: export_content_text(message.get("content")),
                    })
                })
                .collect();

            result.push((id, conversation_time, messages));
        }

        Ok(result)
    }
}

/// Converts a JSON id (string or number) to a non-empty string.
fn id_string(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

/// Extracts text from a thread message `content` field.
///
/// Content is either a plain string or a list of parts; a part is a string,
/// `{type: "text", text: {value}}`, `{type: "text", text: "..."}`, or any
/// object carrying a `text` string.
fn thread_content_text(content: Option<&Value>) -> String {
    let parts: Vec<String> = match content {
        Some(Value::String(s)) => return s.trim().to_string(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => match obj.get("text") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Object(text)) => text
                        .get("value")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    _ => None,
                },
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    parts.join("\n").trim().to_string()
}

/// Extracts text from an export message `content.parts` list.
fn export_content_text(content: Option<&Value>) -> String {
    let parts: Vec<String> = content
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    parts.join("\n").trim().to_string()
}

/// Converts fractional unix seconds to a UTC datetime.
fn to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    const THREAD: &str = r#"{
        "thread": {"id": "thread_abc"},
        "messages": [
            {"id": "msg_2", "created_at": 1709640100, "role": "assistant",
             "content": [{"type": "text", "text": {"value": "Tomato soup: tomatoes, salt"}}]},
            {"id": "msg_1", "created_at": 1709640000, "role": "user",
             "content": "How do I make tomato soup?"},
            {"id": "msg_2", "created_at": 1709640100, "role": "assistant",
             "content": "duplicate"},
            {"id": "msg_3", "created_at": 1709640200, "role": "assistant", "content": []},
            "garbage"
        ]
    }"#;

    const EXPORT: &str = r#"[
        {"id": "conv_1", "create_time": 1709640000.5, "mapping": {
            "root": {"message": null},
            "b": {"message": {"id": "m_b", "create_time": 1709640300,
                  "author": {"role": "assistant"}, "content": {"parts": ["Borscht", {"text": "beets"}]}}},
            "a": {"message": {"id": "m_a", "create_time": null,
                  "author": {"role": "user"}, "content": {"parts": ["recipe please"]}}}
        }},
        {"title": "no id"},
        {"conversation_id": "conv_2", "mapping": {
            "x": {"message": {"id": "m_x", "create_time": 1709650000,
                  "author": {"role": "assistant"}, "content": {"parts": ["Pancakes"]}}}
        }}
    ]"#;

    #[test]
    fn test_thread_cache_orders_and_dedups() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("threads/thread_abc.json").write_str(THREAD).unwrap();

        let loader = SourceLoader::new(SourceKind::ThreadCache(temp.path().join("threads")), vec![]);
        let (messages, stats) = loader.load().unwrap();

        let ids: Vec<_> = messages.iter().map(|m| m.message_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["msg_1", "msg_2"]);
        assert_eq!(messages[1].text, "Tomato soup: tomatoes, salt");
        assert_eq!(messages[0].conversation_id, "thread_abc");
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.filtered, 1);
    }

    #[test]
    fn test_thread_id_falls_back_to_file_stem() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("t/thread_xyz.json")
            .write_str(r#"{"messages": [{"id": "m", "created_at": 1, "content": "hi"}]}"#)
            .unwrap();

        let loader = SourceLoader::new(SourceKind::ThreadCache(temp.path().join("t")), vec![]);
        let (messages, _) = loader.load().unwrap();
        assert_eq!(messages[0].conversation_id, "thread_xyz");
    }

    #[test]
    fn test_malformed_thread_file_is_skipped() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("t/a.json").write_str("{not json").unwrap();
        temp.child("t/b.json").write_str(THREAD).unwrap();

        let loader = SourceLoader::new(SourceKind::ThreadCache(temp.path().join("t")), vec![]);
        let (messages, stats) = loader.load().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_export_dump() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("conversations.json").write_str(EXPORT).unwrap();

        let loader = SourceLoader::new(
            SourceKind::ExportDump(temp.path().join("conversations.json")),
            vec![],
        );
        let (messages, stats) = loader.load().unwrap();

        let ids: Vec<_> = messages.iter().map(|m| m.message_id.clone().unwrap()).collect();
        // m_a inherits the conversation time and sorts first
        assert_eq!(ids, vec!["m_a", "m_b", "m_x"]);
        assert_eq!(messages[0].timestamp.timestamp(), 1_709_640_000);
        assert_eq!(messages[1].text, "Borscht\nbeets");
        assert_eq!(messages[2].conversation_id, "conv_2");
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.conversations, 2);
    }

    #[test]
    fn test_export_ties_keep_document_order() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("conversations.json")
            .write_str(
                r#"[{"id": "c", "create_time": 1709640000, "mapping": {
                    "zz": {"message": {"id": "first", "create_time": null,
                           "author": {"role": "assistant"}, "content": {"parts": ["one"]}}},
                    "aa": {"message": {"id": "second", "create_time": null,
                           "author": {"role": "assistant"}, "content": {"parts": ["two"]}}}
                }}]"#,
            )
            .unwrap();

        let loader = SourceLoader::new(
            SourceKind::ExportDump(temp.path().join("conversations.json")),
            vec![],
        );
        let (messages, _) = loader.load().unwrap();

        let ids: Vec<_> = messages.iter().map(|m| m.message_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_reload_is_stable() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("conversations.json").write_str(EXPORT).unwrap();

        let loader = SourceLoader::new(
            SourceKind::ExportDump(temp.path().join("conversations.json")),
            vec![],
        );
        let (first, _) = loader.load().unwrap();
        let (second, _) = loader.load().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_role_filter() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("conversations.json").write_str(EXPORT).unwrap();

        let loader = SourceLoader::new(
            SourceKind::ExportDump(temp.path().join("conversations.json")),
            vec!["assistant".to_string()],
        );
        let (messages, stats) = loader.load().unwrap();
        assert!(messages.iter().all(|m| m.author_role == "assistant"));
        assert_eq!(stats.filtered, 1);
    }

    #[test]
    fn test_export_not_an_array_is_an_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("conversations.json").write_str("{}").unwrap();

        let loader = SourceLoader::new(
            SourceKind::ExportDump(temp.path().join("conversations.json")),
            vec![],
        );
        assert!(loader.load().is_err());
    }

    #[test]
    fn test_messages_without_id_dedup_by_timestamp() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("t/c.json")
            .write_str(
                r#"{"thread_id": "c", "messages": [
                    {"created_at": 100, "content": "soup"},
                    {"created_at": 100, "content": "soup again"},
                    {"created_at": 200, "content": "stew"}
                ]}"#,
            )
            .unwrap();

        let loader = SourceLoader::new(SourceKind::ThreadCache(temp.path().join("t")), vec![]);
        let (messages, stats) = loader.load().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "soup");
        assert_eq!(stats.duplicates, 1);
    }
}
