//! Raw message payload files.
//!
//! Batch payloads are not embedded in the database; each committed batch
//! points at a JSON file under `<base_dir>/<channel_id>/`. The batch row is
//! written only after the file exists, so a dangling path is never
//! persisted.

use crate::transport::RawMessage;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Payload storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create payload directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write payload file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One message record as stored in a payload file.
#[derive(Debug, Serialize)]
struct StoredMessage {
    channel_id: i64,
    message_id: i64,
    timestamp: i64,
    text: Option<String>,
    sender_id: Option<i64>,
    is_service_message: bool,
}

/// Writes batch payload files under a base directory.
#[derive(Debug, Clone)]
pub struct MessageStore {
    base_dir: PathBuf,
}

impl MessageStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Write one batch's messages as a JSON file, returning its path.
    pub fn write_batch(
        &self,
        channel_id: i64,
        batch_timestamp: i64,
        messages: &[RawMessage],
    ) -> Result<PathBuf, StorageError> {
        let channel_dir = self.base_dir.join(channel_id.to_string());
        fs::create_dir_all(&channel_dir).map_err(|source| StorageError::CreateDir {
            path: channel_dir.clone(),
            source,
        })?;

        let path = channel_dir.join(format!("batch_{batch_timestamp}.json"));
        let records: Vec<StoredMessage> = messages
            .iter()
            .map(|msg| StoredMessage {
                channel_id,
                message_id: msg.id,
                timestamp: msg.date,
                text: msg.text.as_deref().and_then(sanitize_text),
                sender_id: msg.sender_id,
                is_service_message: msg.is_service_message,
            })
            .collect();

        let encoded = serde_json::to_vec_pretty(&records)?;
        fs::write(&path, encoded).map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(
            channel_id,
            batch_timestamp,
            count = messages.len(),
            path = %path.display(),
            "Wrote payload file"
        );
        Ok(path)
    }
}

/// Strip control and non-printable characters, preserving printable Unicode.
/// Returns `None` when nothing printable remains.
pub fn sanitize_text(text: &str) -> Option<String> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r')
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, text: &str) -> RawMessage {
        RawMessage {
            id,
            date: 1_700_000_000 + id,
            text: Some(text.to_string()),
            sender_id: Some(42),
            is_service_message: false,
        }
    }

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize_text("hi\u{0}there"), Some("hithere".to_string()));
        assert_eq!(sanitize_text("line\nbreak"), Some("line\nbreak".to_string()));
        assert_eq!(sanitize_text("\u{1}\u{2}"), None);
        assert_eq!(
            sanitize_text("emoji \u{1F600} ok"),
            Some("emoji \u{1F600} ok".to_string())
        );
    }

    #[test]
    fn writes_payload_file_per_channel_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());

        let messages = vec![msg(100, "first"), msg(101, "second")];
        let path = store.write_batch(7, 1_700_000_500, &messages).unwrap();

        assert_eq!(
            path,
            dir.path().join("7").join("batch_1700000500.json")
        );
        let content = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        let records = parsed.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["message_id"], 100);
        assert_eq!(records[0]["channel_id"], 7);
        assert_eq!(records[1]["text"], "second");
    }
}
