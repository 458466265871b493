//! Chat message payloads.

use serde::{Deserialize, Serialize};

/// A room or direct message.
///
/// Clients only supply `textMessage`; `id`, `timestamp` and `author` are
/// always overwritten by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub text_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl ChatMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text_message: text.into(),
            ..Self::default()
        }
    }

    /// Strip client-supplied metadata and set the author.
    pub fn process(&mut self, author: &str, timestamp: Option<i64>) {
        self.id = None;
        self.timestamp = timestamp;
        self.author = Some(author.to_string());
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
