use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Message urgency. Declaration order is the queue order: `Urgent` sorts first.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queuing and interrupt policy attached to a message.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Batch,
    Single,
    Interrupt,
    /// Rewritten to `Interrupt` + `Priority::Urgent` on arrival.
    Steer,
    Followup,
    /// Debounced through the collection buffer.
    Collect,
}

/// Per-agent override of how many queued messages one run consumes.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPreference {
    /// The whole same-sender run at the head of the queue.
    #[default]
    Batch,
    /// Exactly one message per run.
    Single,
}

/// Where a message originated.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageSource {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "ia")]
    Ia,
    #[serde(rename = "ea")]
    Ea,
    #[serde(rename = "tool")]
    Tool,
    #[serde(rename = "cross-odu")]
    CrossOdu,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<MessageSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Envelope for every message routed through the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,
    /// Sender agent id, or `user` / `system`.
    pub from: String,
    /// Recipient, short or fully qualified. Rewritten to the resolved id.
    pub to: String,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            from: from.into(),
            to: to.into(),
            content: content.into(),
            priority: Priority::Normal,
            delivery_mode: DeliveryMode::Batch,
            timestamp: Utc::now(),
            conversation_id: None,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_source(mut self, source: MessageSource) -> Self {
        self.metadata.get_or_insert_with(MessageMetadata::default).source = Some(source);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn source(&self) -> Option<MessageSource> {
        self.metadata.as_ref().and_then(|m| m.source)
    }

    /// First 100 characters, for log lines.
    pub fn preview(&self) -> &str {
        match self.content.char_indices().nth(100) {
            Some((idx, _)) => &self.content[..idx],
            None => &self.content,
        }
    }
}
