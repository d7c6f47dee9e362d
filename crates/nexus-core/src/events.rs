use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;
use crate::ids::{AgentId, MessageId};
use crate::messages::Priority;

/// Lifecycle events published by the broker for monitoring surfaces.
/// Scheduling never reads these back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerEvent {
    #[serde(rename = "message_queued")]
    MessageQueued {
        message_id: MessageId,
        from: String,
        to: AgentId,
        priority: Priority,
        timestamp: DateTime<Utc>,
        queue_size: usize,
    },

    #[serde(rename = "agent_started")]
    AgentStarted {
        agent_id: AgentId,
        unit: String,
        timestamp: DateTime<Utc>,
        /// Messages in the batch handed to this run.
        queue_size: usize,
    },

    #[serde(rename = "agent_completed")]
    AgentCompleted {
        agent_id: AgentId,
        unit: String,
        timestamp: DateTime<Utc>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "agent_status_changed")]
    AgentStatusChanged {
        agent_id: AgentId,
        old_status: Option<AgentStatus>,
        new_status: AgentStatus,
        timestamp: DateTime<Utc>,
    },
}

/// Discriminant used for listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageQueued,
    AgentStarted,
    AgentCompleted,
    AgentStatusChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageQueued => "message_queued",
            Self::AgentStarted => "agent_started",
            Self::AgentCompleted => "agent_completed",
            Self::AgentStatusChanged => "agent_status_changed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_queued" => Ok(Self::MessageQueued),
            "agent_started" => Ok(Self::AgentStarted),
            "agent_completed" => Ok(Self::AgentCompleted),
            "agent_status_changed" => Ok(Self::AgentStatusChanged),
            other => Err(format!("unknown broker event: {other}")),
        }
    }
}

impl BrokerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageQueued { .. } => EventKind::MessageQueued,
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentCompleted { .. } => EventKind::AgentCompleted,
            Self::AgentStatusChanged { .. } => EventKind::AgentStatusChanged,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// The agent this event concerns (the recipient for queue events).
    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::MessageQueued { to, .. } => to,
            Self::AgentStarted { agent_id, .. }
            | Self::AgentCompleted { agent_id, .. }
            | Self::AgentStatusChanged { agent_id, .. } => agent_id,
        }
    }
}
