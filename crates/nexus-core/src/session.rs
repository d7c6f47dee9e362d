use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::ids::{AgentId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for TurnRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown turn role: {other}")),
        }
    }
}

/// One conversation turn in an agent's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Registration record kept per agent. Agents persist once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub display_name: String,
    pub chat_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn new(display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            display_name: display_name.into(),
            chat_type: "direct".into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub metadata: SessionMetadata,
    pub history: Vec<HistoryTurn>,
}

/// Per-unit conversation storage consumed by the broker.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load an agent's session, `None` if the agent was never registered.
    async fn load(&self, agent_id: &AgentId) -> Result<Option<SessionRecord>, SessionError>;

    async fn append(&self, agent_id: &AgentId, turn: HistoryTurn) -> Result<(), SessionError>;

    /// Create or replace the agent's registration record.
    async fn write_metadata(
        &self,
        agent_id: &AgentId,
        metadata: SessionMetadata,
    ) -> Result<(), SessionError>;
}
