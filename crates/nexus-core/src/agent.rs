use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::AgentFailure;
use crate::ids::AgentId;
use crate::messages::Priority;
use crate::session::HistoryTurn;

/// In-memory lifecycle status of an agent. Absent means `Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    #[default]
    Idle,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Everything a factory needs to build one execution.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub agent_id: AgentId,
    pub task_description: String,
    pub history: Vec<HistoryTurn>,
}

/// A constructed, not yet started, agent execution.
///
/// Implementations must watch `cancel` and return promptly once it fires.
/// Returning `Ok` with partial output or `Err(AgentFailure::Cancelled)` are
/// both acceptable exits.
#[async_trait]
pub trait AgentTask: Send {
    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<String, AgentFailure>;
}

/// Builds spawned agents for one organizational unit.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, request: SpawnRequest) -> Result<Box<dyn AgentTask>, AgentFailure>;
}

/// Singleton agent that owns its own queue and processing loop.
#[async_trait]
pub trait AlwaysOnAgent: Send + Sync {
    fn queue_message(&self, content: &str, priority: Priority, from: &str);

    /// Legacy single-shot entry point.
    async fn chat_sync(&self, content: &str) -> Result<String, AgentFailure>;

    /// Drain the agent's own queue, returning an acknowledgement.
    async fn process_queue(&self) -> Result<String, AgentFailure> {
        self.chat_sync("").await
    }
}
