use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use nexus_core::agent::{AgentFactory, AgentTask, SpawnRequest};
use nexus_core::errors::AgentFailure;
use nexus_core::ids::AgentId;

/// Built-in agent for the replay binary: answers every task with its own
/// description after an optional think time.
pub struct EchoFactory {
    delay: Duration,
}

impl EchoFactory {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl AgentFactory for EchoFactory {
    async fn create(&self, request: SpawnRequest) -> Result<Box<dyn AgentTask>, AgentFailure> {
        debug!(
            agent_id = %request.agent_id,
            history_turns = request.history.len(),
            "building echo agent"
        );
        Ok(Box::new(EchoTask {
            agent_id: request.agent_id,
            task: request.task_description,
            turns: request.history.len(),
            delay: self.delay,
        }))
    }
}

struct EchoTask {
    agent_id: AgentId,
    task: String,
    turns: usize,
    delay: Duration,
}

#[async_trait]
impl AgentTask for EchoTask {
    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<String, AgentFailure> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(AgentFailure::Cancelled),
            }
        }
        Ok(format!("[{} after {} turns] {}", self.agent_id, self.turns, self.task))
    }
}
