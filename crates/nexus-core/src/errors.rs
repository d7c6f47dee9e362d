/// Failures surfaced synchronously to callers of the broker.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("organizational unit not registered: {unit} (for agent {agent_id})")]
    UnregisteredUnit { unit: String, agent_id: String },

    #[error("invalid agent id format: {0}")]
    InvalidAgentId(String),

    #[error("cannot wait for ack: {0} is not a registered always-on agent")]
    NotAlwaysOn(String),

    #[error("agent error: {0}")]
    Agent(#[from] AgentFailure),
}

impl BrokerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownAgent(_) => "unknown_agent",
            Self::UnregisteredUnit { .. } => "unregistered_unit",
            Self::InvalidAgentId(_) => "invalid_agent_id",
            Self::NotAlwaysOn(_) => "not_always_on",
            Self::Agent(_) => "agent",
        }
    }
}

/// How an agent execution (or its construction) went wrong.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AgentFailure {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("agent panicked: {0}")]
    Panicked(String),

    #[error("agent construction failed: {0}")]
    Construction(String),
}

impl AgentFailure {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::Construction(_) => "construction",
        }
    }
}

/// Errors a session store implementation may report to the broker.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session backend error: {0}")]
    Backend(String),

    #[error("session data corrupt: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_kinds() {
        assert_eq!(BrokerError::UnknownAgent("x".into()).error_kind(), "unknown_agent");
        let err = BrokerError::UnregisteredUnit {
            unit: "nexus".into(),
            agent_id: "nexus-ea-helper".into(),
        };
        assert_eq!(err.error_kind(), "unregistered_unit");
        assert!(err.to_string().contains("nexus-ea-helper"));
    }

    #[test]
    fn agent_failure_converts() {
        let err: BrokerError = AgentFailure::Failed("boom".into()).into();
        assert!(matches!(err, BrokerError::Agent(AgentFailure::Failed(_))));
        assert_eq!(err.to_string(), "agent error: boom");
    }
}
