//! Read-only views of broker state for status surfaces.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nexus_core::agent::AgentStatus;
use nexus_core::ids::{AgentId, AgentKind};

use crate::broker::{Broker, BrokerState};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlwaysOnInfo {
    pub agent_id: AgentId,
    pub unit: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInfo {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub unit: String,
    pub queue_size: usize,
    pub batch_size: usize,
    pub sender: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub agent_type: AgentKind,
    pub status: AgentStatus,
    pub unit: String,
    pub queue_size: usize,
    pub running: bool,
}

/// Everything the accessors expose, captured under one lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub units: Vec<String>,
    pub always_on: Vec<AlwaysOnInfo>,
    pub running: Vec<RunningInfo>,
    pub queue_depths: BTreeMap<AgentId, usize>,
    pub agents: Vec<AgentInfo>,
}

fn unit_name(id: &AgentId) -> String {
    id.unit().unwrap_or_default().to_string()
}

impl BrokerState {
    fn always_on_view(&self) -> Vec<AlwaysOnInfo> {
        let mut out: Vec<AlwaysOnInfo> = self
            .always_on
            .keys()
            .map(|id| AlwaysOnInfo {
                agent_id: id.clone(),
                unit: unit_name(id),
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    fn running_view(&self) -> Vec<RunningInfo> {
        let mut out: Vec<RunningInfo> = self
            .running
            .iter()
            .map(|(id, run)| RunningInfo {
                agent_id: id.clone(),
                status: self.status_of(id),
                started_at: run.started_at,
                unit: unit_name(id),
                queue_size: self.queues.size(id),
                batch_size: run.batch_size,
                sender: run.sender.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Always-on, running, and queued-but-idle agents.
    fn agents_view(&self) -> Vec<AgentInfo> {
        let depths = self.queues.depths();
        let ids: BTreeSet<AgentId> = self
            .always_on
            .keys()
            .chain(self.running.keys())
            .chain(depths.keys())
            .cloned()
            .collect();

        ids.into_iter()
            .map(|id| AgentInfo {
                agent_type: if self.always_on.contains_key(&id) {
                    AgentKind::Ia
                } else {
                    AgentKind::Ea
                },
                status: self.status_of(&id),
                unit: unit_name(&id),
                queue_size: depths.get(&id).copied().unwrap_or(0),
                running: self.running.contains_key(&id),
                agent_id: id,
            })
            .collect()
    }
}

impl Broker {
    pub fn get_agent_status(&self, agent_id: &AgentId) -> AgentStatus {
        self.inner.state.lock().status_of(agent_id)
    }

    pub fn is_agent_active(&self, agent_id: &AgentId) -> bool {
        self.get_agent_status(agent_id) == AgentStatus::Active
    }

    /// Senders that have messaged `agent_id`, sorted.
    pub fn get_external_callers(&self, agent_id: &AgentId) -> Vec<String> {
        self.inner
            .state
            .lock()
            .external_callers
            .get(agent_id)
            .map(|callers| callers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_queue_size(&self, agent_id: &AgentId) -> usize {
        self.inner.state.lock().queues.size(agent_id)
    }

    pub fn has_pending(&self, agent_id: &AgentId) -> bool {
        self.inner.state.lock().queues.has_pending(agent_id)
    }

    /// Messages waiting in the collection buffer, not yet queued.
    pub fn get_collected_count(&self, agent_id: &AgentId) -> usize {
        self.inner.state.lock().collect.buffered(agent_id)
    }

    pub fn always_on_agents(&self) -> Vec<AlwaysOnInfo> {
        self.inner.state.lock().always_on_view()
    }

    pub fn running_agents(&self) -> Vec<RunningInfo> {
        self.inner.state.lock().running_view()
    }

    pub fn queue_depths(&self) -> BTreeMap<AgentId, usize> {
        self.inner.state.lock().queues.depths()
    }

    pub fn known_agents(&self) -> Vec<AgentInfo> {
        self.inner.state.lock().agents_view()
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        let st = self.inner.state.lock();
        BrokerSnapshot {
            taken_at: Utc::now(),
            units: st.units.iter().map(|u| u.name.clone()).collect(),
            always_on: st.always_on_view(),
            running: st.running_view(),
            queue_depths: st.queues.depths(),
            agents: st.agents_view(),
        }
    }
}
