use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker tuning. Every field has a default so partial JSON is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Quiet period after the last `collect` message before the buffer flushes.
    pub collect_debounce_ms: u64,
    /// Buffer size that forces an immediate flush.
    pub collect_max_messages: usize,
    /// A `high` message interrupts only runs older than this.
    pub high_priority_threshold_secs: u64,
    /// Capacity of the broadcast channel behind `subscribe()`.
    pub event_channel_capacity: usize,
    /// Unit used for `user`/`system` short names when no unit is registered.
    pub default_unit: String,
    /// Append the task and its result to the unit's session store on success.
    pub record_turns: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            collect_debounce_ms: 500,
            collect_max_messages: 10,
            high_priority_threshold_secs: 30,
            event_channel_capacity: 1024,
            default_unit: "nexus".into(),
            record_turns: true,
        }
    }
}

impl BrokerConfig {
    pub fn collect_debounce(&self) -> Duration {
        Duration::from_millis(self.collect_debounce_ms)
    }

    pub fn high_priority_threshold(&self) -> Duration {
        Duration::from_secs(self.high_priority_threshold_secs)
    }
}
