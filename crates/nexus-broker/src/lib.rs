//! Agent lifecycle broker: per-agent queues, routing, and the scheduler that
//! starts, interrupts, and drains agent executions.

pub mod broker;
pub mod bus;
mod collect;
pub mod config;
pub mod mock;
pub mod observe;
mod queue;
mod router;

pub use broker::{AgentCompletion, Broker};
pub use bus::{EventBus, ListenerId};
pub use config::BrokerConfig;
pub use observe::{AgentInfo, AlwaysOnInfo, BrokerSnapshot, RunningInfo};
