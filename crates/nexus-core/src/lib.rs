//! Shared vocabulary for the Nexus agent broker: identifiers, messages,
//! lifecycle events, error types, and the traits the broker consumes
//! (agent factories, always-on agents, session stores).

pub mod agent;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod session;
