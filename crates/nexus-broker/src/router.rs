//! Recipient resolution.
//!
//! Fully qualified names (`{unit}-ia`, `{unit}-ea-{name}`) are validated and
//! passed through. Short names expand into the sender's unit as a spawned
//! agent: `worktrees` from `toolbox-ia` becomes `toolbox-ea-worktrees`.

use nexus_core::errors::BrokerError;
use nexus_core::ids::{is_synthetic_sender, unit_of, AgentId};
use tracing::debug;

/// What the router needs to know about the broker's current registrations.
pub(crate) trait AgentDirectory {
    fn is_always_on(&self, id: &AgentId) -> bool;
    fn is_running(&self, id: &AgentId) -> bool;
    fn has_unit(&self, unit: &str) -> bool;
    /// First unit registered, used for `user` and `system` short names.
    fn primary_unit(&self) -> Option<&str>;
}

pub(crate) fn resolve(
    directory: &impl AgentDirectory,
    default_unit: &str,
    sender: &str,
    recipient: &str,
) -> Result<AgentId, BrokerError> {
    if AgentId::is_fully_qualified(recipient) {
        let id = AgentId::from_raw(recipient);
        if !exists(directory, &id) {
            return Err(BrokerError::UnknownAgent(recipient.to_string()));
        }
        return Ok(id);
    }

    let unit = if is_synthetic_sender(sender) {
        directory.primary_unit().unwrap_or(default_unit)
    } else {
        unit_of(sender).ok_or_else(|| BrokerError::InvalidAgentId(sender.to_string()))?
    };

    let id = AgentId::spawned(unit, recipient);
    debug!(from = sender, to = recipient, resolved = %id, "expanded short agent name");
    Ok(id)
}

/// Registered always-on agent, running agent, or a unit that can create it.
fn exists(directory: &impl AgentDirectory, id: &AgentId) -> bool {
    if directory.is_always_on(id) || directory.is_running(id) {
        return true;
    }
    id.unit().is_some_and(|unit| directory.has_unit(unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Directory {
        units: Vec<String>,
        always_on: Vec<AgentId>,
        running: Vec<AgentId>,
    }

    impl AgentDirectory for Directory {
        fn is_always_on(&self, id: &AgentId) -> bool {
            self.always_on.contains(id)
        }
        fn is_running(&self, id: &AgentId) -> bool {
            self.running.contains(id)
        }
        fn has_unit(&self, unit: &str) -> bool {
            self.units.iter().any(|u| u == unit)
        }
        fn primary_unit(&self) -> Option<&str> {
            self.units.first().map(String::as_str)
        }
    }

    fn directory(units: &[&str]) -> Directory {
        Directory {
            units: units.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn short_name_uses_sender_unit() {
        let dir = directory(&["toolbox", "meta"]);
        let id = resolve(&dir, "nexus", "meta-ia", "planner").unwrap();
        assert_eq!(id.as_str(), "meta-ea-planner");
    }

    #[test]
    fn synthetic_senders_use_first_registered_unit() {
        let dir = directory(&["toolbox", "meta"]);
        assert_eq!(resolve(&dir, "nexus", "user", "helper").unwrap().as_str(), "toolbox-ea-helper");
        let resolved = resolve(&dir, "nexus", "system", "helper").unwrap();
        assert_eq!(resolved.as_str(), "toolbox-ea-helper");
    }

    #[test]
    fn synthetic_senders_fall_back_to_default_unit() {
        let dir = directory(&[]);
        assert_eq!(resolve(&dir, "nexus", "user", "helper").unwrap().as_str(), "nexus-ea-helper");
    }

    #[test]
    fn different_caller_units_resolve_differently() {
        let dir = directory(&["toolbox", "meta"]);
        let from_user = resolve(&dir, "nexus", "user", "helper").unwrap();
        let from_meta = resolve(&dir, "nexus", "meta-ea-x", "helper").unwrap();
        assert_ne!(from_user, from_meta);
    }

    #[test]
    fn fully_qualified_returned_unchanged_when_unit_registered() {
        let dir = directory(&["toolbox"]);
        let id = resolve(&dir, "nexus", "user", "toolbox-ea-worktrees").unwrap();
        assert_eq!(id.as_str(), "toolbox-ea-worktrees");
    }

    #[test]
    fn fully_qualified_unknown_rejected() {
        let dir = directory(&["toolbox"]);
        let err = resolve(&dir, "nexus", "user", "ghost-ea-x").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownAgent(name) if name == "ghost-ea-x"));
    }

    #[test]
    fn fully_qualified_accepted_when_always_on_or_running() {
        let dir = Directory {
            always_on: vec![AgentId::from_raw("ghost-ia")],
            running: vec![AgentId::from_raw("other-ea-y")],
            ..Default::default()
        };
        assert!(resolve(&dir, "nexus", "user", "ghost-ia").is_ok());
        assert!(resolve(&dir, "nexus", "user", "other-ea-y").is_ok());
    }

    #[test]
    fn single_segment_sender_is_invalid() {
        let dir = directory(&["toolbox"]);
        let err = resolve(&dir, "nexus", "cron", "helper").unwrap_err();
        assert!(matches!(err, BrokerError::InvalidAgentId(s) if s == "cron"));
    }
}
