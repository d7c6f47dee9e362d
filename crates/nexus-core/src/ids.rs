use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(MessageId, "msg");
branded_id!(SessionId, "sess");
branded_id!(RunId, "run");

/// Synthetic sender used for messages typed by the human owner.
pub const USER_SENDER: &str = "user";
/// Synthetic sender used for messages produced by the platform itself.
pub const SYSTEM_SENDER: &str = "system";

/// Whether `sender` is one of the synthetic senders that belong to no unit.
pub fn is_synthetic_sender(sender: &str) -> bool {
    sender == USER_SENDER || sender == SYSTEM_SENDER
}

/// The two agent flavours encoded in the second segment of an agent id.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// `{unit}-ia`: always-on interaction agent.
    Ia,
    /// `{unit}-ea-{name}`: spawned execution agent.
    Ea,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ia => "ia",
            Self::Ea => "ea",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully-qualified agent identifier, namespaced by organizational unit.
///
/// Examples: `toolbox-ia`, `toolbox-ea-worktrees`. Construction does not
/// validate; use [`AgentId::is_fully_qualified`] to check the shape.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// `{unit}-ea-{name}`
    pub fn spawned(unit: &str, name: &str) -> Self {
        Self(format!("{unit}-ea-{name}"))
    }

    /// `{unit}-ia`
    pub fn always_on(unit: &str) -> Self {
        Self(format!("{unit}-ia"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// At least two `-` segments with `ia` or `ea` in second position.
    pub fn is_fully_qualified(name: &str) -> bool {
        Self::kind_of(name).is_some()
    }

    fn kind_of(name: &str) -> Option<AgentKind> {
        let mut parts = name.split('-');
        let _unit = parts.next()?;
        match parts.next()? {
            "ia" => Some(AgentKind::Ia),
            "ea" => Some(AgentKind::Ea),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<AgentKind> {
        Self::kind_of(&self.0)
    }

    /// First segment of the id. `None` for single-segment names.
    pub fn unit(&self) -> Option<&str> {
        unit_of(&self.0)
    }

    /// `toolbox-ea-worktrees` → `worktrees`. Anything else is returned whole.
    pub fn display_name(&self) -> &str {
        let mut parts = self.0.splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some("ea"), Some(rest)) if !rest.is_empty() => rest,
            _ => &self.0,
        }
    }

    /// Always-on ids end in `-ia`.
    pub fn targets_always_on(&self) -> bool {
        self.0.ends_with("-ia")
    }
}

/// Unit segment of any agent-like id (`toolbox-ea-x` → `toolbox`).
pub fn unit_of(id: &str) -> Option<&str> {
    let (unit, rest) = id.split_once('-')?;
    if unit.is_empty() || rest.is_empty() {
        return None;
    }
    Some(unit)
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_has_prefix() {
        let id = MessageId::new();
        assert!(id.as_str().starts_with("msg_"), "got: {id}");
    }

    #[test]
    fn run_id_has_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn fully_qualified_shapes() {
        assert!(AgentId::is_fully_qualified("toolbox-ia"));
        assert!(AgentId::is_fully_qualified("toolbox-ea-worktrees"));
        assert!(AgentId::is_fully_qualified("toolbox-ea-multi-part-name"));
        assert!(!AgentId::is_fully_qualified("helper"));
        assert!(!AgentId::is_fully_qualified("toolbox-xx-helper"));
        assert!(!AgentId::is_fully_qualified("my-helper"));
    }

    #[test]
    fn kind_and_unit() {
        let ia = AgentId::always_on("meta");
        assert_eq!(ia.as_str(), "meta-ia");
        assert_eq!(ia.kind(), Some(AgentKind::Ia));
        assert_eq!(ia.unit(), Some("meta"));

        let ea = AgentId::spawned("toolbox", "worktrees");
        assert_eq!(ea.kind(), Some(AgentKind::Ea));
        assert_eq!(ea.unit(), Some("toolbox"));
    }

    #[test]
    fn display_name_strips_spawned_prefix() {
        assert_eq!(AgentId::from_raw("toolbox-ea-worktrees").display_name(), "worktrees");
        assert_eq!(AgentId::from_raw("toolbox-ea-a-b").display_name(), "a-b");
        assert_eq!(AgentId::from_raw("meta-ia").display_name(), "meta-ia");
    }

    #[test]
    fn unit_of_rejects_single_segment() {
        assert_eq!(unit_of("user"), None);
        assert_eq!(unit_of("-ia"), None);
        assert_eq!(unit_of("toolbox-ea-x"), Some("toolbox"));
    }

    #[test]
    fn synthetic_senders() {
        assert!(is_synthetic_sender("user"));
        assert!(is_synthetic_sender("system"));
        assert!(!is_synthetic_sender("toolbox-ia"));
    }

    #[test]
    fn agent_id_serde_is_transparent() {
        let id = AgentId::from_raw("toolbox-ea-x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"toolbox-ea-x\"");
    }
}
