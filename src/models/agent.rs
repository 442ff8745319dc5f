use serde::{Deserialize, Serialize};

/// The closed set of agent kinds a task can be assigned to.
///
/// - `Orchestrator`: Receives status reports; never assigned tasks
/// - `Frontend`, `Backend`, `Db`, `Qa`, `Security`, `Devops`, `Docs`, `UxUi`:
///   Worker agents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Orchestrator,
    Frontend,
    Backend,
    Db,
    Qa,
    Security,
    Devops,
    Docs,
    UxUi,
}

impl AgentKind {
    pub const WORKERS: [AgentKind; 8] = [
        Self::Frontend,
        Self::Backend,
        Self::Db,
        Self::Qa,
        Self::Security,
        Self::Devops,
        Self::Docs,
        Self::UxUi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Db => "db",
            Self::Qa => "qa",
            Self::Security => "security",
            Self::Devops => "devops",
            Self::Docs => "docs",
            Self::UxUi => "ux_ui",
        }
    }

    /// Parse an agent identifier. Accepts the `_agent` suffixed form
    /// (`frontend_agent`) as well as the bare kind.
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.strip_suffix("_agent").unwrap_or(&s) {
            "orchestrator" => Some(Self::Orchestrator),
            "frontend" => Some(Self::Frontend),
            "backend" => Some(Self::Backend),
            "db" | "database" => Some(Self::Db),
            "qa" => Some(Self::Qa),
            "security" => Some(Self::Security),
            "devops" => Some(Self::Devops),
            "docs" => Some(Self::Docs),
            "ux_ui" | "ux" => Some(Self::UxUi),
            _ => None,
        }
    }

    pub fn is_worker(&self) -> bool {
        !matches!(self, Self::Orchestrator)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_suffixed_names() {
        assert_eq!(AgentKind::from_str("frontend_agent"), Some(AgentKind::Frontend));
        assert_eq!(AgentKind::from_str("Backend"), Some(AgentKind::Backend));
        assert_eq!(AgentKind::from_str("ux_ui_agent"), Some(AgentKind::UxUi));
        assert_eq!(AgentKind::from_str("wizard"), None);
    }

    #[test]
    fn test_round_trips_every_worker() {
        for kind in AgentKind::WORKERS {
            assert_eq!(AgentKind::from_str(kind.as_str()), Some(kind));
            assert!(kind.is_worker());
        }
        assert!(!AgentKind::Orchestrator.is_worker());
    }
}
