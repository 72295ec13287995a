//! Pool definitions: the catalog of known agent types (§3 Pool entry,
//! §6.3).

use serde::{Deserialize, Serialize};

/// Top-level shape of a pool YAML document: `{ pool: { ... } }` (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFile {
    /// The pool itself.
    pub pool: PoolDef,
}

/// Catalog of agent types available to be instantiated by a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDef {
    /// The known agent types.
    pub agent_types: Vec<AgentTypeEntry>,
}

/// One entry in the pool: a named agent type and how to run it (§3 Pool
/// entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeEntry {
    /// The type name cell instances reference via `agent_type`.
    pub agent_type: String,
    /// Path to the executable binary implementing this agent type.
    ///
    /// Absent for agent types that run as an in-process runner instead of
    /// a spawned process (§4.7 `Start`).
    #[serde(default)]
    pub binary: Option<String>,
    /// The operator category this agent type belongs to.
    pub operator: OperatorCategory,
    /// Free-form capability tags, e.g. `["ocr", "gpu"]`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
}

/// The operator category a pool entry declares (§3 Pool entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatorCategory {
    /// Produces envelopes with no upstream ingress (e.g. a file watcher).
    Source,
    /// Consumes and produces envelopes.
    Transform,
    /// Consumes envelopes with no downstream egress.
    Sink,
    /// A long-running service other agents call into rather than a
    /// step in a pipeline.
    Service,
}

/// Errors parsing a pool file.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The YAML document didn't parse as a [`PoolFile`].
    #[error("failed to parse pool file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An agent type was declared more than once.
    #[error("duplicate agent_type {0} in pool")]
    DuplicateAgentType(String),
}

impl PoolFile {
    /// Parses a pool file from YAML text, checking agent-type uniqueness.
    ///
    /// # Errors
    /// Returns [`PoolError::Parse`] for malformed YAML or
    /// [`PoolError::DuplicateAgentType`] if an `agent_type` repeats.
    pub fn parse(text: &str) -> Result<Self, PoolError> {
        let file: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for entry in &file.pool.agent_types {
            if !seen.insert(entry.agent_type.clone()) {
                return Err(PoolError::DuplicateAgentType(entry.agent_type.clone()));
            }
        }
        Ok(file)
    }

    /// Looks up an agent type entry by name.
    #[must_use]
    pub fn find(&self, agent_type: &str) -> Option<&AgentTypeEntry> {
        self.pool.agent_types.iter().find(|entry| entry.agent_type == agent_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
pool:
  agent_types:
    - agent_type: source
      binary: /usr/local/bin/agen-source
      operator: source
      capabilities: [glob-watch]
      description: watches a directory for new files
    - agent_type: sink
      binary: /usr/local/bin/agen-sink
      operator: sink
";

    #[test]
    fn parses_entries_and_finds_by_type() {
        let pool = PoolFile::parse(SAMPLE).unwrap();
        assert_eq!(pool.pool.agent_types.len(), 2);
        let source = pool.find("source").unwrap();
        assert_eq!(source.operator, OperatorCategory::Source);
        assert_eq!(source.capabilities, vec!["glob-watch"]);
        assert!(pool.find("missing").is_none());
    }

    #[test]
    fn duplicate_agent_type_is_rejected() {
        let text = SAMPLE.replace("sink\n      binary", "source\n      binary");
        let err = PoolFile::parse(&text).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateAgentType(t) if t == "source"));
    }
}
