//! Cell definitions: the declarative instance graph a cell file describes
//! (§3 Cell definition, §6.3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::domain_types::RestartPolicy;

/// Top-level shape of a cell YAML document: `{ cell: { ... } }` (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellFile {
    /// The cell definition itself.
    pub cell: CellDef,
}

/// A declarative graph of agent instances and the channels connecting
/// them (§3 Cell definition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDef {
    /// Unique identifier for this cell.
    pub id: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// The agent instances this cell declares.
    pub agents: Vec<AgentInstanceDef>,
}

/// One agent instance declaration within a cell (§3 Cell definition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstanceDef {
    /// Identifier for this instance, unique within the cell (§3
    /// invariants).
    pub id: String,
    /// Which pool entry's binary/runner this instance is of.
    pub agent_type: String,
    /// Channel URI this instance consumes from, e.g. `sub:documents`.
    pub ingress: String,
    /// Channel URI this instance produces to, e.g. `pipe:results`.
    pub egress: String,
    /// Typed configuration passed to the instance, merged over the
    /// agent's resolved file/embedded config (§6.2).
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Other instance ids this one depends on for startup ordering.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// What the orchestrator does when this instance crashes after
    /// startup (§4.7 Failure semantics).
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Errors parsing or validating a cell file.
#[derive(Debug, thiserror::Error)]
pub enum CellFileError {
    /// The YAML document didn't parse as a [`CellFile`].
    #[error("failed to parse cell file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Two agent instances in the same cell declared the same id (§3
    /// invariants).
    #[error("duplicate agent id {0} in cell {1}")]
    DuplicateAgentId(String, String),
}

impl CellFile {
    /// Parses a cell file from YAML text, checking the agent-id
    /// uniqueness invariant (§3 Cell definition invariants).
    ///
    /// # Errors
    /// Returns [`CellFileError::Parse`] for malformed YAML or
    /// [`CellFileError::DuplicateAgentId`] if two instances share an id.
    pub fn parse(text: &str) -> Result<Self, CellFileError> {
        let file: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for agent in &file.cell.agents {
            if !seen.insert(agent.id.clone()) {
                return Err(CellFileError::DuplicateAgentId(agent.id.clone(), file.cell.id.clone()));
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
cell:
  id: demo
  description: a small demo cell
  agents:
    - id: producer
      agent_type: source
      ingress: 'file:in/*.json'
      egress: 'pub:documents'
    - id: consumer
      agent_type: sink
      ingress: 'sub:documents'
      egress: 'pipe:out'
      dependencies: [producer]
      restart: always
";

    #[test]
    fn parses_agents_in_order() {
        let file = CellFile::parse(SAMPLE).unwrap();
        assert_eq!(file.cell.id, "demo");
        assert_eq!(file.cell.agents.len(), 2);
        assert_eq!(file.cell.agents[1].dependencies, vec!["producer"]);
        assert_eq!(file.cell.agents[1].restart, RestartPolicy::Always);
    }

    #[test]
    fn duplicate_agent_ids_are_rejected() {
        let text = SAMPLE.replace("consumer", "producer");
        let err = CellFile::parse(&text).unwrap_err();
        assert!(matches!(err, CellFileError::DuplicateAgentId(id, _) if id == "producer"));
    }
}
