//! Expanding cell definitions into a validated instance graph (§4.7
//! `Plan`).

use crate::orchestrator::cell::{AgentInstanceDef, CellDef};
use crate::orchestrator::channel_uri::{self, ChannelUri, Side};
use crate::orchestrator::pool::PoolFile;

/// One agent instance as resolved by planning: its definition plus its
/// parsed ingress/egress channels.
#[derive(Debug, Clone)]
pub struct PlannedInstance {
    /// The instance's declaration from the cell file.
    pub def: AgentInstanceDef,
    /// Parsed ingress channel.
    pub ingress: ChannelUri,
    /// Parsed egress channel.
    pub egress: ChannelUri,
    /// Path to the executable binary for this instance's agent type, if
    /// it runs as a spawned process rather than in-process.
    pub binary: Option<String>,
}

/// A single plan-time validation problem, named the way the orchestrator
/// reports it in its startup banner (§4.7 Plan-time validation, §7
/// user-visible behavior).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// The offending agent instance's id, if the problem is attributable
    /// to one.
    pub agent_id: Option<String>,
    /// The channel URI or agent-type string involved.
    pub detail: String,
    /// Human-readable description of the problem.
    pub reason: String,
}

/// The fully expanded, validated layout for one cell (§4.7 `Plan`).
#[derive(Debug, Clone)]
pub struct Plan {
    /// The cell this plan was built from.
    pub cell_id: String,
    /// Every agent instance, in declaration order.
    pub instances: Vec<PlannedInstance>,
}

/// Errors building or validating a plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// An instance's `agent_type` has no matching pool entry.
    #[error("agent instance {instance} references unknown agent_type {agent_type}")]
    UnknownAgentType {
        /// The instance that referenced the type.
        instance: String,
        /// The unresolved type name.
        agent_type: String,
    },

    /// A channel URI failed to parse.
    #[error("agent instance {instance}: {source}")]
    InvalidChannelUri {
        /// The instance whose ingress or egress failed to parse.
        instance: String,
        /// The underlying parse error.
        #[source]
        source: channel_uri::ChannelUriError,
    },

    /// Plan-time validation found one or more wiring problems (§4.7).
    #[error("plan validation failed with {} diagnostic(s)", .0.len())]
    ValidationFailed(Vec<Diagnostic>),
}

/// Expands `cell` into a [`Plan`], resolving each instance's `agent_type`
/// against `pool` and parsing its ingress/egress URIs, then validates
/// the result (§4.7 `Plan`).
///
/// # Errors
/// Returns [`PlanError::UnknownAgentType`] or
/// [`PlanError::InvalidChannelUri`] as soon as one instance fails to
/// resolve, or [`PlanError::ValidationFailed`] if every instance resolves
/// individually but the wiring as a whole violates §4.7's invariants
/// (every subscribed topic has a publisher or is external; every pipe has
/// at most one producer and one consumer).
pub fn plan(cell: &CellDef, pool: &PoolFile) -> Result<Plan, PlanError> {
    let mut instances = Vec::with_capacity(cell.agents.len());
    for def in &cell.agents {
        let entry = pool.find(&def.agent_type).ok_or_else(|| PlanError::UnknownAgentType {
            instance: def.id.clone(),
            agent_type: def.agent_type.clone(),
        })?;
        let ingress = channel_uri::parse(&def.ingress, Side::Ingress)
            .map_err(|source| PlanError::InvalidChannelUri { instance: def.id.clone(), source })?;
        let egress = channel_uri::parse(&def.egress, Side::Egress)
            .map_err(|source| PlanError::InvalidChannelUri { instance: def.id.clone(), source })?;
        instances.push(PlannedInstance { def: def.clone(), ingress, egress, binary: entry.binary.clone() });
    }

    let diagnostics = validate(&instances);
    if !diagnostics.is_empty() {
        return Err(PlanError::ValidationFailed(diagnostics));
    }

    Ok(Plan { cell_id: cell.id.clone(), instances })
}

/// Checks the cross-instance wiring invariants from §4.7: every
/// subscribed topic is produced by some instance (an external producer
/// is assumed for topics fed by a `file:` source, since those enter the
/// broker through a different instance's `pub:` egress rather than this
/// one), and every pipe has at most one producer and one consumer.
fn validate(instances: &[PlannedInstance]) -> Vec<Diagnostic> {
    use std::collections::HashMap;

    let mut diagnostics = Vec::new();
    let mut published_topics = std::collections::HashSet::new();
    let mut pipe_producers: HashMap<String, Vec<&str>> = HashMap::new();
    let mut pipe_consumers: HashMap<String, Vec<&str>> = HashMap::new();

    for instance in instances {
        match &instance.egress {
            ChannelUri::Publish(topic) => {
                published_topics.insert(topic.to_string());
            }
            ChannelUri::PipeOut(pipe) => {
                pipe_producers.entry(pipe.to_string()).or_default().push(&instance.def.id);
            }
            _ => {}
        }
        if let ChannelUri::PipeIn(pipe) = &instance.ingress {
            pipe_consumers.entry(pipe.to_string()).or_default().push(&instance.def.id);
        }
    }

    for instance in instances {
        if let ChannelUri::Subscribe(topic) = &instance.ingress {
            if !published_topics.contains(&topic.to_string()) {
                diagnostics.push(Diagnostic {
                    agent_id: Some(instance.def.id.clone()),
                    detail: format!("sub:{topic}"),
                    reason: format!("no agent instance publishes topic {topic}"),
                });
            }
        }
    }

    for (pipe, producers) in &pipe_producers {
        if producers.len() > 1 {
            diagnostics.push(Diagnostic {
                agent_id: None,
                detail: format!("pipe:{pipe}"),
                reason: format!("pipe has {} producers ({}), at most one is allowed", producers.len(), producers.join(", ")),
            });
        }
    }
    for (pipe, consumers) in &pipe_consumers {
        if consumers.len() > 1 {
            diagnostics.push(Diagnostic {
                agent_id: None,
                detail: format!("pipe:{pipe}"),
                reason: format!("pipe has {} consumers ({}), at most one is allowed", consumers.len(), consumers.join(", ")),
            });
        }
    }

    diagnostics
}
