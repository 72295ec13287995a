//! The base agent object handed to every `Runner` (§4.6).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::domain_types::AgentId;
use crate::token_counter::TokenCounter;

/// Errors from the scoped filesystem abstraction.
#[derive(Debug, Error)]
pub enum ScopedFsError {
    /// The requested path escaped the agent's scoped root, e.g. via `..`.
    #[error("path escapes scoped root: {0}")]
    PathEscapesRoot(PathBuf),

    /// The underlying filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path the failing operation targeted.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Directory-scoped filesystem access: every path an agent requests is
/// joined under a fixed root and rejected if it would resolve outside it
/// (§4.6 `base` contract).
#[derive(Debug, Clone)]
pub struct ScopedFs {
    root: PathBuf,
}

impl ScopedFs {
    /// Creates a scoped filesystem rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, relative: &Path) -> Result<PathBuf, ScopedFsError> {
        if relative.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(ScopedFsError::PathEscapesRoot(relative.to_path_buf()));
        }
        Ok(self.root.join(relative))
    }

    /// Reads the full contents of `relative`, scoped under this instance's
    /// root.
    ///
    /// # Errors
    /// Returns [`ScopedFsError::PathEscapesRoot`] for a traversal attempt,
    /// or [`ScopedFsError::Io`] if the read itself fails.
    pub async fn read(&self, relative: &Path) -> Result<Vec<u8>, ScopedFsError> {
        let path = self.resolve(relative)?;
        tokio::fs::read(&path).await.map_err(|source| ScopedFsError::Io { path, source })
    }

    /// Writes `contents` to `relative`, scoped under this instance's root,
    /// creating parent directories as needed.
    ///
    /// # Errors
    /// Returns [`ScopedFsError::PathEscapesRoot`] for a traversal attempt,
    /// or [`ScopedFsError::Io`] if the write itself fails.
    pub async fn write(&self, relative: &Path, contents: &[u8]) -> Result<(), ScopedFsError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| ScopedFsError::Io { path: path.clone(), source })?;
        }
        tokio::fs::write(&path, contents).await.map_err(|source| ScopedFsError::Io { path, source })
    }
}

/// The object every `Runner` method receives: typed config access, a
/// scoped filesystem, the egress target for replies, an optional token
/// counter, and the cancellation token that propagates shutdown from the
/// orchestrator down into in-flight work (§4.6).
#[derive(Clone)]
pub struct BaseAgent {
    agent_id: AgentId,
    config: AgentConfig,
    fs: ScopedFs,
    egress: String,
    token_counter: Option<Arc<dyn TokenCounter>>,
    cancellation: CancellationToken,
}

impl BaseAgent {
    /// Assembles a base agent object from its resolved parts.
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        config: AgentConfig,
        fs: ScopedFs,
        egress: String,
        token_counter: Option<Arc<dyn TokenCounter>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self { agent_id, config, fs, egress, token_counter, cancellation }
    }

    /// This agent's identifier.
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// String-typed config lookup.
    #[must_use]
    pub fn get_config_string(&self, key: &str, default: &str) -> String {
        self.config.get_string(key, default)
    }

    /// Integer-typed config lookup.
    #[must_use]
    pub fn get_config_int(&self, key: &str, default: i64) -> i64 {
        self.config.get_int(key, default)
    }

    /// Boolean-typed config lookup.
    #[must_use]
    pub fn get_config_bool(&self, key: &str, default: bool) -> bool {
        self.config.get_bool(key, default)
    }

    /// This agent's scoped filesystem.
    #[must_use]
    pub fn fs(&self) -> &ScopedFs {
        &self.fs
    }

    /// The channel replies should be sent to.
    #[must_use]
    pub fn egress(&self) -> &str {
        &self.egress
    }

    /// The registered token counter for this agent's destination, if any.
    #[must_use]
    pub fn token_counter(&self) -> Option<Arc<dyn TokenCounter>> {
        self.token_counter.clone()
    }

    /// The cancellation token that fires when the dispatch loop is asked to
    /// shut down. Long-running `ProcessMessage` calls should select on it.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
