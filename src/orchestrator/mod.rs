//! Cell orchestrator: loading pool/cell YAML, planning the instance
//! graph, and supervising the resulting processes (§4.7).

pub mod cell;
pub mod channel_uri;
pub mod plan;
pub mod pool;
pub mod supervisor;

use thiserror::Error;

/// Aggregated error for the orchestrator subsystem, covering every stage
/// from loading YAML through supervising running instances.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A cell file failed to parse or validate.
    #[error(transparent)]
    Cell(#[from] cell::CellFileError),

    /// A pool file failed to parse or validate.
    #[error(transparent)]
    Pool(#[from] pool::PoolError),

    /// Planning a cell against a pool failed.
    #[error(transparent)]
    Plan(#[from] plan::PlanError),

    /// Starting or supervising a planned cell failed.
    #[error(transparent)]
    Supervisor(#[from] supervisor::SupervisorError),
}

/// Loads a cell file and its pool file, builds a [`plan::Plan`], and
/// starts it under supervision — the sequence an orchestrator binary
/// runs at startup (§4.7 `Start`, §6.5).
///
/// # Errors
/// Returns [`OrchestratorError`] for any failure along the way: bad YAML,
/// an unresolvable cross-instance wiring, or a launch/readiness failure.
pub async fn launch_cell(
    cell_yaml: &str,
    pool_yaml: &str,
    workbench_dir: &str,
    startup_timeout: std::time::Duration,
    time_provider: std::sync::Arc<dyn crate::time_provider::TimeProvider>,
) -> Result<supervisor::Handle, OrchestratorError> {
    let cell_file = cell::CellFile::parse(cell_yaml)?;
    let pool_file = pool::PoolFile::parse(pool_yaml)?;
    let built = plan::plan(&cell_file.cell, &pool_file)?;
    let handle = supervisor::start(&built, workbench_dir, startup_timeout, time_provider).await?;
    Ok(handle)
}
