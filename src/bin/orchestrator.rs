//! `agen-orchestrator`: loads a pool and cell file, plans the instance
//! graph, and supervises the resulting processes (§4.7, §6.5).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use agen_cell::observability;
use agen_cell::orchestrator::{self, OrchestratorError};
use agen_cell::time_provider::production_time_provider;
use clap::Parser;

/// Loads `-config <cell-file>` against its pool and starts the cell under
/// supervision.
#[derive(Parser, Debug)]
#[command(name = "agen-orchestrator", version, about)]
struct Args {
    /// Path to the cell YAML file describing the instance graph (§6.3).
    #[arg(long = "config")]
    config: PathBuf,

    /// Path to the pool YAML file cataloging available agent types. Defaults
    /// to `pool.yaml` next to the cell file.
    #[arg(long)]
    pool: Option<PathBuf>,

    /// Validate and plan the cell without launching any instance.
    #[arg(long)]
    dry_run: bool,

    /// Directory handed to instances as `AGEN_WORKBENCH_DIR`.
    #[arg(long, default_value = "./workbench")]
    workbench_dir: String,

    /// Seconds to wait for each instance to report readiness.
    #[arg(long, default_value_t = orchestrator::supervisor::DEFAULT_STARTUP_TIMEOUT.as_secs())]
    startup_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    observability::init_tracing("agen_orchestrator=info,agen_cell=info");

    let pool_path = args.pool.clone().unwrap_or_else(|| {
        args.config.parent().unwrap_or_else(|| std::path::Path::new(".")).join("pool.yaml")
    });

    let (cell_yaml, pool_yaml) = match (std::fs::read_to_string(&args.config), std::fs::read_to_string(&pool_path)) {
        (Ok(cell), Ok(pool)) => (cell, pool),
        (cell_result, pool_result) => {
            if let Err(err) = cell_result {
                eprintln!("failed to read cell file {}: {err}", args.config.display());
            }
            if let Err(err) = pool_result {
                eprintln!("failed to read pool file {}: {err}", pool_path.display());
            }
            return ExitCode::from(1);
        }
    };

    if args.dry_run {
        return match dry_run(&cell_yaml, &pool_yaml) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(1)
            }
        };
    }

    let startup_timeout = Duration::from_secs(args.startup_timeout_secs);
    let handle = match orchestrator::launch_cell(
        &cell_yaml,
        &pool_yaml,
        &args.workbench_dir,
        startup_timeout,
        production_time_provider(),
    )
    .await
    {
        Ok(handle) => handle,
        Err(err) => {
            let (exit_code, stage) = match &err {
                OrchestratorError::Cell(_) | OrchestratorError::Pool(_) | OrchestratorError::Plan(_) => (1, "config"),
                OrchestratorError::Supervisor(_) => (2, "launch"),
            };
            eprintln!("orchestrator failed during {stage}: {err}");
            return ExitCode::from(exit_code);
        }
    };

    tracing::info!(cell_id = handle.cell_id(), "cell started");

    tokio::select! {
        () = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping cell");
            handle.stop(orchestrator::supervisor::DEFAULT_SHUTDOWN_TIMEOUT).await;
            ExitCode::SUCCESS
        }
        failed_agent_id = wait_for_supervisor_abort(&handle) => {
            eprintln!("orchestrator failed during runtime: agent {failed_agent_id} exhausted its restart budget");
            handle.stop(orchestrator::supervisor::DEFAULT_SHUTDOWN_TIMEOUT).await;
            ExitCode::from(3)
        }
    }
}

/// Polls the running cell's instance statuses and resolves with the first
/// instance id observed as permanently [`InstanceStatus::Failed`] after
/// startup — a monitor task exhausted its restart budget (§4.7 Failure
/// semantics, §6.5 exit code 3).
async fn wait_for_supervisor_abort(handle: &orchestrator::supervisor::Handle) -> String {
    loop {
        for (agent_id, status) in handle.statuses().await {
            if status == orchestrator::supervisor::InstanceStatus::Failed {
                return agent_id;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn dry_run(cell_yaml: &str, pool_yaml: &str) -> Result<(), OrchestratorError> {
    let cell_file = orchestrator::cell::CellFile::parse(cell_yaml)?;
    let pool_file = orchestrator::pool::PoolFile::parse(pool_yaml)?;
    let plan = orchestrator::plan::plan(&cell_file.cell, &pool_file)?;
    println!("cell {} plans cleanly with {} instance(s):", plan.cell_id, plan.instances.len());
    for instance in &plan.instances {
        println!("  {} ({}): {} -> {}", instance.def.id, instance.def.agent_type, instance.def.ingress, instance.def.egress);
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
