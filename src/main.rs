use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info, warn};

use workpulse_lib::utils::logger::init_logging;
use workpulse_lib::{AppResult, AppState};

const DEFAULT_DB_PATH: &str = "workpulse.sqlite";
const DEFAULT_CLASSIFY_LIMIT: usize = 500;

#[tokio::main]
async fn main() -> ExitCode {
    let log_dir = std::env::var_os("WORKPULSE_LOG_DIR").map(PathBuf::from);
    if let Err(err) = init_logging(log_dir.as_deref()) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(target: "app::worker", error = %err, "worker run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let db_path = std::env::var_os("WORKPULSE_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let limit = std::env::var("WORKPULSE_CLASSIFY_LIMIT")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_CLASSIFY_LIMIT);

    let state = AppState::new(&db_path)?;
    info!(
        target: "app::worker",
        db_path = %db_path.display(),
        credentials = state.router().list().len(),
        "worker started"
    );

    let outcomes = state
        .router()
        .run_health_checks(state.provider_factory())
        .await;
    for outcome in outcomes.iter().filter(|outcome| !outcome.healthy) {
        warn!(
            target: "app::worker",
            credential_id = outcome.credential_id,
            provider = outcome.provider.as_str(),
            "credential failed health check"
        );
    }

    let report = state.dispatcher().classify_pending(limit).await?;
    for fatal in &report.fatal_errors {
        error!(target: "app::worker", error = %fatal, "batch aborted");
    }
    info!(
        target: "app::worker",
        batches = report.batches,
        classified = report.classified,
        fallback = report.fallback,
        "classification run finished"
    );
    Ok(())
}
