// Main entry point - Dependency injection and a simulated calibration run

use std::sync::Arc;

use chrono::{Duration, Utc};

use battery_diagnostics::engine::capabilities::{HistoryStore, NoReports};
use battery_diagnostics::infrastructure::config::load_engine_config;
use battery_diagnostics::infrastructure::history::JsonHistoryStore;
use battery_diagnostics::infrastructure::simulated::{
    SimulatedBattery, SimulatedLoadBank, SimulatedPowerController,
};
use battery_diagnostics::infrastructure::temperature::ReferenceNormalizer;
use battery_diagnostics::DiagnosticsSession;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = load_engine_config()?;

    // Create collaborators (infrastructure layer)
    let history = Arc::new(JsonHistoryStore::open("data/history.json").await?);
    let session = DiagnosticsSession::spawn(
        config,
        Arc::new(SimulatedLoadBank::default()),
        Arc::new(SimulatedPowerController::default()),
        Arc::new(ReferenceNormalizer::default()),
        history.clone(),
        Arc::new(NoReports),
    );

    // Drive a full simulated discharge through the calibration engine.
    session.start_calibration().await?;

    let mut battery = SimulatedBattery::new(Utc::now(), 100.0);
    session.submit(battery.step(Duration::zero())).await?;
    while battery.soc() > 4.0 {
        session.submit(battery.step(Duration::minutes(6))).await?;
        if let Some(progress) = session.progress().await?.progress {
            tracing::info!(
                phase = %progress.phase,
                fraction = progress.fraction,
                "calibration progress"
            );
        }
    }

    let results = history.calibration_history().await?;
    match results.first() {
        Some(result) => {
            println!(
                "Calibration complete: {}% -> {}% in {:.1} h, estimated runtime {:.1} h",
                result.start_percent,
                result.end_percent,
                result.duration_hours,
                result.estimated_runtime_hours,
            );
        }
        None => println!("Calibration did not complete"),
    }

    Ok(())
}
