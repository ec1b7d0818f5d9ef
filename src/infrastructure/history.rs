// JSON file history store
//
// One versioned file holds both result histories, newest first, each capped.
// Persistence failures surface as errors for the caller to log; the state
// machines keep running either way.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::records::{CalibrationResult, QuickHealthResult, SCHEMA_VERSION};
use crate::engine::capabilities::HistoryStore;

pub const CALIBRATION_HISTORY_CAP: usize = 5;
pub const QUICK_HISTORY_CAP: usize = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    schema_version: u32,
    #[serde(default)]
    calibrations: Vec<CalibrationResult>,
    #[serde(default)]
    quick_tests: Vec<QuickHealthResult>,
}

pub struct JsonHistoryStore {
    path: PathBuf,
    state: Mutex<HistoryFile>,
}

impl JsonHistoryStore {
    /// Open the store at `path`. A missing file means an empty history; a
    /// malformed one is an error rather than silent data loss.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("malformed history file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HistoryFile {
                schema_version: SCHEMA_VERSION,
                ..Default::default()
            },
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn write(&self, state: &HistoryFile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("cannot write {}", self.path.display()))
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn append_calibration(&self, result: &CalibrationResult) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.calibrations.insert(0, result.clone());
        state.calibrations.truncate(CALIBRATION_HISTORY_CAP);
        self.write(&state).await
    }

    async fn append_quick(&self, result: &QuickHealthResult) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.quick_tests.insert(0, result.clone());
        state.quick_tests.truncate(QUICK_HISTORY_CAP);
        self.write(&state).await
    }

    async fn calibration_history(&self) -> anyhow::Result<Vec<CalibrationResult>> {
        Ok(self.state.lock().await.calibrations.clone())
    }

    async fn quick_history(&self) -> anyhow::Result<Vec<QuickHealthResult>> {
        Ok(self.state.lock().await.quick_tests.clone())
    }
}
