// Simulated collaborators
//
// In-memory stand-ins for the hardware-facing capabilities, used by the demo
// binary and the engine tests. They record what was asked of them instead of
// driving anything.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::reading::Reading;
use crate::domain::records::{CalibrationResult, QuickHealthResult};
use crate::engine::capabilities::{
    ConstantPowerController, HistoryStore, LoadGenerator, LoadProfile,
};

use super::history::{CALIBRATION_HISTORY_CAP, QUICK_HISTORY_CAP};

/// History store backed by plain vectors, newest first, same caps as the
/// JSON store.
#[derive(Default)]
pub struct MemoryHistoryStore {
    calibrations: Mutex<Vec<CalibrationResult>>,
    quick_tests: Mutex<Vec<QuickHealthResult>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append_calibration(&self, result: &CalibrationResult) -> anyhow::Result<()> {
        let mut calibrations = self.calibrations.lock().unwrap();
        calibrations.insert(0, result.clone());
        calibrations.truncate(CALIBRATION_HISTORY_CAP);
        Ok(())
    }

    async fn append_quick(&self, result: &QuickHealthResult) -> anyhow::Result<()> {
        let mut quick_tests = self.quick_tests.lock().unwrap();
        quick_tests.insert(0, result.clone());
        quick_tests.truncate(QUICK_HISTORY_CAP);
        Ok(())
    }

    async fn calibration_history(&self) -> anyhow::Result<Vec<CalibrationResult>> {
        Ok(self.calibrations.lock().unwrap().clone())
    }

    async fn quick_history(&self) -> anyhow::Result<Vec<QuickHealthResult>> {
        Ok(self.quick_tests.lock().unwrap().clone())
    }
}

/// Load generator that only remembers the currently applied profile.
#[derive(Default)]
pub struct SimulatedLoadBank {
    applied: Mutex<Option<LoadProfile>>,
}

impl SimulatedLoadBank {
    pub fn applied(&self) -> Option<LoadProfile> {
        *self.applied.lock().unwrap()
    }
}

#[async_trait]
impl LoadGenerator for SimulatedLoadBank {
    async fn apply(&self, profile: LoadProfile) -> anyhow::Result<()> {
        *self.applied.lock().unwrap() = Some(profile);
        Ok(())
    }

    async fn off(&self) -> anyhow::Result<()> {
        *self.applied.lock().unwrap() = None;
        Ok(())
    }
}

/// Constant-power controller that tracks its target and nothing else.
#[derive(Default)]
pub struct SimulatedPowerController {
    target: Mutex<Option<f64>>,
}

impl SimulatedPowerController {
    /// The active target, or `None` when stopped.
    pub fn target(&self) -> Option<f64> {
        *self.target.lock().unwrap()
    }
}

#[async_trait]
impl ConstantPowerController for SimulatedPowerController {
    async fn start(&self, target_watts: f64) -> anyhow::Result<()> {
        *self.target.lock().unwrap() = Some(target_watts);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        *self.target.lock().unwrap() = None;
        Ok(())
    }

    async fn current_power(&self) -> anyhow::Result<f64> {
        Ok(self.target.lock().unwrap().unwrap_or(0.0))
    }
}

/// Simulated pack used by the demo binary. Discharges at a fixed
/// percentage-per-hour rate with a mild voltage sag toward empty.
pub struct SimulatedBattery {
    clock: DateTime<Utc>,
    soc: f64,
    pub discharge_per_hour: f64,
    pub design_capacity_mah: f64,
    pub max_capacity_mah: f64,
}

impl SimulatedBattery {
    pub fn new(start: DateTime<Utc>, soc: f64) -> Self {
        Self {
            clock: start,
            soc,
            discharge_per_hour: 10.0,
            design_capacity_mah: 5000.0,
            max_capacity_mah: 4650.0,
        }
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    /// Advance the simulation and emit the reading at the new instant.
    pub fn step(&mut self, elapsed: Duration) -> Reading {
        let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        self.clock += elapsed;
        self.soc = (self.soc - self.discharge_per_hour * hours).max(0.0);

        // 12.6 V full down to 10.8 V empty, linear.
        let voltage_v = 10.8 + 1.8 * self.soc / 100.0;
        let current_ma = -(self.discharge_per_hour / 100.0) * self.max_capacity_mah;

        Reading {
            timestamp: self.clock,
            percentage: self.soc.round() as u8,
            is_charging: false,
            on_battery: true,
            voltage_v,
            current_ma,
            temperature_c: 25.0,
            max_capacity_mah: self.max_capacity_mah,
            design_capacity_mah: self.design_capacity_mah,
        }
    }
}
