// Engine tuning configuration, loaded from TOML

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub quick_test: QuickTestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// SOC the battery must reach before the discharge arc starts.
    #[serde(default = "default_start_threshold")]
    pub start_threshold_percent: u8,
    /// SOC at which the calibration completes.
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold_percent: u8,
    /// Largest silent gap in the telemetry stream tolerated unconditionally.
    #[serde(default = "default_max_resume_gap")]
    pub max_resume_gap_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuickTestConfig {
    #[serde(default = "default_min_start_soc")]
    pub min_start_soc: u8,
    /// Baseline waits until SOC falls to this before the rest period starts.
    #[serde(default = "default_baseline_upper_soc")]
    pub baseline_upper_soc: u8,
    #[serde(default = "default_baseline_duration")]
    pub baseline_duration_secs: u64,
    #[serde(default = "default_pulse_duration")]
    pub pulse_duration_secs: u64,
    #[serde(default = "default_rest_duration")]
    pub rest_duration_secs: u64,
    /// Averaging window on each side of a pulse transition.
    #[serde(default = "default_dcir_window")]
    pub dcir_window_secs: f64,
    /// Descending SOC checkpoints for the staged pulse sequences.
    #[serde(default = "default_checkpoints")]
    pub checkpoints: Vec<u8>,
    /// SOC span covered by the constant-power energy window.
    #[serde(default = "default_cp_span")]
    pub cp_span_percent: u8,
    #[serde(default = "default_ocv_bin")]
    pub ocv_bin_percent: f64,
    /// Knee scoring band; a tunable, not a physical constant.
    #[serde(default = "default_knee_healthy_soc")]
    pub knee_healthy_soc: f64,
    #[serde(default = "default_knee_scoring_span")]
    pub knee_scoring_span: f64,
}

fn default_start_threshold() -> u8 {
    99
}

fn default_completion_threshold() -> u8 {
    5
}

fn default_max_resume_gap() -> u64 {
    1800
}

fn default_min_start_soc() -> u8 {
    85
}

fn default_baseline_upper_soc() -> u8 {
    95
}

fn default_baseline_duration() -> u64 {
    150
}

fn default_pulse_duration() -> u64 {
    10
}

fn default_rest_duration() -> u64 {
    25
}

fn default_dcir_window() -> f64 {
    3.0
}

fn default_checkpoints() -> Vec<u8> {
    vec![80, 60, 40, 20]
}

fn default_cp_span() -> u8 {
    30
}

fn default_ocv_bin() -> f64 {
    2.0
}

fn default_knee_healthy_soc() -> f64 {
    20.0
}

fn default_knee_scoring_span() -> f64 {
    30.0
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            start_threshold_percent: default_start_threshold(),
            completion_threshold_percent: default_completion_threshold(),
            max_resume_gap_secs: default_max_resume_gap(),
        }
    }
}

impl Default for QuickTestConfig {
    fn default() -> Self {
        Self {
            min_start_soc: default_min_start_soc(),
            baseline_upper_soc: default_baseline_upper_soc(),
            baseline_duration_secs: default_baseline_duration(),
            pulse_duration_secs: default_pulse_duration(),
            rest_duration_secs: default_rest_duration(),
            dcir_window_secs: default_dcir_window(),
            checkpoints: default_checkpoints(),
            cp_span_percent: default_cp_span(),
            ocv_bin_percent: default_ocv_bin(),
            knee_healthy_soc: default_knee_healthy_soc(),
            knee_scoring_span: default_knee_scoring_span(),
        }
    }
}

/// Load engine tuning from `config/engine.toml`; a missing file falls back
/// to the built-in defaults.
pub fn load_engine_config() -> anyhow::Result<EngineConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/engine").required(false))
        .build()?;

    Ok(settings.try_deserialize()?)
}
