// Battery diagnostics engine - library root
pub mod analysis;
pub mod domain;
pub mod engine;
pub mod infrastructure;

pub use domain::reading::Reading;
pub use domain::records::{
    CalibrationResult, DcirPoint, OcvPoint, QuickHealthResult, Recommendation,
};
pub use engine::calibration::CalibrationEngine;
pub use engine::quick_test::{PowerPreset, QuickHealthTest};
pub use engine::session::DiagnosticsSession;
pub use engine::StartError;
