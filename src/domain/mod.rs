// Domain layer - Battery telemetry and diagnostic result models
pub mod reading;
pub mod records;
