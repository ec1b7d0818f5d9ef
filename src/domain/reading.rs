// Power telemetry reading domain model

use chrono::{DateTime, Utc};

/// One immutable snapshot from the power telemetry source.
///
/// Current follows the sign convention of the sampler: negative while
/// discharging, positive while charging.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// State of charge, 0-100.
    pub percentage: u8,
    pub is_charging: bool,
    pub on_battery: bool,
    pub voltage_v: f64,
    pub current_ma: f64,
    pub temperature_c: f64,
    pub max_capacity_mah: f64,
    pub design_capacity_mah: f64,
}

impl Reading {
    pub fn current_a(&self) -> f64 {
        self.current_ma / 1000.0
    }

    /// Instantaneous power draw in watts. Positive regardless of current
    /// sign; used for discharge energy integration.
    pub fn power_w(&self) -> f64 {
        self.voltage_v * self.current_ma.abs() / 1000.0
    }

    /// True when the sample can belong to a discharge arc.
    pub fn discharging(&self) -> bool {
        self.on_battery && !self.is_charging
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(current_ma: f64) -> Reading {
        Reading {
            timestamp: Utc::now(),
            percentage: 80,
            is_charging: false,
            on_battery: true,
            voltage_v: 12.0,
            current_ma,
            temperature_c: 25.0,
            max_capacity_mah: 4800.0,
            design_capacity_mah: 5000.0,
        }
    }

    #[test]
    fn test_power_is_positive_on_discharge() {
        let r = sample(-2000.0);
        assert!((r.power_w() - 24.0).abs() < 1e-9);
        assert!((r.current_a() + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_discharging_requires_battery_power() {
        let mut r = sample(-500.0);
        assert!(r.discharging());
        r.is_charging = true;
        assert!(!r.discharging());
    }
}
