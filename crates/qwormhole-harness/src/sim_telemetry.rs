//! Deterministic [`SchedulerTelemetry`] double: idle ratio and GC pause are
//! whatever the test last set, not sampled from a real runtime.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use qwormhole_core::SchedulerTelemetry;

/// A shared, clonable telemetry double whose readings a test sets directly
/// via [`SimTelemetry::set_idle_ratio`]/[`SimTelemetry::set_gc_pause_ms`],
/// for exercising the adaptive flow controller's drift decisions (§4.F)
/// without a real event loop.
#[derive(Clone)]
pub struct SimTelemetry {
    idle_ratio_bits: Arc<AtomicU64>,
    gc_pause_ms_bits: Arc<AtomicU64>,
}

impl SimTelemetry {
    /// Construct telemetry reporting full idle (`1.0`) and no GC pause,
    /// the "everything is fine" baseline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            idle_ratio_bits: Arc::new(AtomicU64::new(1.0f64.to_bits())),
            gc_pause_ms_bits: Arc::new(AtomicU64::new(0.0f64.to_bits())),
        }
    }

    /// Set the value the next `idle_ratio()` call reports.
    pub fn set_idle_ratio(&self, value: f64) {
        self.idle_ratio_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Set the value the next `recent_gc_pause_ms()` call reports.
    pub fn set_gc_pause_ms(&self, value: f64) {
        self.gc_pause_ms_bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for SimTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerTelemetry for SimTelemetry {
    fn idle_ratio(&self) -> f64 {
        f64::from_bits(self.idle_ratio_bits.load(Ordering::Relaxed))
    }

    fn recent_gc_pause_ms(&self) -> f64 {
        f64::from_bits(self.gc_pause_ms_bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_last_set_values() {
        let telemetry = SimTelemetry::new();
        assert!((telemetry.idle_ratio() - 1.0).abs() < f64::EPSILON);
        telemetry.set_idle_ratio(0.1);
        telemetry.set_gc_pause_ms(12.5);
        assert!((telemetry.idle_ratio() - 0.1).abs() < f64::EPSILON);
        assert!((telemetry.recent_gc_pause_ms() - 12.5).abs() < f64::EPSILON);
    }
}
