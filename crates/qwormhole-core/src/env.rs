//! Environment and scheduler-telemetry abstractions.
//!
//! Decouples the flow controller and connection drivers from system
//! resources (time, randomness, event-loop idleness) so tests can
//! substitute deterministic doubles. Production binaries use
//! [`TokioEnvironment`] / [`TokioSchedulerTelemetry`]; `qwormhole-harness`
//! provides the deterministic doubles used in tests.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Abstract environment providing time and randomness.
///
/// # Invariants
///
/// - `now()` never goes backwards within a single execution context.
/// - `random_bytes()` uses cryptographically secure entropy in production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment. Production uses
    /// `tokio::time::Instant`; deterministic test doubles use a manually
    /// advanceable virtual clock.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration. The only async method on this
    /// trait; protocol logic never calls it directly, only driver code.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Convenience: a random `u64`, e.g. for connection ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Event-loop idleness and GC-pause telemetry consumed by the adaptive
/// flow controller (component F). Implementations without a garbage
/// collector can return `0` for `recent_gc_pause_ms`; the controller
/// treats both readings as advisory (§9 design note).
pub trait SchedulerTelemetry: Clone + Send + Sync + 'static {
    /// `1 - normalized mean event-loop delay`, in `[0, 1]`. Higher means
    /// the loop spent more of its recent time idle.
    fn idle_ratio(&self) -> f64;

    /// Maximum GC pause observed since the last sample, in milliseconds.
    /// Always `0` for runtimes with no tracing GC.
    fn recent_gc_pause_ms(&self) -> f64;
}

/// Production `Environment` backed by real system time and a CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioEnvironment;

impl Environment for TokioEnvironment {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("system CSPRNG unavailable");
    }
}

/// Production `SchedulerTelemetry`.
///
/// Estimates idle ratio from a busy/idle accumulator that a background
/// sampling task resets every `sample_window`; a caller drives the
/// accumulator by calling [`TokioSchedulerTelemetry::record_busy`] around
/// the work it wants measured (the flush/write path). This crate has no
/// GC, so `recent_gc_pause_ms` is always `0` — advisory per §9, not a gap.
#[derive(Debug, Clone)]
pub struct TokioSchedulerTelemetry {
    busy_nanos: std::sync::Arc<AtomicU64>,
    window_nanos: std::sync::Arc<AtomicU64>,
    window: Duration,
}

impl TokioSchedulerTelemetry {
    /// Construct telemetry with the given sampling window. Idle ratio is
    /// `1 - busy_nanos / window.as_nanos()`, clamped to `[0, 1]`, reset
    /// every time the window elapses.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            busy_nanos: std::sync::Arc::new(AtomicU64::new(0)),
            window_nanos: std::sync::Arc::new(AtomicU64::new(
                u64::try_from(window.as_nanos()).unwrap_or(u64::MAX),
            )),
            window,
        }
    }

    /// Record that `elapsed` was spent doing blocking-ish work (a flush
    /// write) rather than idling. Called by the connection driver around
    /// its I/O suspension points.
    pub fn record_busy(&self, elapsed: Duration) {
        self.busy_nanos.fetch_add(u64::try_from(elapsed.as_nanos()).unwrap_or(0), Ordering::Relaxed);
    }

    /// Reset the busy accumulator, starting a new sampling window. Called
    /// periodically by a background task.
    pub fn reset_window(&self) {
        self.busy_nanos.store(0, Ordering::Relaxed);
    }
}

impl SchedulerTelemetry for TokioSchedulerTelemetry {
    fn idle_ratio(&self) -> f64 {
        let window = self.window_nanos.load(Ordering::Relaxed) as f64;
        if window <= 0.0 {
            return 1.0;
        }
        let busy = self.busy_nanos.load(Ordering::Relaxed) as f64;
        (1.0 - busy / window).clamp(0.0, 1.0)
    }

    fn recent_gc_pause_ms(&self) -> f64 {
        0.0
    }
}

impl Default for TokioSchedulerTelemetry {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Adaptive-drift mode, settable per connection and overridable by
/// [`EnvOverrides::adaptive_slices`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdaptiveMode {
    /// No adaptive drift; slice only reacts to backpressure/drain.
    Off,
    /// Interpolate toward the adaptive target by `lerp_factor` each step.
    #[default]
    Guarded,
    /// Snap directly to the adaptive target.
    Aggressive,
}

impl AdaptiveMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "guarded" => Some(Self::Guarded),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }

    /// The mode a connection should default to, given whether its peer is
    /// native: aggressive for native peers, guarded otherwise (§4.F).
    #[must_use]
    pub fn default_for_peer(peer_is_native: bool) -> Self {
        if peer_is_native { Self::Aggressive } else { Self::Guarded }
    }
}

/// Process-wide environment overrides (§6), read once at startup into an
/// explicit record rather than consulted ad hoc from protocol logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOverrides {
    /// `ADAPTIVE_SLICES={off|guarded|aggressive|auto}`. `auto` (or unset)
    /// means "no override, use the caller's configured/derived mode".
    pub adaptive_slices: Option<AdaptiveMode>,
    /// `FORCE_SLICE=<int>`: pins the controller's slice size.
    pub force_slice: Option<u32>,
    /// `FORCE_RATE_BYTES=<num>`: pins the token bucket's refill rate.
    pub force_rate_bytes_per_sec: Option<u64>,
}

impl EnvOverrides {
    /// Read overrides from the process environment. Malformed values for a
    /// variable are treated as absent (logged by the caller, not here,
    /// since this module has no I/O of its own).
    #[must_use]
    pub fn from_process_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides from an arbitrary lookup function; used by tests so
    /// they do not mutate real process environment variables.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let adaptive_slices = lookup("ADAPTIVE_SLICES").and_then(|v| {
            if v.eq_ignore_ascii_case("auto") { None } else { AdaptiveMode::parse(&v) }
        });
        let force_slice = lookup("FORCE_SLICE").and_then(|v| v.parse::<u32>().ok());
        let force_rate_bytes_per_sec = lookup("FORCE_RATE_BYTES").and_then(|v| v.parse::<u64>().ok());
        Self { adaptive_slices, force_slice, force_rate_bytes_per_sec }
    }
}
