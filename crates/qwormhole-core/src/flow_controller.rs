//! Adaptive flow controller (component F).
//!
//! Owns the per-connection slice size (how many frames accumulate before a
//! flush) and the token bucket that paces flushes, and drifts the slice in
//! response to backpressure/drain signals and, optionally, event-loop-idle
//! and GC-pause telemetry sampled every few flushes.

use std::{collections::VecDeque, time::Duration, time::Instant};

use tokio::{io::AsyncWrite, sync::mpsc};

use crate::{
    env::{AdaptiveMode, Environment, SchedulerTelemetry},
    error::ConnectionError,
    framer::BatchFramer,
    token_bucket::TokenBucket,
};

const DEFAULT_SAMPLE_EVERY: u32 = 64;
const NATIVE_SAMPLE_EVERY: u32 = 16;
const DEFAULT_ADAPT_EVERY: u32 = 64;
const IDLE_TARGET: f64 = 0.20;
const GC_BUDGET_MS: f64 = 4.0;
const DRIFT_STEP: u32 = 2;
const CONTRACTION_STEP: u32 = 2;
const LERP_FACTOR: f64 = 0.25;
const EWMA_ALPHA: f64 = 0.2;
const GC_DECAY: f64 = 0.9;
/// Flushes a cooldown (armed on backpressure) pins the slice to `min_slice`
/// before adaptive drift resumes normal operation. Not spelled out
/// numerically upstream; chosen to span roughly one `adapt_every` window.
const COOLDOWN_FLUSHES: u32 = 8;
const HISTORY_CAP: usize = 100;

/// Construction parameters, derived from a [`qwormhole_proto::SessionFlowPolicy`]
/// plus any [`crate::env::EnvOverrides`].
#[derive(Debug, Clone, Copy)]
pub struct FlowControllerConfig {
    /// Table-preferred batch size for this policy tier.
    pub preferred_batch_size: u32,
    /// Lower bound on slice size.
    pub min_slice: u32,
    /// Upper bound on slice size (already peer-kind capped).
    pub max_slice: u32,
    /// Token-bucket burst ceiling, bytes.
    pub burst_budget_bytes: u64,
    /// Token-bucket refill rate, bytes/sec.
    pub rate_bytes_per_sec: u64,
    /// Whether the peer is treated as native (zero-copy-writev framing).
    pub peer_is_native: bool,
    /// Clamped negentropic index this policy was derived from.
    pub neg_index: f64,
    /// `FORCE_SLICE` override or an explicit per-connection pin: fixes
    /// `slice_size` and disables all drift.
    pub forced_slice: Option<u32>,
    /// Adaptive-drift mode; `AdaptiveMode::default_for_peer` unless
    /// overridden.
    pub adaptive_mode: AdaptiveMode,
}

/// Why a slice-size change occurred, reported in [`ControllerEvent::SliceDrift`]
/// and recorded in slice history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceDriftReason {
    /// A flush hit partial-write backpressure.
    Backpressure,
    /// The socket drained after backpressure.
    Drain,
    /// Periodic idle/GC-driven adaptive sampling.
    Adaptive,
}

/// Per-connection flush lifecycle state (§4.F state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No batch, no flush in flight.
    Idle,
    /// Frames accumulating toward `slice_size`.
    Batching,
    /// A reserve+write is in progress.
    Flushing,
    /// The socket is gone; pending frames are being drained by release,
    /// not write.
    Detached,
}

/// Events emitted by the controller, consumed by the connection driver for
/// server/client-level telemetry forwarding.
#[derive(Debug, Clone, Copy)]
pub enum ControllerEvent {
    /// A flush completed.
    Flush {
        /// Slice size in effect for this flush.
        slice_size: u32,
        /// Bytes written.
        bytes: u64,
        /// Milliseconds the flush waited on the token bucket.
        delay_ms: u64,
    },
    /// `slice_size` changed.
    SliceDrift {
        /// Why it changed.
        reason: SliceDriftReason,
        /// The new slice size.
        slice_size: u32,
    },
}

/// A single slice-history entry (§4.F diagnostics, ring-buffered at 100).
#[derive(Debug, Clone, Copy)]
pub struct SliceHistoryEntry {
    /// Slice size after the change.
    pub slice_size: u32,
    /// Why it changed.
    pub reason: SliceDriftReason,
    /// Wall-clock time of the change.
    pub at: Instant,
}

/// Point-in-time diagnostics (§4.F).
#[derive(Debug, Clone)]
pub struct ControllerDiagnostics {
    /// Current slice size.
    pub slice_size: u32,
    /// Whether drift is disabled by a forced slice.
    pub forced: bool,
    /// Current token-bucket refill rate.
    pub effective_rate_bytes_per_sec: u64,
    /// Current lifecycle state.
    pub state: ControllerState,
    /// Most recent slice-history entries, oldest first, capped at 100.
    pub history: Vec<SliceHistoryEntry>,
    /// Current EWMA idle-ratio sample.
    pub idle_ewma: f64,
    /// Current decayed max GC pause sample.
    pub gc_pause_max_ms: f64,
    /// Backpressure events since the last adaptive decision.
    pub backpressure_count: u32,
}

/// The adaptive flow controller (component F).
pub struct FlowController<E: Environment> {
    bucket: TokenBucket,
    slice_size: u32,
    min_slice: u32,
    max_slice: u32,
    peer_is_native: bool,
    neg_index: f64,
    forced: bool,
    adaptive_mode: AdaptiveMode,
    state: ControllerState,
    flush_in_flight: bool,
    pending_reflush: bool,
    backpressure_count: u32,
    cooldown_flushes_remaining: u32,
    since_sample: u32,
    since_adapt: u32,
    sample_every: u32,
    adapt_every: u32,
    idle_ewma: f64,
    gc_pause_max_ms: f64,
    last_refill_at: Option<E::Instant>,
    history: VecDeque<SliceHistoryEntry>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl<E: Environment> FlowController<E> {
    /// Construct a controller from a resolved session flow policy (via
    /// [`FlowControllerConfig`]).
    #[must_use]
    pub fn new(config: FlowControllerConfig, events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        let forced = config.forced_slice.is_some();
        let slice_size = config
            .forced_slice
            .unwrap_or_else(|| (config.preferred_batch_size / 2).clamp(config.min_slice, config.max_slice));
        let sample_every = if config.peer_is_native { NATIVE_SAMPLE_EVERY } else { DEFAULT_SAMPLE_EVERY };

        Self {
            bucket: TokenBucket::new(config.rate_bytes_per_sec, config.burst_budget_bytes),
            slice_size,
            min_slice: config.min_slice,
            max_slice: config.max_slice,
            peer_is_native: config.peer_is_native,
            neg_index: config.neg_index,
            forced,
            adaptive_mode: config.adaptive_mode,
            state: ControllerState::Idle,
            flush_in_flight: false,
            pending_reflush: false,
            backpressure_count: 0,
            cooldown_flushes_remaining: 0,
            since_sample: 0,
            since_adapt: 0,
            sample_every,
            adapt_every: DEFAULT_ADAPT_EVERY,
            idle_ewma: 1.0,
            gc_pause_max_ms: 0.0,
            last_refill_at: None,
            history: VecDeque::with_capacity(HISTORY_CAP),
            events,
        }
    }

    /// Current slice size.
    #[must_use]
    pub fn slice_size(&self) -> u32 {
        self.slice_size
    }

    /// Whether the slice is pinned (no drift ever applied).
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Replace the token bucket's refill rate (`FORCE_RATE_BYTES` override).
    pub fn override_rate_bytes_per_sec(&mut self, rate: u64) {
        self.bucket.set_rate_bytes_per_sec(rate);
    }

    /// Encode `payload` into the framer's batch and flush if threshold is
    /// reached.
    ///
    /// # Errors
    ///
    /// Propagates [`ConnectionError`] from a failed flush.
    pub async fn enqueue<S, T>(
        &mut self,
        payload: &[u8],
        framer: &mut BatchFramer<S>,
        env: &E,
        telemetry: &T,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin + Send,
        T: SchedulerTelemetry,
    {
        framer.encode_to_batch(payload);
        self.schedule_flush(framer, env, telemetry, false).await
    }

    /// Force a flush regardless of threshold (heartbeats, graceful close).
    ///
    /// # Errors
    ///
    /// Propagates [`ConnectionError`] from a failed flush.
    pub async fn force_flush<S, T>(
        &mut self,
        framer: &mut BatchFramer<S>,
        env: &E,
        telemetry: &T,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin + Send,
        T: SchedulerTelemetry,
    {
        self.schedule_flush(framer, env, telemetry, true).await
    }

    async fn schedule_flush<S, T>(
        &mut self,
        framer: &mut BatchFramer<S>,
        env: &E,
        telemetry: &T,
        force: bool,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin + Send,
        T: SchedulerTelemetry,
    {
        let (pending_frames, _) = framer.pending();
        if pending_frames == 0 {
            self.state = ControllerState::Idle;
            return Ok(());
        }
        if pending_frames < self.slice_size && !force {
            self.state = ControllerState::Batching;
            return Ok(());
        }
        if !framer.can_flush() {
            self.state = ControllerState::Batching;
            return Ok(());
        }
        if self.flush_in_flight {
            if force {
                self.pending_reflush = true;
            }
            return Ok(());
        }

        loop {
            self.flush_in_flight = true;
            self.state = ControllerState::Flushing;
            let result = self.flush(framer, env, telemetry).await;
            self.flush_in_flight = false;
            result?;

            let (remaining, _) = framer.pending();
            self.state = if remaining > 0 { ControllerState::Batching } else { ControllerState::Idle };

            if self.pending_reflush {
                self.pending_reflush = false;
                continue;
            }
            break;
        }
        Ok(())
    }

    async fn flush<S, T>(
        &mut self,
        framer: &mut BatchFramer<S>,
        env: &E,
        telemetry: &T,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin + Send,
        T: SchedulerTelemetry,
    {
        let (_, pending_bytes) = framer.pending();

        let now = env.now();
        let elapsed = self.last_refill_at.map_or(Duration::ZERO, |prev| now - prev);
        self.last_refill_at = Some(now);

        let wait_ms = self.bucket.reserve(pending_bytes, elapsed);
        if wait_ms > 0 {
            env.sleep(Duration::from_millis(wait_ms)).await;
        }

        framer.flush_batch().await?;

        let _ = self.events.send(ControllerEvent::Flush { slice_size: self.slice_size, bytes: pending_bytes, delay_ms: wait_ms });

        self.maybe_sample(telemetry);
        self.maybe_adapt();

        Ok(())
    }

    /// React to a framer backpressure event: halve the slice (unless
    /// forced) and arm a cooldown window.
    pub fn on_backpressure(&mut self) {
        self.backpressure_count += 1;
        self.cooldown_flushes_remaining = COOLDOWN_FLUSHES;
        if self.forced {
            return;
        }
        let new_slice = (self.slice_size / 2).max(self.min_slice);
        self.set_slice(new_slice, SliceDriftReason::Backpressure);
    }

    /// React to a framer drain event: grow the slice by the base drift
    /// step (unless forced).
    pub fn on_drain(&mut self) {
        if self.forced {
            return;
        }
        let new_slice = (self.slice_size + DRIFT_STEP).min(self.max_slice);
        self.set_slice(new_slice, SliceDriftReason::Drain);
    }

    /// Release any pending batch without writing it and mark the
    /// controller detached (socket is gone).
    pub fn mark_detached<S>(&mut self, framer: &mut BatchFramer<S>)
    where
        S: AsyncWrite + Unpin + Send,
    {
        framer.reset();
        self.state = ControllerState::Detached;
    }

    /// Snapshot current diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> ControllerDiagnostics {
        ControllerDiagnostics {
            slice_size: self.slice_size,
            forced: self.forced,
            effective_rate_bytes_per_sec: self.bucket.rate_bytes_per_sec(),
            state: self.state,
            history: self.history.iter().copied().collect(),
            idle_ewma: self.idle_ewma,
            gc_pause_max_ms: self.gc_pause_max_ms,
            backpressure_count: self.backpressure_count,
        }
    }

    fn maybe_sample<T: SchedulerTelemetry>(&mut self, telemetry: &T) {
        self.since_sample += 1;
        if self.since_sample < self.sample_every {
            return;
        }
        self.since_sample = 0;

        let idle = telemetry.idle_ratio();
        self.idle_ewma = EWMA_ALPHA * idle + (1.0 - EWMA_ALPHA) * self.idle_ewma;

        let gc = telemetry.recent_gc_pause_ms();
        self.gc_pause_max_ms = gc.max(self.gc_pause_max_ms * GC_DECAY);
    }

    fn maybe_adapt(&mut self) {
        self.since_adapt += 1;
        if self.since_adapt < self.adapt_every {
            return;
        }
        self.since_adapt = 0;

        if self.adaptive_mode == AdaptiveMode::Off || self.forced {
            self.backpressure_count = 0;
            return;
        }

        if self.cooldown_flushes_remaining > 0 {
            self.cooldown_flushes_remaining -= 1;
            self.backpressure_count = 0;
            self.set_slice(self.min_slice, SliceDriftReason::Adaptive);
            return;
        }

        let good =
            self.idle_ewma >= IDLE_TARGET && self.gc_pause_max_ms <= GC_BUDGET_MS && self.backpressure_count == 0;

        let target = if good {
            let expansion = if self.neg_index >= 0.9 {
                (self.max_slice / 3).max(1)
            } else if self.neg_index >= 0.85 || self.peer_is_native {
                (self.max_slice / 4).max(1)
            } else {
                DRIFT_STEP
            };
            self.slice_size.saturating_add(expansion).min(self.max_slice)
        } else {
            let contraction =
                if self.gc_pause_max_ms > GC_BUDGET_MS * 1.5 { CONTRACTION_STEP * 2 } else { CONTRACTION_STEP };
            self.slice_size.saturating_sub(contraction).max(self.min_slice)
        };

        self.backpressure_count = 0;

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let new_slice = if self.adaptive_mode == AdaptiveMode::Aggressive {
            target
        } else {
            let lerped = f64::from(self.slice_size) + (f64::from(target) - f64::from(self.slice_size)) * LERP_FACTOR;
            lerped.round() as u32
        }
        .clamp(self.min_slice, self.max_slice);

        self.set_slice(new_slice, SliceDriftReason::Adaptive);
    }

    fn set_slice(&mut self, new_slice: u32, reason: SliceDriftReason) {
        if new_slice == self.slice_size {
            return;
        }
        self.slice_size = new_slice;
        if self.history.len() >= HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(SliceHistoryEntry { slice_size: new_slice, reason, at: Instant::now() });
        let _ = self.events.send(ControllerEvent::SliceDrift { reason, slice_size: new_slice });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::AtomicU64};

    use tokio::io::DuplexStream;

    use super::*;
    use crate::framer::{BatchFramerConfig, FramerEvent};

    #[derive(Clone)]
    struct TestEnv {
        nanos: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { nanos: Arc::new(AtomicU64::new(0)) }
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_nanos(self.nanos.load(std::sync::atomic::Ordering::Relaxed))
        }

        async fn sleep(&self, duration: Duration) {
            self.nanos.fetch_add(u64::try_from(duration.as_nanos()).unwrap_or(0), std::sync::atomic::Ordering::Relaxed);
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    #[derive(Clone, Copy, Default)]
    struct TestTelemetry {
        idle: f64,
        gc_ms: f64,
    }

    impl SchedulerTelemetry for TestTelemetry {
        fn idle_ratio(&self) -> f64 {
            self.idle
        }

        fn recent_gc_pause_ms(&self) -> f64 {
            self.gc_ms
        }
    }

    fn config() -> FlowControllerConfig {
        FlowControllerConfig {
            preferred_batch_size: 32,
            min_slice: 4,
            max_slice: 64,
            burst_budget_bytes: 1_000_000,
            rate_bytes_per_sec: 1_000_000,
            peer_is_native: false,
            neg_index: 0.7,
            forced_slice: None,
            adaptive_mode: AdaptiveMode::Guarded,
        }
    }

    fn controller(cfg: FlowControllerConfig) -> (FlowController<TestEnv>, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FlowController::new(cfg, tx), rx)
    }

    fn framer() -> (BatchFramer<DuplexStream>, mpsc::UnboundedReceiver<FramerEvent>) {
        let (client, _server) = tokio::io::duplex(1 << 20);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut f = BatchFramer::new(BatchFramerConfig { batch_size: 1000, ..Default::default() }, tx);
        f.attach_socket(client);
        (f, rx)
    }

    #[test]
    fn initial_slice_size_is_half_preferred_clamped() {
        let (controller, _rx) = controller(config());
        assert_eq!(controller.slice_size(), 16);
    }

    #[test]
    fn forced_slice_pins_and_disables_drift() {
        let mut cfg = config();
        cfg.forced_slice = Some(10);
        let (mut controller, _rx) = controller(cfg);
        assert!(controller.is_forced());
        assert_eq!(controller.slice_size(), 10);
        controller.on_backpressure();
        assert_eq!(controller.slice_size(), 10);
        controller.on_drain();
        assert_eq!(controller.slice_size(), 10);
    }

    #[test]
    fn backpressure_halves_slice_and_emits_drift() {
        let (mut controller, mut rx) = controller(config());
        controller.on_backpressure();
        assert_eq!(controller.slice_size(), 8);
        assert!(matches!(rx.try_recv().unwrap(), ControllerEvent::SliceDrift { reason: SliceDriftReason::Backpressure, slice_size: 8 }));
    }

    #[test]
    fn backpressure_never_drops_below_min_slice() {
        let mut cfg = config();
        cfg.min_slice = 4;
        let (mut controller, _rx) = controller(cfg);
        for _ in 0..10 {
            controller.on_backpressure();
        }
        assert_eq!(controller.slice_size(), 4);
    }

    #[test]
    fn drain_grows_slice_by_step_and_clamps_to_max() {
        let mut cfg = config();
        cfg.max_slice = 20;
        let (mut controller, _rx) = controller(cfg);
        for _ in 0..10 {
            controller.on_drain();
        }
        assert_eq!(controller.slice_size(), 20);
    }

    #[tokio::test]
    async fn flush_drains_token_bucket_and_sleeps_when_exhausted() {
        let mut cfg = config();
        cfg.rate_bytes_per_sec = 100;
        cfg.burst_budget_bytes = 100;
        let (mut controller, _rx) = controller(cfg);
        let (mut f, _frx) = framer();
        let env = TestEnv::new();
        let telemetry = TestTelemetry::default();

        for _ in 0..20 {
            controller.enqueue(b"0123456789", &mut f, &env, &telemetry).await.unwrap();
        }
        controller.force_flush(&mut f, &env, &telemetry).await.unwrap();

        assert!(env.now() > Duration::ZERO, "expected the controller to have slept for refill");
    }

    #[tokio::test]
    async fn aggressive_mode_snaps_slice_to_target_under_good_conditions() {
        let mut cfg = config();
        cfg.adaptive_mode = AdaptiveMode::Aggressive;
        cfg.peer_is_native = true;
        cfg.neg_index = 0.95;
        cfg.max_slice = 64;
        let (mut controller, _rx) = controller(cfg);
        let (mut f, _frx) = framer();
        let env = TestEnv::new();
        let telemetry = TestTelemetry { idle: 1.0, gc_ms: 0.0 };

        let before = controller.slice_size();
        for _ in 0..(NATIVE_SAMPLE_EVERY.max(DEFAULT_ADAPT_EVERY) as usize + 1) {
            controller.enqueue(b"x", &mut f, &env, &telemetry).await.unwrap();
            controller.force_flush(&mut f, &env, &telemetry).await.unwrap();
        }
        assert!(controller.slice_size() > before, "expected slice to expand under good telemetry");
    }

    #[tokio::test]
    async fn guarded_mode_interpolates_rather_than_snapping() {
        let mut cfg = config();
        cfg.adaptive_mode = AdaptiveMode::Guarded;
        cfg.max_slice = 64;
        let (mut controller, _rx) = controller(cfg);
        let (mut f, _frx) = framer();
        let env = TestEnv::new();
        let telemetry = TestTelemetry { idle: 1.0, gc_ms: 0.0 };

        for _ in 0..(DEFAULT_SAMPLE_EVERY as usize + 1) {
            controller.enqueue(b"x", &mut f, &env, &telemetry).await.unwrap();
            controller.force_flush(&mut f, &env, &telemetry).await.unwrap();
        }
        // Guarded interpolation toward a base drift_step=2 target:
        // 16 + (18 - 16) * 0.25 = 16.5, rounds away from zero to 17.
        assert_eq!(controller.slice_size(), 17);
    }

    #[test]
    fn diagnostics_reports_current_state() {
        let (mut controller, _rx) = controller(config());
        controller.on_drain();
        let diag = controller.diagnostics();
        assert_eq!(diag.slice_size, 18);
        assert_eq!(diag.history.len(), 1);
        assert!(!diag.forced);
    }

    #[test]
    fn history_ring_caps_at_one_hundred_entries() {
        let mut cfg = config();
        cfg.max_slice = 1_000_000;
        let (mut controller, _rx) = controller(cfg);
        for _ in 0..150 {
            controller.on_drain();
        }
        assert_eq!(controller.diagnostics().history.len(), HISTORY_CAP);
    }
}
