//! Ring-buffered batch framer (component B).
//!
//! Encodes payloads directly into reusable ring slots (true zero-copy on
//! the flush path: [`flush_batch`](BatchFramer::flush_batch) borrows slot
//! bytes straight into the vectored write, it never re-copies them into an
//! owned buffer), batches them until a threshold or timer fires, and
//! flushes via a scatter-gather write. Inbound bytes are fed through the
//! same decoder used by component A and surfaced as [`FramerEvent::Message`].

use std::{io::IoSlice, time::Instant};

use bytes::{Bytes, BytesMut};
use qwormhole_proto::{FrameDecoder, LENGTH_PREFIX_SIZE, encode_frame};
use tokio::{io::AsyncWrite, io::AsyncWriteExt, sync::mpsc};

use crate::{
    error::FramerError,
    ring::{RingBuffer, SlotRef},
};

/// Construction parameters for a [`BatchFramer`].
#[derive(Debug, Clone, Copy)]
pub struct BatchFramerConfig {
    /// Number of slots in the backing ring.
    pub num_slots: usize,
    /// Initial capacity of each ring slot, in bytes.
    pub slot_capacity: usize,
    /// `max_frame_length` enforced on the inbound decoder.
    pub max_frame_length: u32,
    /// Frames per batch before an immediate flush is triggered. Mirrors
    /// the session policy's `batch_size`/controller's `slice_size`; the
    /// framer itself does not decide this number, the caller (flow
    /// controller) does and passes it in via [`BatchFramer::set_batch_size`].
    pub batch_size: u32,
    /// Milliseconds to wait before a deferred flush fires when the batch
    /// threshold has not been reached. `None` disables the deferred timer.
    pub flush_interval_ms: Option<u64>,
    /// Whether to use vectored scatter-gather writes when a batch holds
    /// two or more buffers. When `false` (or the batch holds one buffer),
    /// buffers are concatenated and written once.
    pub use_writev: bool,
}

impl Default for BatchFramerConfig {
    fn default() -> Self {
        Self {
            num_slots: crate::ring::DEFAULT_RING_SLOTS,
            slot_capacity: crate::ring::DEFAULT_SLOT_CAPACITY,
            max_frame_length: qwormhole_proto::DEFAULT_MAX_FRAME_LENGTH,
            batch_size: 32,
            flush_interval_ms: None,
            use_writev: true,
        }
    }
}

/// Outcome of [`BatchFramer::encode_to_batch`]: tells the caller (the flow
/// controller) whether to flush now or arm a deferred-flush timer. The
/// framer never schedules its own timers; that belongs to the async driver
/// loop that owns a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Nothing to do; the batch hasn't reached threshold and a timer is
    /// already armed (or no timer is configured).
    None,
    /// `pending_frames >= batch_size`; flush immediately.
    Immediate,
    /// No timer is armed yet and `flush_interval_ms > 0`; the caller should
    /// arm a one-shot timer that calls `flush_batch` when it fires.
    ArmTimer,
}

/// Events emitted by the framer, consumed by the flow controller and/or
/// connection driver over a single-producer channel (§9 design note).
#[derive(Debug)]
pub enum FramerEvent {
    /// A batch was detached and handed to the socket.
    Flush {
        /// Number of distinct buffers in the flushed batch.
        buffer_count: usize,
        /// Total bytes (header + payload) across the batch.
        total_bytes: u64,
    },
    /// A vectored write did not fully complete in one syscall.
    Backpressure {
        /// Bytes still queued for this flush.
        queued_bytes: u64,
    },
    /// The socket caught up; any deferred flush can proceed.
    Drain,
    /// A complete inbound frame payload.
    Message(Bytes),
    /// A framing or write error.
    Error(FramerError),
}

/// Cumulative framer counters (§4.B).
#[derive(Debug, Clone, Copy, Default)]
pub struct FramerStats {
    /// Frames that have completed a flush (successfully or via a vanished
    /// socket, per the "socket disappeared mid-batch" semantics).
    pub total_frames: u64,
    /// Number of completed flushes.
    pub total_flushes: u64,
    /// Bytes (header + payload) that have completed a flush.
    pub total_bytes: u64,
    /// Number of times a flush hit partial-write backpressure.
    pub backpressure_events: u64,
    /// Wall-clock time of the most recent completed flush.
    pub last_flush_at: Option<Instant>,
    /// Bytes still queued at the most recent backpressure event.
    pub last_backpressure_bytes: u64,
    /// Wall-clock time of the most recent backpressure event.
    pub last_backpressure_at: Option<Instant>,
}

/// A point-in-time view of framer stats plus currently pending work,
/// returned by [`BatchFramer::snapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FramerSnapshot {
    /// See [`FramerStats`].
    pub stats: FramerStats,
    /// Frames sitting in the not-yet-flushed batch at snapshot time.
    pub pending_frames: u32,
    /// Bytes sitting in the not-yet-flushed batch at snapshot time.
    pub pending_bytes: u64,
}

#[derive(Debug, Default)]
struct OutboundBatch {
    entries: Vec<SlotRef>,
    pending_bytes: u64,
}

impl OutboundBatch {
    fn push(&mut self, slot_ref: SlotRef, len: usize) {
        self.entries.push(slot_ref);
        self.pending_bytes += len as u64;
    }

    fn pending_frames(&self) -> u32 {
        self.entries.len() as u32
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Whether a write failed for real, or the socket simply vanished
/// mid-batch (§4.B failure semantics: the latter drops the batch silently
/// and still counts its bytes as written).
enum WriteOutcome {
    Written,
    SocketGone,
}

/// The ring-buffered batch framer (component B).
///
/// Generic over the socket type so `qwormhole-server`/`qwormhole-client`
/// can plug in a plain `TcpStream` or a TLS stream; both just need
/// `AsyncWrite + Unpin + Send`.
pub struct BatchFramer<S> {
    ring: RingBuffer,
    decoder: FrameDecoder,
    socket: Option<S>,
    batch: OutboundBatch,
    batch_size: u32,
    flush_interval_ms: Option<u64>,
    use_writev: bool,
    timer_armed: bool,
    draining: bool,
    events: mpsc::UnboundedSender<FramerEvent>,
    stats: FramerStats,
}

impl<S> BatchFramer<S>
where
    S: AsyncWrite + Unpin + Send,
{
    /// Construct a framer with no socket attached. Events are pushed to
    /// `events` as they occur; the caller owns the receiving half.
    #[must_use]
    pub fn new(config: BatchFramerConfig, events: mpsc::UnboundedSender<FramerEvent>) -> Self {
        Self {
            ring: RingBuffer::new(config.num_slots, config.slot_capacity),
            decoder: FrameDecoder::new(config.max_frame_length),
            socket: None,
            batch: OutboundBatch::default(),
            batch_size: config.batch_size.max(1),
            flush_interval_ms: config.flush_interval_ms,
            use_writev: config.use_writev,
            timer_armed: false,
            draining: false,
            events,
            stats: FramerStats::default(),
        }
    }

    /// Attach a live socket; flushes become possible once this is called.
    pub fn attach_socket(&mut self, socket: S) {
        self.socket = Some(socket);
    }

    /// Detach and return the current socket, if any. Any pending batch is
    /// left untouched (the caller typically tears down the connection
    /// right after, at which point [`Self::reset`] releases it).
    pub fn detach_socket(&mut self) -> Option<S> {
        self.socket.take()
    }

    /// Socket attached and the framer is not mid-drain.
    #[must_use]
    pub fn can_flush(&self) -> bool {
        self.socket.is_some()
    }

    /// The deferred-flush interval, if configured.
    #[must_use]
    pub fn flush_interval_ms(&self) -> Option<u64> {
        self.flush_interval_ms
    }

    /// Update the batch-size threshold (the flow controller's current
    /// `slice_size`).
    pub fn set_batch_size(&mut self, batch_size: u32) {
        self.batch_size = batch_size.max(1);
    }

    /// Current pending (not-yet-flushed) frame/byte counts.
    #[must_use]
    pub fn pending(&self) -> (u32, u64) {
        (self.batch.pending_frames(), self.batch.pending_bytes)
    }

    /// Encode `payload` into a ring slot (growing it if undersized) or, if
    /// every slot is busy, a transient heap buffer. Transient buffers never
    /// occupy a ring index (§9 resolved design decision).
    fn encode(&mut self, payload: &[u8]) -> (SlotRef, usize) {
        let needed = LENGTH_PREFIX_SIZE + payload.len();
        match self.ring.acquire(needed) {
            Some(idx) => {
                let mut framed = BytesMut::with_capacity(needed);
                encode_frame(payload, &mut framed);
                self.ring.write(idx, &framed);
                (SlotRef::Ring(idx), needed)
            },
            None => {
                let mut framed = BytesMut::with_capacity(needed);
                encode_frame(payload, &mut framed);
                (SlotRef::Transient(framed.freeze()), needed)
            },
        }
    }

    /// Encode `payload` and push it onto the current batch, returning
    /// whether the caller should flush now or arm a deferred-flush timer.
    pub fn encode_to_batch(&mut self, payload: &[u8]) -> FlushTrigger {
        let (slot_ref, len) = self.encode(payload);
        self.batch.push(slot_ref, len);

        if self.batch.pending_frames() >= self.batch_size {
            FlushTrigger::Immediate
        } else if !self.timer_armed && self.flush_interval_ms.is_some_and(|ms| ms > 0) {
            self.timer_armed = true;
            FlushTrigger::ArmTimer
        } else {
            FlushTrigger::None
        }
    }

    /// Flush the current batch via a scatter-gather write. No-op if the
    /// batch is empty, no socket is attached, or a previous flush is still
    /// awaiting drain.
    ///
    /// # Errors
    ///
    /// Returns [`FramerError::Write`] if the underlying write genuinely
    /// failed; a vanished socket (broken pipe / reset) is treated as a
    /// silent drop per §4.B and returns `Ok(())`.
    pub async fn flush_batch(&mut self) -> Result<(), FramerError> {
        self.timer_armed = false;

        if self.batch.is_empty() || self.socket.is_none() || self.draining {
            return Ok(());
        }

        let batch = self.batch.take();
        let buffer_count = batch.entries.len();
        let total_bytes = batch.pending_bytes;
        let _ = self.events.send(FramerEvent::Flush { buffer_count, total_bytes });

        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };

        let result = write_batch(
            &self.ring,
            socket,
            &batch.entries,
            self.use_writev,
            &self.events,
            &mut self.stats,
            &mut self.draining,
        )
        .await;

        for slot_ref in &batch.entries {
            if let SlotRef::Ring(idx) = slot_ref {
                self.ring.release(*idx);
            }
        }

        match result {
            Ok(WriteOutcome::Written) => {
                self.stats.total_frames += buffer_count as u64;
                self.stats.total_flushes += 1;
                self.stats.total_bytes += total_bytes;
                self.stats.last_flush_at = Some(Instant::now());
                Ok(())
            },
            Ok(WriteOutcome::SocketGone) => {
                // §4.B: dropped silently, bytes still counted as written.
                self.socket = None;
                self.stats.total_frames += buffer_count as u64;
                self.stats.total_flushes += 1;
                self.stats.total_bytes += total_bytes;
                self.stats.last_flush_at = Some(Instant::now());
                Ok(())
            },
            Err(e) => {
                let _ = self.events.send(FramerEvent::Error(e.clone()));
                Err(e)
            },
        }
    }

    /// Feed raw inbound bytes through the decoder, emitting each complete
    /// frame as [`FramerEvent::Message`].
    ///
    /// # Errors
    ///
    /// Returns [`FramerError::Protocol`] if an oversized frame poisons the
    /// decoder; the caller should tear down the connection.
    pub fn push_inbound(&mut self, chunk: &[u8]) -> Result<(), FramerError> {
        self.decoder.push(chunk)?;
        while let Some(frame) = self.decoder.next_frame()? {
            let _ = self.events.send(FramerEvent::Message(frame));
        }
        Ok(())
    }

    /// Clear accumulated inbound bytes and un-poison the decoder, and
    /// release any pending outbound batch without writing it.
    pub fn reset(&mut self) {
        self.decoder.reset();
        for slot_ref in self.batch.take().entries {
            if let SlotRef::Ring(idx) = slot_ref {
                self.ring.release(idx);
            }
        }
        self.timer_armed = false;
        self.draining = false;
    }

    /// Flush pending work and return a point-in-time stats snapshot,
    /// optionally zeroing the counters afterward.
    pub async fn snapshot(&mut self, reset: bool) -> FramerSnapshot {
        let _ = self.flush_batch().await;
        let (pending_frames, pending_bytes) = self.pending();
        let snapshot = FramerSnapshot { stats: self.stats, pending_frames, pending_bytes };
        if reset {
            self.stats = FramerStats::default();
        }
        snapshot
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_batch<S>(
    ring: &RingBuffer,
    socket: &mut S,
    entries: &[SlotRef],
    use_writev: bool,
    events: &mpsc::UnboundedSender<FramerEvent>,
    stats: &mut FramerStats,
    draining: &mut bool,
) -> Result<WriteOutcome, FramerError>
where
    S: AsyncWrite + Unpin + Send,
{
    let data: Vec<&[u8]> = entries
        .iter()
        .map(|slot_ref| match slot_ref {
            SlotRef::Ring(idx) => ring.slot_bytes(*idx),
            SlotRef::Transient(bytes) => bytes.as_ref(),
        })
        .collect();

    let total: usize = data.iter().map(|d| d.len()).sum();
    if total == 0 {
        return Ok(WriteOutcome::Written);
    }

    if !use_writev || data.len() < 2 {
        let mut combined = Vec::with_capacity(total);
        for d in &data {
            combined.extend_from_slice(d);
        }
        return write_vectored_loop(socket, &[combined.as_slice()], events, stats, draining).await;
    }

    write_vectored_loop(socket, &data, events, stats, draining).await
}

async fn write_vectored_loop<S>(
    socket: &mut S,
    data: &[&[u8]],
    events: &mpsc::UnboundedSender<FramerEvent>,
    stats: &mut FramerStats,
    draining: &mut bool,
) -> Result<WriteOutcome, FramerError>
where
    S: AsyncWrite + Unpin + Send,
{
    let total: usize = data.iter().map(|d| d.len()).sum();
    let mut written = vec![0usize; data.len()];
    let mut backpressure_seen = false;

    loop {
        let remaining: usize = data.iter().zip(&written).map(|(d, &w)| d.len() - w).sum();
        if remaining == 0 {
            break;
        }

        let slices: Vec<IoSlice<'_>> = data
            .iter()
            .zip(&written)
            .filter(|(d, &w)| w < d.len())
            .map(|(d, &w)| IoSlice::new(&d[w..]))
            .collect();

        let n = match socket.write_vectored(&slices).await {
            Ok(n) => n,
            Err(e) if is_socket_gone(&e) => return Ok(WriteOutcome::SocketGone),
            Err(e) => return Err(FramerError::Write(e.to_string())),
        };

        if n == 0 {
            return Err(FramerError::Write("write_vectored made no progress".to_string()));
        }

        distribute(&mut written, data, n);

        let remaining_after: usize = data.iter().zip(&written).map(|(d, &w)| d.len() - w).sum();
        if remaining_after > 0 && !backpressure_seen {
            backpressure_seen = true;
            *draining = true;
            stats.backpressure_events += 1;
            stats.last_backpressure_bytes = remaining_after as u64;
            stats.last_backpressure_at = Some(Instant::now());
            let _ = events.send(FramerEvent::Backpressure { queued_bytes: remaining_after as u64 });
        }
    }

    let _ = total;
    if backpressure_seen {
        *draining = false;
        let _ = events.send(FramerEvent::Drain);
    }

    Ok(WriteOutcome::Written)
}

fn distribute(written: &mut [usize], data: &[&[u8]], mut n: usize) {
    for (w, d) in written.iter_mut().zip(data.iter()) {
        if n == 0 {
            break;
        }
        let remaining = d.len() - *w;
        let take = remaining.min(n);
        *w += take;
        n -= take;
    }
}

/// Whether an I/O error indicates the peer vanished rather than a genuine
/// write failure (§4.B: the former drops the in-flight batch silently).
fn is_socket_gone(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::{BrokenPipe, ConnectionAborted, ConnectionReset, NotConnected, UnexpectedEof};
    matches!(e.kind(), BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;

    fn framer(config: BatchFramerConfig) -> (BatchFramer<DuplexStream>, mpsc::UnboundedReceiver<FramerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BatchFramer::new(config, tx), rx)
    }

    #[tokio::test]
    async fn flush_with_no_socket_is_noop() {
        let (mut f, _rx) = framer(BatchFramerConfig::default());
        assert_eq!(f.encode_to_batch(b"hello"), FlushTrigger::None);
        assert!(f.flush_batch().await.is_ok());
        assert_eq!(f.pending(), (1, 9));
    }

    #[tokio::test]
    async fn batch_threshold_triggers_immediate_flush() {
        let config = BatchFramerConfig { batch_size: 2, ..Default::default() };
        let (mut f, _rx) = framer(config);
        assert_eq!(f.encode_to_batch(b"a"), FlushTrigger::None);
        assert_eq!(f.encode_to_batch(b"b"), FlushTrigger::Immediate);
    }

    #[tokio::test]
    async fn flush_writes_frames_to_socket_and_counts_stats() {
        let (client, mut server) = tokio::io::duplex(4096);
        let config = BatchFramerConfig { batch_size: 100, ..Default::default() };
        let (mut f, mut rx) = framer(config);
        f.attach_socket(client);

        f.encode_to_batch(b"hello");
        f.encode_to_batch(b"world");
        f.flush_batch().await.unwrap();

        let snap = f.snapshot(false).await;
        assert_eq!(snap.stats.total_frames, 2);
        assert_eq!(snap.stats.total_bytes, (4 + 5) * 2);
        assert_eq!(snap.pending_frames, 0);

        let mut decoder = FrameDecoder::with_default_max_frame_length();
        let mut buf = [0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
        decoder.push(&buf[..n]).unwrap();
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn flush_emits_event() {
        let (client, _server) = tokio::io::duplex(4096);
        let config = BatchFramerConfig { batch_size: 100, ..Default::default() };
        let (mut f, mut rx) = framer(config);
        f.attach_socket(client);
        f.encode_to_batch(b"hi");
        f.flush_batch().await.unwrap();

        match rx.try_recv().unwrap() {
            FramerEvent::Flush { buffer_count, total_bytes } => {
                assert_eq!(buffer_count, 1);
                assert_eq!(total_bytes, 6);
            },
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_bytes_surface_as_message_events() {
        let (mut f, mut rx) = framer(BatchFramerConfig::default());
        let mut wire = Vec::new();
        encode_frame(b"ping", &mut wire);
        f.push_inbound(&wire).unwrap();

        match rx.try_recv().unwrap() {
            FramerEvent::Message(bytes) => assert_eq!(bytes.as_ref(), b"ping"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_inbound_frame_is_reported_and_poisons_decoder() {
        let config = BatchFramerConfig { max_frame_length: 4, ..Default::default() };
        let (mut f, mut rx) = framer(config);
        let mut wire = Vec::new();
        encode_frame(b"too-long", &mut wire);

        assert!(f.push_inbound(&wire).is_err());
        assert!(matches!(rx.try_recv().unwrap(), FramerEvent::Error(_)));
    }

    #[tokio::test]
    async fn reset_releases_pending_batch_slots() {
        let (mut f, _rx) = framer(BatchFramerConfig::default());
        f.encode_to_batch(b"a");
        assert_eq!(f.pending().0, 1);
        f.reset();
        assert_eq!(f.pending(), (0, 0));
    }
}
