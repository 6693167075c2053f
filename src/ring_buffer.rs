use crate::resolver::FrameSnapshot;
use crate::telemetry::TelemetrySample;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Bounded, insertion-ordered store of the most recent telemetry samples for one stream
pub struct FrameRingBuffer {
    /// Samples plus a cached snapshot of them
    inner: Mutex<BufferState>,
    /// Maximum number of samples retained
    capacity: usize,
    /// Statistics
    stats: RingBufferStats,
}

struct BufferState {
    samples: VecDeque<Arc<TelemetrySample>>,
    /// Bumped on every push and clear
    generation: u64,
    /// Snapshot taken at `generation`, if any
    cached: Option<(u64, FrameSnapshot)>,
}

/// Statistics for ring buffer monitoring
#[derive(Debug)]
pub struct RingBufferStats {
    /// Total samples pushed to buffer
    pub samples_pushed: AtomicU64,
    /// Samples dropped from the head on overflow
    pub samples_evicted: AtomicU64,
    /// Samples that arrived with a frame index below the tail's
    pub out_of_order: AtomicU64,
    /// Snapshots built (cache misses)
    pub snapshots_built: AtomicU64,
}

impl RingBufferStats {
    fn new() -> Self {
        Self {
            samples_pushed: AtomicU64::new(0),
            samples_evicted: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            snapshots_built: AtomicU64::new(0),
        }
    }

    /// Get current statistics as a snapshot
    pub fn snapshot(&self) -> RingBufferStatsSnapshot {
        RingBufferStatsSnapshot {
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            samples_evicted: self.samples_evicted.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            snapshots_built: self.snapshots_built.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of ring buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RingBufferStatsSnapshot {
    pub samples_pushed: u64,
    pub samples_evicted: u64,
    pub out_of_order: u64,
    pub snapshots_built: u64,
}

impl FrameRingBuffer {
    /// Create a new ring buffer holding at most `capacity` samples
    ///
    /// # Example
    /// ```
    /// use aerialsync::ring_buffer::FrameRingBuffer;
    ///
    /// let buffer = FrameRingBuffer::new(300);
    /// assert_eq!(buffer.size(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            panic!("Ring buffer capacity must be greater than 0");
        }

        debug!("Created frame ring buffer with capacity {}", capacity);

        Self {
            inner: Mutex::new(BufferState {
                samples: VecDeque::with_capacity(capacity),
                generation: 0,
                cached: None,
            }),
            capacity,
            stats: RingBufferStats::new(),
        }
    }

    /// Append a sample at the tail, evicting the head when full.
    ///
    /// A sample whose frame index is below the tail's is still appended;
    /// lookups degrade gracefully around it.
    pub fn push(&self, sample: impl Into<Arc<TelemetrySample>>) {
        let sample = sample.into();
        let mut state = self.inner.lock();

        if let Some(tail) = state.samples.back() {
            if sample.frame_index < tail.frame_index {
                self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                debug!(
                    stream_id = %sample.stream_id,
                    frame_index = sample.frame_index,
                    tail_index = tail.frame_index,
                    "Out-of-order sample appended at tail"
                );
            }
        }

        if state.samples.len() == self.capacity {
            if let Some(evicted) = state.samples.pop_front() {
                self.stats.samples_evicted.fetch_add(1, Ordering::Relaxed);
                trace!("Evicted frame {} from buffer head", evicted.frame_index);
            }
        }

        trace!(
            stream_id = %sample.stream_id,
            frame_index = sample.frame_index,
            "Pushing sample to buffer tail"
        );

        state.samples.push_back(sample);
        state.generation += 1;
        self.stats.samples_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Immutable view of the buffer as of this call.
    ///
    /// Later pushes or clears never affect a snapshot already handed out.
    pub fn snapshot(&self) -> FrameSnapshot {
        let mut state = self.inner.lock();

        if let Some((generation, snapshot)) = &state.cached {
            if *generation == state.generation {
                return snapshot.clone();
            }
        }

        let snapshot = FrameSnapshot::from_samples(state.samples.iter().cloned().collect());
        state.cached = Some((state.generation, snapshot.clone()));
        self.stats.snapshots_built.fetch_add(1, Ordering::Relaxed);
        snapshot
    }

    /// Most recently pushed sample
    pub fn latest(&self) -> Option<Arc<TelemetrySample>> {
        self.inner.lock().samples.back().cloned()
    }

    /// Clear all samples from the buffer
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.samples.clear();
        state.generation += 1;
        state.cached = None;
        debug!("Frame ring buffer cleared");
    }

    /// Current occupancy
    pub fn size(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get current buffer statistics
    pub fn stats(&self) -> RingBufferStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Builder for creating ring buffers with custom configuration
pub struct FrameRingBufferBuilder {
    capacity: Option<usize>,
}

impl FrameRingBufferBuilder {
    pub fn new() -> Self {
        Self { capacity: None }
    }

    /// Set the buffer capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Build the ring buffer with specified configuration
    pub fn build(self) -> Result<FrameRingBuffer, crate::error::SyncError> {
        let capacity = self.capacity.ok_or_else(|| {
            crate::error::SyncError::system("Ring buffer capacity must be specified")
        })?;

        if capacity == 0 {
            return Err(crate::error::SyncError::system(
                "Ring buffer capacity must be greater than 0",
            ));
        }

        Ok(FrameRingBuffer::new(capacity))
    }
}

impl Default for FrameRingBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}
