//! Playback clock bridge: one resolve-and-draw cycle per display tick,
//! independent of telemetry arrival.

use crate::aggregator::IncidentAggregator;
use crate::overlay::{OverlayRenderer, OverlaySurface, RenderInstruction};
use crate::ring_buffer::FrameRingBuffer;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Consumer playback position
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackPosition {
    pub seconds: f64,
    pub paused: bool,
}

/// Anything with a playback position, typically a video element
pub trait PlaybackSource: Send + Sync {
    fn position(&self) -> PlaybackPosition;
}

/// Position pushed in by the owner of the real player
#[derive(Debug, Default)]
pub struct ExternalPlayback {
    position: Mutex<PlaybackPosition>,
}

impl ExternalPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, seconds: f64, paused: bool) {
        *self.position.lock() = PlaybackPosition { seconds, paused };
    }
}

impl PlaybackSource for ExternalPlayback {
    fn position(&self) -> PlaybackPosition {
        *self.position.lock()
    }
}

/// Position advancing with the tokio clock, for live views without a player
#[derive(Debug)]
pub struct WallClockPlayback {
    state: Mutex<WallClockState>,
}

#[derive(Debug)]
struct WallClockState {
    /// Seconds accumulated before `resumed_at`
    offset: f64,
    /// `None` while paused
    resumed_at: Option<Instant>,
}

impl WallClockPlayback {
    /// Start playing from zero
    pub fn start() -> Self {
        Self {
            state: Mutex::new(WallClockState {
                offset: 0.0,
                resumed_at: Some(Instant::now()),
            }),
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(resumed_at) = state.resumed_at.take() {
            state.offset += resumed_at.elapsed().as_secs_f64();
        }
    }

    pub fn play(&self) {
        let mut state = self.state.lock();
        if state.resumed_at.is_none() {
            state.resumed_at = Some(Instant::now());
        }
    }

    pub fn seek(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.offset = seconds.max(0.0);
        if state.resumed_at.is_some() {
            state.resumed_at = Some(Instant::now());
        }
    }
}

impl PlaybackSource for WallClockPlayback {
    fn position(&self) -> PlaybackPosition {
        let state = self.state.lock();
        match state.resumed_at {
            Some(resumed_at) => PlaybackPosition {
                seconds: state.offset + resumed_at.elapsed().as_secs_f64(),
                paused: false,
            },
            None => PlaybackPosition {
                seconds: state.offset,
                paused: true,
            },
        }
    }
}

/// Floor for the clock period; a zero period cannot drive a tokio interval
pub const MIN_TICK_INTERVAL: Duration = Duration::from_micros(1);

/// Shared between a clock and whoever retargets its inputs. Ticks hold it
/// for reading; holding it for writing waits out an in-flight draw.
pub type RenderGate = Arc<RwLock<()>>;

/// Frame index shown at `seconds` of playback, rounded down
pub fn frame_for_position(seconds: f64, frames_per_second: u32) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * frames_per_second as f64).floor() as u64
}

/// Playback loop statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackStats {
    pub ticks: u64,
    pub draws: u64,
    pub empty_ticks: u64,
    pub paused_ticks: u64,
    pub last_target_frame: Option<u64>,
    pub last_drawn_frame: Option<u64>,
    pub last_draw_time: Option<SystemTime>,
}

impl PlaybackStats {
    fn record_paused(&mut self) {
        self.ticks += 1;
        self.paused_ticks += 1;
    }

    fn record_empty(&mut self, target_frame: u64) {
        self.ticks += 1;
        self.empty_ticks += 1;
        self.last_target_frame = Some(target_frame);
    }

    fn record_draw(&mut self, target_frame: u64, frame_index: u64) {
        self.ticks += 1;
        self.draws += 1;
        self.last_target_frame = Some(target_frame);
        self.last_drawn_frame = Some(frame_index);
        self.last_draw_time = Some(SystemTime::now());
    }

    /// Share of running ticks that found a sample to draw
    pub fn hit_rate(&self) -> f64 {
        let running = self.draws + self.empty_ticks;
        if running == 0 {
            0.0
        } else {
            self.draws as f64 / running as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Paused,
    Empty { target_frame: u64 },
    Drawn { target_frame: u64, frame_index: u64 },
}

/// Reads the playback position, resolves the nearest sample and draws it
pub struct ClockBridge {
    buffer: Arc<FrameRingBuffer>,
    aggregator: Arc<IncidentAggregator>,
    renderer: OverlayRenderer,
    frames_per_second: u32,
    stats: Arc<Mutex<PlaybackStats>>,
    gate: RenderGate,
}

impl ClockBridge {
    pub fn new(
        buffer: Arc<FrameRingBuffer>,
        aggregator: Arc<IncidentAggregator>,
        renderer: OverlayRenderer,
        frames_per_second: u32,
    ) -> Self {
        Self {
            buffer,
            aggregator,
            renderer,
            frames_per_second: frames_per_second.max(1),
            stats: Arc::new(Mutex::new(PlaybackStats::default())),
            gate: RenderGate::default(),
        }
    }

    /// Share `gate` with the owner of the buffer and aggregator
    pub fn with_render_gate(mut self, gate: RenderGate) -> Self {
        self.gate = gate;
        self
    }

    /// Run one cycle against `surface`
    pub fn tick(
        &self,
        source: &dyn PlaybackSource,
        surface: &mut dyn OverlaySurface,
    ) -> TickOutcome {
        let position = source.position();
        if position.paused {
            surface.clear();
            self.stats.lock().record_paused();
            return TickOutcome::Paused;
        }

        let target_frame = frame_for_position(position.seconds, self.frames_per_second);
        let snapshot = self.buffer.snapshot();

        let Some(sample) = snapshot.resolve(target_frame) else {
            surface.clear();
            self.stats.lock().record_empty(target_frame);
            trace!(target_frame, "No buffered sample");
            return TickOutcome::Empty { target_frame };
        };

        let frame_index = sample.frame_index;
        let instruction = RenderInstruction {
            sample,
            target_frame,
            stats: self.aggregator.stats(),
            priority_active: self.aggregator.priority_active(),
        };
        self.renderer.render(&instruction, surface);
        self.stats.lock().record_draw(target_frame, frame_index);

        TickOutcome::Drawn {
            target_frame,
            frame_index,
        }
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats.lock().clone()
    }
}

/// Periodic playback task bound to a surface's lifetime.
///
/// Stops when `stop` is called, when the handle is dropped, or when the
/// cancellation token given at spawn is cancelled.
pub struct PlaybackClock {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<PlaybackStats>>,
}

impl PlaybackClock {
    pub fn spawn<S>(
        bridge: ClockBridge,
        source: Arc<dyn PlaybackSource>,
        surface: Arc<Mutex<S>>,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        S: OverlaySurface + 'static,
    {
        let stats = Arc::clone(&bridge.stats);
        let task_cancel = cancel.clone();

        let tick_interval = tick_interval.max(MIN_TICK_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_us = tick_interval.as_micros() as u64,
                "Playback clock started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let gate = bridge.gate.read();
                let mut guard = surface.lock();
                // Re-checked under the gate so nothing is drawn after cancellation
                if task_cancel.is_cancelled() {
                    break;
                }
                let outcome = bridge.tick(source.as_ref(), &mut *guard);
                drop(guard);
                drop(gate);
                trace!(?outcome, "Playback tick");
            }

            debug!("Playback clock stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
            stats,
        }
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Cancel the loop and wait for the task to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PlaybackClock {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
