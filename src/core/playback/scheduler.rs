//! Gapless playback scheduling with instant flush.
//!
//! Each decoded frame becomes a [`ScheduledBuffer`] that starts at
//! `max(now, cursor)`; the cursor then moves to the buffer's end, so
//! consecutive frames butt up against each other without gaps or overlap.
//! The queue and cursor share one lock: a flush can never interleave with an
//! enqueue and leave a buffer scheduled after the reset cursor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::clock::PlaybackClock;
use crate::core::audio::{AudioFrame, PcmEncoding, decode_pcm, detect_container, resolve_encoding};
use crate::core::error::{CallError, CallResult};
use crate::core::protocol::DEFAULT_OUTPUT_SAMPLE_RATE;

/// A decoded buffer placed on the playback timeline.
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    pub id: u64,
    /// Start time on the playback clock, in seconds
    pub start: f64,
    pub sample_rate: u32,
    pub samples: Arc<[f32]>,
}

impl ScheduledBuffer {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration()
    }
}

/// What `enqueue` scheduled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnqueueOutcome {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
    pub encoding: PcmEncoding,
    pub samples: usize,
}

#[derive(Debug)]
struct QueueState {
    buffers: VecDeque<ScheduledBuffer>,
    cursor: f64,
    next_id: u64,
}

/// Schedules synthesized speech for gapless output.
pub struct PlaybackScheduler {
    clock: Arc<dyn PlaybackClock>,
    state: Mutex<QueueState>,
    sample_rate: AtomicU32,
    negotiated: PcmEncoding,
    dropped: AtomicU64,
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("sample_rate", &self.sample_rate())
            .field("negotiated", &self.negotiated)
            .field("pending", &self.pending())
            .finish()
    }
}

impl PlaybackScheduler {
    /// Scheduler at the default output rate.
    ///
    /// `negotiated` breaks ties when a payload length fits more than one
    /// sample width and the frame declares nothing.
    pub fn new(clock: Arc<dyn PlaybackClock>, negotiated: PcmEncoding) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState {
                buffers: VecDeque::new(),
                cursor: 0.0,
                next_id: 0,
            }),
            sample_rate: AtomicU32::new(DEFAULT_OUTPUT_SAMPLE_RATE),
            negotiated,
            dropped: AtomicU64::new(0),
        }
    }

    /// Set the rate for frames enqueued from now on. Zero is ignored.
    pub fn configure(&self, sample_rate_hz: u32) {
        if sample_rate_hz == 0 {
            debug!("Ignoring zero playback sample rate");
            return;
        }
        let previous = self.sample_rate.swap(sample_rate_hz, Ordering::Relaxed);
        if previous != sample_rate_hz {
            debug!(from = previous, to = sample_rate_hz, "Playback sample rate changed");
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Decode and schedule one frame.
    ///
    /// The frame's own rate wins when set, otherwise the configured rate is
    /// used. Container payloads and undecidable lengths are rejected with
    /// [`CallError::MalformedFrame`] and leave the queue untouched.
    pub fn enqueue(&self, frame: &AudioFrame) -> CallResult<EnqueueOutcome> {
        let rate = match frame.sample_rate() {
            0 => self.sample_rate(),
            r => r,
        };
        self.enqueue_bytes(frame.payload(), frame.encoding(), rate)
    }

    fn enqueue_bytes(
        &self,
        payload: &[u8],
        declared: Option<PcmEncoding>,
        sample_rate: u32,
    ) -> CallResult<EnqueueOutcome> {
        let decoded = self.decode(payload, declared);
        let (encoding, samples) = match decoded {
            Ok(ok) => ok,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(bytes = payload.len(), error = %e, "Dropping playback frame");
                return Err(e);
            }
        };

        let samples: Arc<[f32]> = samples.into();
        let count = samples.len();

        let mut state = self.state.lock();
        let now = self.clock.now();
        let start = state.cursor.max(now);
        let id = state.next_id;
        state.next_id += 1;

        let buffer = ScheduledBuffer {
            id,
            start,
            sample_rate,
            samples,
        };
        let duration = buffer.duration();
        state.cursor = start + duration;
        state.buffers.push_back(buffer);

        Ok(EnqueueOutcome {
            id,
            start,
            duration,
            encoding,
            samples: count,
        })
    }

    fn decode(
        &self,
        payload: &[u8],
        declared: Option<PcmEncoding>,
    ) -> CallResult<(PcmEncoding, Vec<f32>)> {
        if let Some(container) = detect_container(payload) {
            return Err(CallError::MalformedFrame(format!(
                "{container} container is not raw PCM"
            )));
        }
        let encoding = resolve_encoding(payload.len(), declared, self.negotiated)?;
        let samples = decode_pcm(payload, encoding)?;
        Ok((encoding, samples))
    }

    /// Remove every scheduled buffer and reset the cursor to now.
    ///
    /// Returns how many buffers were flushed. Audible output stops at the
    /// next `render` call.
    pub fn stop_all(&self) -> usize {
        let mut state = self.state.lock();
        let flushed = state.buffers.len();
        state.buffers.clear();
        state.cursor = self.clock.now();
        if flushed > 0 {
            debug!(flushed, "Playback flushed");
        }
        flushed
    }

    /// Mix the scheduled audio covering `[at, at + out.len() / out_rate)`
    /// into `out` (overwriting it), resampling by nearest sample.
    ///
    /// Buffers that end inside the window are released. Returns the number
    /// of output samples that carried audio.
    pub fn render(&self, out: &mut [f32], at: f64, out_rate: u32) -> usize {
        out.fill(0.0);
        if out_rate == 0 || out.is_empty() {
            return 0;
        }

        let step = 1.0 / f64::from(out_rate);
        let window_end = at + out.len() as f64 * step;
        let mut written = 0usize;

        let mut state = self.state.lock();
        for buffer in state.buffers.iter() {
            if buffer.start >= window_end {
                break;
            }
            let end = buffer.end();
            if end <= at {
                continue;
            }
            let rate = f64::from(buffer.sample_rate);
            for (i, slot) in out.iter_mut().enumerate() {
                let t = at + i as f64 * step;
                if t < buffer.start || t >= end {
                    continue;
                }
                // epsilon keeps i / rate * rate from flooring to i - 1
                let idx = ((t - buffer.start) * rate + 1e-6) as usize;
                if let Some(sample) = buffer.samples.get(idx) {
                    *slot = *sample;
                    written += 1;
                }
            }
        }

        // half a sample of slack absorbs float error at buffer boundaries
        let release_before = window_end + step * 0.5;
        while state
            .buffers
            .front()
            .is_some_and(|b| b.end() <= release_before)
        {
            state.buffers.pop_front();
        }

        written
    }

    /// Drop buffers that have finished playing by the clock's current time.
    pub fn release_finished(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.buffers.len();
        state.buffers.retain(|b| b.end() > now);
        before - state.buffers.len()
    }

    /// Whether any scheduled audio is still due or playing.
    pub fn is_active(&self) -> bool {
        let now = self.clock.now();
        self.state.lock().buffers.iter().any(|b| b.end() > now)
    }

    /// Number of buffers currently held.
    pub fn pending(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Time at which the last scheduled buffer ends.
    pub fn cursor(&self) -> f64 {
        self.state.lock().cursor
    }

    /// Snapshot of the scheduled buffers, in start order.
    pub fn snapshot(&self) -> Vec<ScheduledBuffer> {
        self.state.lock().buffers.iter().cloned().collect()
    }

    /// Frames rejected as malformed since construction.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
