//! WAV file standing in for the speaker.
//!
//! Pulls the scheduled audio out of the [`PlaybackScheduler`] in fixed blocks,
//! the way a device output callback would, and writes it as 16-bit mono PCM.
//! Blocks are rendered only once the playback clock has passed their end, so
//! a flush cuts the file at the same point a live speaker would go silent.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::core::audio::float_to_i16;
use crate::core::error::{CallError, CallResult};
use crate::core::playback::{PlaybackClock, PlaybackScheduler};

/// Output callback period.
pub const SPEAKER_BLOCK_MS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeakerReport {
    pub sample_rate: u32,
    pub samples_written: u64,
    /// Samples that carried scheduled audio rather than silence
    pub audible_samples: u64,
}

impl SpeakerReport {
    pub fn seconds_written(&self) -> f64 {
        self.samples_written as f64 / f64::from(self.sample_rate.max(1))
    }
}

pub struct WavSpeaker {
    writer: hound::WavWriter<BufWriter<File>>,
    scheduler: Arc<PlaybackScheduler>,
    clock: Arc<dyn PlaybackClock>,
    sample_rate: u32,
    block: Vec<f32>,
    blocks_rendered: u64,
    audible_samples: u64,
}

impl WavSpeaker {
    /// Create (or truncate) the output file.
    pub fn create(
        path: impl AsRef<Path>,
        scheduler: Arc<PlaybackScheduler>,
        clock: Arc<dyn PlaybackClock>,
        sample_rate: u32,
    ) -> CallResult<Self> {
        let path = path.as_ref();
        if sample_rate == 0 {
            return Err(CallError::InvalidConfig(
                "speaker sample rate must be greater than zero".to_string(),
            ));
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| {
            CallError::DeviceUnavailable(format!("cannot create {}: {e}", path.display()))
        })?;
        let block_len = (sample_rate * SPEAKER_BLOCK_MS / 1000).max(1) as usize;

        Ok(Self {
            writer,
            scheduler,
            clock,
            sample_rate,
            block: vec![0.0; block_len],
            blocks_rendered: 0,
            audible_samples: 0,
        })
    }

    fn block_start(&self, index: u64) -> f64 {
        (index * self.block.len() as u64) as f64 / f64::from(self.sample_rate)
    }

    /// Render every block that has fully elapsed. Returns how many were
    /// written.
    pub fn pump(&mut self) -> CallResult<usize> {
        let now = self.clock.now();
        let mut rendered = 0;
        while self.block_start(self.blocks_rendered + 1) <= now {
            self.render_block()?;
            rendered += 1;
        }
        Ok(rendered)
    }

    fn render_block(&mut self) -> CallResult<()> {
        let at = self.block_start(self.blocks_rendered);
        let audible = self.scheduler.render(&mut self.block, at, self.sample_rate);
        self.audible_samples += audible as u64;
        for sample in &self.block {
            self.writer
                .write_sample(float_to_i16(*sample))
                .map_err(|e| CallError::DeviceUnavailable(e.to_string()))?;
        }
        self.blocks_rendered += 1;
        Ok(())
    }

    pub fn report(&self) -> SpeakerReport {
        SpeakerReport {
            sample_rate: self.sample_rate,
            samples_written: self.blocks_rendered * self.block.len() as u64,
            audible_samples: self.audible_samples,
        }
    }

    /// Write the remaining elapsed blocks and close the file.
    pub fn finish(mut self) -> CallResult<SpeakerReport> {
        self.pump()?;
        let report = self.report();
        self.writer
            .finalize()
            .map_err(|e| CallError::DeviceUnavailable(e.to_string()))?;
        debug!(
            samples = report.samples_written,
            audible = report.audible_samples,
            "Speaker output closed"
        );
        Ok(report)
    }
}
