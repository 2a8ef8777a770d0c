//! Raw audio inputs for the capture pipeline.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::error::{CallError, CallResult};

/// Samples per block pulled from a source, matching a typical device callback.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Native capture rate assumed for live devices.
pub const DEFAULT_DEVICE_SAMPLE_RATE: u32 = 48_000;

/// A producer of mono f32 blocks at a fixed native rate.
#[async_trait]
pub trait AudioSource: Send {
    /// Native sample rate of produced blocks.
    fn sample_rate(&self) -> u32;

    /// Next block, or `None` once the source is exhausted.
    async fn next_block(&mut self) -> CallResult<Option<Vec<f32>>>;
}

/// Source fed through a channel, for devices driven by their own callback
/// thread.
pub struct ChannelSource {
    sample_rate: u32,
    rx: mpsc::Receiver<Vec<f32>>,
}

impl ChannelSource {
    /// Returns the sender the device callback writes into, and the source.
    pub fn new(sample_rate: u32, capacity: usize) -> (mpsc::Sender<Vec<f32>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { sample_rate, rx })
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn next_block(&mut self) -> CallResult<Option<Vec<f32>>> {
        Ok(self.rx.recv().await)
    }
}

/// WAV file played back as if it were a microphone.
///
/// Multi-channel files are mixed down to mono. With pacing enabled each
/// block is released after its own playing time, like a live device.
pub struct WavSource {
    sample_rate: u32,
    samples: Vec<f32>,
    position: usize,
    block_size: usize,
    paced: bool,
}

impl WavSource {
    /// Open and fully decode a WAV file.
    ///
    /// An unreadable file maps to [`CallError::DeviceUnavailable`], the same
    /// way a busy or missing microphone does.
    pub fn open(path: impl AsRef<Path>, paced: bool) -> CallResult<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| {
            CallError::DeviceUnavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        Self::from_reader(reader, paced)
    }

    fn from_reader<R: std::io::Read>(
        reader: hound::WavReader<R>,
        paced: bool,
    ) -> CallResult<Self> {
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| CallError::DeviceUnavailable(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| CallError::DeviceUnavailable(e.to_string()))?
            }
        };

        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok(Self {
            sample_rate: spec.sample_rate,
            samples,
            position: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            paced,
        })
    }

    /// Override the block size (defaults to 4096 samples).
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Total playing time of the file.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

#[async_trait]
impl AudioSource for WavSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn next_block(&mut self) -> CallResult<Option<Vec<f32>>> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        let end = (self.position + self.block_size).min(self.samples.len());
        let block = self.samples[self.position..end].to_vec();
        self.position = end;

        if self.paced && self.sample_rate > 0 {
            let secs = block.len() as f64 / f64::from(self.sample_rate);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }

        Ok(Some(block))
    }
}
