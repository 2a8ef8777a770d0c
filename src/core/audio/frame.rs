use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use super::pcm::PcmEncoding;

/// Which way a frame travels through the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDirection {
    /// Microphone → upstream
    Capture,
    /// Upstream → speaker
    Playback,
}

impl std::fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameDirection::Capture => write!(f, "capture"),
            FrameDirection::Playback => write!(f, "playback"),
        }
    }
}

/// A chunk of mono PCM audio moving between producer and consumer.
///
/// Frames are immutable once built; the payload is reference counted so
/// handing a frame to the next stage never copies samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    direction: FrameDirection,
    sample_rate: u32,
    /// `None` when the sender did not declare a format
    encoding: Option<PcmEncoding>,
    payload: Bytes,
    event_id: String,
}

impl AudioFrame {
    /// Capture-bound PCM16 frame built from samples.
    pub fn capture(samples: &[i16], sample_rate: u32, event_id: impl Into<String>) -> Self {
        Self {
            direction: FrameDirection::Capture,
            sample_rate,
            encoding: Some(PcmEncoding::Pcm16),
            payload: super::pcm::encode_pcm16_le(samples),
            event_id: event_id.into(),
        }
    }

    /// Playback-bound frame carrying raw bytes received from the upstream.
    pub fn playback(
        payload: Bytes,
        sample_rate: u32,
        encoding: Option<PcmEncoding>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            direction: FrameDirection::Playback,
            sample_rate,
            encoding,
            payload,
            event_id: event_id.into(),
        }
    }

    pub fn direction(&self) -> FrameDirection {
        self.direction
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn encoding(&self) -> Option<PcmEncoding> {
        self.encoding
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Number of samples, if the encoding is known.
    pub fn sample_count(&self) -> Option<usize> {
        self.encoding
            .map(|enc| self.payload.len() / enc.bytes_per_sample())
    }

    /// Playing time of the frame, if the encoding is known.
    pub fn duration(&self) -> Option<Duration> {
        let samples = self.sample_count()?;
        if self.sample_rate == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            samples as f64 / f64::from(self.sample_rate),
        ))
    }

    /// Base64 form of the payload, as carried in JSON events.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_frame_duration() {
        let samples = vec![0i16; 3200];
        let frame = AudioFrame::capture(&samples, 16_000, "event_1");
        assert_eq!(frame.direction(), FrameDirection::Capture);
        assert_eq!(frame.payload().len(), 6400);
        assert_eq!(frame.sample_count(), Some(3200));
        assert_eq!(frame.duration(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_playback_frame_without_declared_format() {
        let frame = AudioFrame::playback(Bytes::from_static(&[0, 0, 0]), 24_000, None, "resp");
        assert_eq!(frame.sample_count(), None);
        assert_eq!(frame.duration(), None);
        assert_eq!(frame.to_base64(), "AAAA");
    }
}
