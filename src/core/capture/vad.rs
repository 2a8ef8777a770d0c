//! Energy-based speech onset/offset detection.
//!
//! Runs on raw capture blocks before resampling. Purely analytical: it never
//! alters the frame stream.

use serde::{Deserialize, Serialize};

use crate::core::audio::rms;

/// Thresholds for [`SpeechDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechDetectorConfig {
    /// RMS above which a block counts as loud
    pub threshold: f32,
    /// Consecutive loud blocks needed to declare onset
    pub onset_blocks: u32,
    /// Offset fires once consecutive quiet blocks exceed this
    pub offset_blocks: u32,
}

impl Default for SpeechDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            onset_blocks: 5,
            offset_blocks: 10,
        }
    }
}

/// Transition reported by [`SpeechDetector::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechTransition {
    Onset,
    Offset,
}

/// Hysteresis counters over per-block loudness.
#[derive(Debug, Clone)]
pub struct SpeechDetector {
    config: SpeechDetectorConfig,
    loud_blocks: u32,
    quiet_blocks: u32,
    speaking: bool,
}

impl SpeechDetector {
    pub fn new(config: SpeechDetectorConfig) -> Self {
        Self {
            config,
            loud_blocks: 0,
            quiet_blocks: 0,
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn loud_blocks(&self) -> u32 {
        self.loud_blocks
    }

    pub fn quiet_blocks(&self) -> u32 {
        self.quiet_blocks
    }

    /// Feed one raw block. Returns a transition when speaking state flips.
    pub fn process(&mut self, block: &[f32]) -> Option<SpeechTransition> {
        if block.is_empty() {
            return None;
        }

        if rms(block) > self.config.threshold {
            self.quiet_blocks = 0;
            self.loud_blocks = self.loud_blocks.saturating_add(1);
            if !self.speaking && self.loud_blocks >= self.config.onset_blocks {
                self.speaking = true;
                return Some(SpeechTransition::Onset);
            }
        } else {
            self.loud_blocks = 0;
            self.quiet_blocks = self.quiet_blocks.saturating_add(1);
            if self.speaking && self.quiet_blocks > self.config.offset_blocks {
                self.speaking = false;
                return Some(SpeechTransition::Offset);
            }
        }

        None
    }

    pub fn reset(&mut self) {
        self.loud_blocks = 0;
        self.quiet_blocks = 0;
        self.speaking = false;
    }
}

impl Default for SpeechDetector {
    fn default() -> Self {
        Self::new(SpeechDetectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOUD: [f32; 64] = [0.5; 64];
    const QUIET: [f32; 64] = [0.001; 64];

    #[test]
    fn test_onset_after_five_loud_blocks() {
        let mut vad = SpeechDetector::default();
        for _ in 0..4 {
            assert_eq!(vad.process(&LOUD), None);
        }
        assert_eq!(vad.process(&LOUD), Some(SpeechTransition::Onset));
        assert!(vad.is_speaking());
        // staying loud emits nothing further
        assert_eq!(vad.process(&LOUD), None);
    }

    #[test]
    fn test_quiet_block_resets_loud_run() {
        let mut vad = SpeechDetector::default();
        for _ in 0..4 {
            vad.process(&LOUD);
        }
        vad.process(&QUIET);
        assert_eq!(vad.loud_blocks(), 0);
        for _ in 0..4 {
            assert_eq!(vad.process(&LOUD), None);
        }
        assert_eq!(vad.process(&LOUD), Some(SpeechTransition::Onset));
    }

    #[test]
    fn test_offset_needs_more_than_ten_quiet_blocks() {
        let mut vad = SpeechDetector::default();
        for _ in 0..5 {
            vad.process(&LOUD);
        }
        for _ in 0..10 {
            assert_eq!(vad.process(&QUIET), None);
        }
        assert!(vad.is_speaking());
        assert_eq!(vad.process(&QUIET), Some(SpeechTransition::Offset));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_threshold() {
        let mut vad = SpeechDetector::new(SpeechDetectorConfig {
            onset_blocks: 1,
            ..Default::default()
        });
        assert_eq!(vad.process(&[0.019; 16]), None);
        assert_eq!(vad.process(&[0.021; 16]), Some(SpeechTransition::Onset));
    }

    #[test]
    fn test_reset() {
        let mut vad = SpeechDetector::default();
        for _ in 0..5 {
            vad.process(&LOUD);
        }
        vad.reset();
        assert!(!vad.is_speaking());
        assert_eq!(vad.loud_blocks(), 0);
        assert_eq!(vad.quiet_blocks(), 0);
    }
}
