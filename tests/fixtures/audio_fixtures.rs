//! Audio Test Fixtures
//!
//! Generated audio keeps the tests free of binary files:
//! - Silence and sine tones as i16 samples
//! - PCM16 / PCM24 little-endian payloads
//! - Mono WAV files written with hound

use std::f32::consts::PI;
use std::path::Path;

use base64::prelude::*;

/// Capture rate of generated microphone input
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Rate of generated assistant speech
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Generate silence (zeros)
pub fn generate_silence(duration_samples: usize) -> Vec<i16> {
    vec![0i16; duration_samples]
}

/// Generate a sine tone with amplitude in 0.0 - 1.0
pub fn generate_sine_wave(
    frequency: f32,
    sample_rate: u32,
    duration_samples: usize,
    amplitude: f32,
) -> Vec<i16> {
    let peak = amplitude.clamp(0.0, 1.0) * i16::MAX as f32;
    (0..duration_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * PI * frequency * t).sin() * peak) as i16
        })
        .collect()
}

/// Speech-like input: tone bursts separated by silence
pub fn generate_utterance(sample_rate: u32, speech_ms: u32, silence_ms: u32) -> Vec<i16> {
    let speech = (sample_rate * speech_ms / 1000) as usize;
    let silence = (sample_rate * silence_ms / 1000) as usize;
    let mut samples = generate_silence(silence);
    samples.extend(generate_sine_wave(220.0, sample_rate, speech, 0.5));
    samples.extend(generate_silence(silence));
    samples
}

/// Little-endian PCM16 bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Little-endian 24-bit PCM bytes, scaling each i16 sample up by 8 bits
pub fn samples_to_pcm24_bytes(samples: &[i16]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| {
            let v = i32::from(*s) << 8;
            let b = v.to_le_bytes();
            [b[0], b[1], b[2]]
        })
        .collect()
}

/// Base64 payload of an audio delta
pub fn encode_delta(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Write a mono 16-bit WAV file
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for s in samples {
        writer.write_sample(*s).unwrap();
    }
    writer.finalize().unwrap();
}

/// Read every sample of a mono 16-bit WAV file
pub fn read_wav(path: &Path) -> (hound::WavSpec, Vec<i16>) {
    let reader = hound::WavReader::open(path).unwrap();
    let spec = reader.spec();
    let samples = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
    (spec, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_wave_peak() {
        let samples = generate_sine_wave(440.0, INPUT_SAMPLE_RATE, 1600, 0.5);
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 15_000 && peak <= 16_384);
    }

    #[test]
    fn test_pcm24_width() {
        assert_eq!(samples_to_pcm24_bytes(&[1, -1]).len(), 6);
        assert_eq!(samples_to_pcm24_bytes(&[-1]), vec![0x00, 0xFF, 0xFF]);
    }
}
