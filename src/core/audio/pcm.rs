//! Linear PCM helpers: decoding, encoding, sample-rate conversion and
//! container sniffing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::error::{CallError, CallResult};

/// Full-scale value of a signed 24-bit sample.
const PCM24_FULL_SCALE: f32 = 8_388_607.0;

/// Full-scale value used to normalise signed 16-bit samples.
const PCM16_FULL_SCALE: f32 = 32_768.0;

/// Supported linear PCM encodings (mono, little-endian, signed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcmEncoding {
    /// 16-bit signed little-endian
    #[default]
    Pcm16,
    /// 24-bit signed little-endian, packed in three bytes
    Pcm24,
}

impl PcmEncoding {
    /// Bytes per mono sample.
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Pcm16 => 2,
            Self::Pcm24 => 3,
        }
    }

    /// Protocol name of the encoding.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::Pcm24 => "pcm24",
        }
    }

    /// Parse a protocol format name. Returns `None` for non-linear formats.
    pub fn from_format(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcm16" | "pcm" | "pcm_s16le" | "s16le" => Some(Self::Pcm16),
            "pcm24" | "pcm_s24le" | "s24le" => Some(Self::Pcm24),
            _ => None,
        }
    }
}

impl std::fmt::Display for PcmEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identify a non-PCM container by its magic bytes.
///
/// Returns the container name when the payload starts with a known signature.
pub fn detect_container(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Some("wav");
    }
    if bytes.len() >= 4 {
        match &bytes[0..4] {
            b"RIFF" => return Some("riff"),
            b"OggS" => return Some("ogg"),
            b"fLaC" => return Some("flac"),
            [0x1A, 0x45, 0xDF, 0xA3] => return Some("webm"),
            _ => {}
        }
    }
    if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
        return Some("mp3");
    }
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return Some("mp4");
    }
    if is_mpeg_frame_header(bytes) {
        return Some("mpeg");
    }
    None
}

/// MPEG audio frame sync with a plausible header (valid version, layer,
/// bitrate and sample-rate indices). The extra checks keep ordinary PCM that
/// happens to start with 0xFFEx from being misread as MP3.
fn is_mpeg_frame_header(bytes: &[u8]) -> bool {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
        return false;
    }
    let version = (bytes[1] >> 3) & 0x03;
    let layer = (bytes[1] >> 1) & 0x03;
    let bitrate = bytes[2] >> 4;
    let sample_rate = (bytes[2] >> 2) & 0x03;
    version != 0b01 && layer != 0 && bitrate != 0 && bitrate != 0x0F && sample_rate != 0b11
}

/// Decide which PCM encoding a payload uses.
///
/// An explicit declaration wins but must agree with the payload length.
/// Without one, the length decides when it is divisible by exactly one of
/// the sample sizes; when it is divisible by both, `negotiated` decides.
pub fn resolve_encoding(
    len: usize,
    declared: Option<PcmEncoding>,
    negotiated: PcmEncoding,
) -> CallResult<PcmEncoding> {
    if len == 0 {
        return Err(CallError::MalformedFrame("empty payload".to_string()));
    }

    if let Some(encoding) = declared {
        if len % encoding.bytes_per_sample() != 0 {
            return Err(CallError::MalformedFrame(format!(
                "{len} bytes is not a whole number of {encoding} samples"
            )));
        }
        return Ok(encoding);
    }

    match (len % 2 == 0, len % 3 == 0) {
        (true, false) => Ok(PcmEncoding::Pcm16),
        (false, true) => Ok(PcmEncoding::Pcm24),
        (true, true) => Ok(negotiated),
        (false, false) => Err(CallError::MalformedFrame(format!(
            "{len} bytes matches no supported sample size"
        ))),
    }
}

/// Decode little-endian PCM into normalised floats in [-1, 1].
pub fn decode_pcm(bytes: &[u8], encoding: PcmEncoding) -> CallResult<Vec<f32>> {
    let width = encoding.bytes_per_sample();
    if bytes.len() % width != 0 {
        return Err(CallError::MalformedFrame(format!(
            "{} bytes is not a whole number of {encoding} samples",
            bytes.len()
        )));
    }

    let samples = match encoding {
        PcmEncoding::Pcm16 => bytes
            .chunks_exact(2)
            .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / PCM16_FULL_SCALE)
            .collect(),
        PcmEncoding::Pcm24 => bytes
            .chunks_exact(3)
            .map(|c| {
                let raw = i32::from(c[0]) | (i32::from(c[1]) << 8) | (i32::from(c[2]) << 16);
                // sign-extend bit 23
                let value = (raw << 8) >> 8;
                (value as f32 / PCM24_FULL_SCALE).clamp(-1.0, 1.0)
            })
            .collect(),
    };

    Ok(samples)
}

/// Convert a float sample to i16 using asymmetric full-scale factors.
#[inline]
pub fn float_to_i16(sample: f32) -> i16 {
    let v = sample.clamp(-1.0, 1.0);
    if v < 0.0 {
        (v * 32_768.0) as i16
    } else {
        (v * 32_767.0) as i16
    }
}

/// Convert a block of float samples to i16 without rate conversion.
pub fn float_to_pcm16(input: &[f32]) -> Vec<i16> {
    input.iter().copied().map(float_to_i16).collect()
}

/// Block-averaging downsample from `in_rate` to `out_rate`, producing i16.
///
/// Each output sample is the mean of the input samples that fall into its
/// window. Equal rates degenerate to a plain conversion. Trailing input that
/// does not fill a whole output window is dropped.
pub fn downsample_to_pcm16(input: &[f32], in_rate: u32, out_rate: u32) -> Vec<i16> {
    if in_rate == out_rate || out_rate == 0 {
        return float_to_pcm16(input);
    }

    let ratio = f64::from(in_rate) / f64::from(out_rate);
    let out_len = (input.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    let mut i = 0usize;
    for idx in 0..out_len {
        let next = (((idx + 1) as f64) * ratio).floor() as usize;
        let mut sum = 0.0f32;
        let mut count = 0usize;
        while i < next && i < input.len() {
            sum += input[i];
            count += 1;
            i += 1;
        }
        let mean = if count > 0 { sum / count as f32 } else { 0.0 };
        out.push(float_to_i16(mean));
    }

    out
}

/// Serialise i16 samples as little-endian bytes.
pub fn encode_pcm16_le(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(buf)
}

/// Root-mean-square energy of a block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_container_signatures() {
        assert_eq!(detect_container(b"RIFF\x24\x00\x00\x00WAVEfmt "), Some("wav"));
        assert_eq!(detect_container(b"OggS\x00\x02"), Some("ogg"));
        assert_eq!(detect_container(b"ID3\x04\x00"), Some("mp3"));
        assert_eq!(detect_container(b"fLaC\x00\x00"), Some("flac"));
        assert_eq!(detect_container(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]), Some("webm"));
        assert_eq!(detect_container(b"\x00\x00\x00\x18ftypmp42"), Some("mp4"));
        // MPEG-1 Layer III, 128 kbps, 44.1 kHz
        assert_eq!(detect_container(&[0xFF, 0xFB, 0x90, 0x64]), Some("mpeg"));
        // 0xFFE0 with a reserved version is just PCM
        assert_eq!(detect_container(&[0xFF, 0xE8, 0x00, 0x00]), None);
        assert_eq!(detect_container(&[0x00, 0x01, 0xFF, 0x7F]), None);
    }

    #[test]
    fn test_resolve_encoding_by_length() {
        assert_eq!(
            resolve_encoding(4, None, PcmEncoding::Pcm24).unwrap(),
            PcmEncoding::Pcm16
        );
        assert_eq!(
            resolve_encoding(9, None, PcmEncoding::Pcm16).unwrap(),
            PcmEncoding::Pcm24
        );
        // divisible by both: negotiated format decides
        assert_eq!(
            resolve_encoding(12, None, PcmEncoding::Pcm24).unwrap(),
            PcmEncoding::Pcm24
        );
        assert!(matches!(
            resolve_encoding(7, None, PcmEncoding::Pcm16),
            Err(CallError::MalformedFrame(_))
        ));
        assert!(resolve_encoding(0, None, PcmEncoding::Pcm16).is_err());
    }

    #[test]
    fn test_resolve_encoding_declared_must_match_length() {
        assert_eq!(
            resolve_encoding(6, Some(PcmEncoding::Pcm24), PcmEncoding::Pcm16).unwrap(),
            PcmEncoding::Pcm24
        );
        assert!(resolve_encoding(5, Some(PcmEncoding::Pcm16), PcmEncoding::Pcm16).is_err());
    }

    #[test]
    fn test_decode_pcm24_sign_extension() {
        // 0x7FFFFF (max), 0x800000 (min), 0xFFFFFF (-1)
        let bytes = [0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x80, 0xFF, 0xFF, 0xFF];
        let out = decode_pcm(&bytes, PcmEncoding::Pcm24).unwrap();
        assert_eq!(out.len(), 3);
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] + 1.0).abs() < 1e-6);
        assert!(out[2] < 0.0 && out[2] > -1e-6);
    }

    #[test]
    fn test_decode_pcm16_values() {
        let bytes = encode_pcm16_le(&[0, 16_384, -32_768]);
        let out = decode_pcm(&bytes, PcmEncoding::Pcm16).unwrap();
        assert_eq!(out, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_downsample_block_average() {
        // 48k -> 16k averages groups of three
        let input = [0.3, 0.3, 0.3, -0.6, -0.6, -0.6];
        let out = downsample_to_pcm16(&input, 48_000, 16_000);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], float_to_i16(0.3));
        assert_eq!(out[1], float_to_i16(-0.6));
    }

    #[test]
    fn test_downsample_identity_when_rates_match() {
        let input = [0.0, 1.0, -1.0, 2.0];
        let out = downsample_to_pcm16(&input, 16_000, 16_000);
        assert_eq!(out, vec![0, 32_767, -32_768, 32_767]);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_encoding_from_format() {
        assert_eq!(PcmEncoding::from_format("PCM16"), Some(PcmEncoding::Pcm16));
        assert_eq!(PcmEncoding::from_format("pcm24"), Some(PcmEncoding::Pcm24));
        assert_eq!(PcmEncoding::from_format("g711_ulaw"), None);
    }
}
