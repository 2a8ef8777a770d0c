//! Audio frame type and PCM conversions shared by capture and playback.

pub mod frame;
pub mod pcm;

pub use frame::{AudioFrame, FrameDirection};
pub use pcm::{
    PcmEncoding, decode_pcm, detect_container, downsample_to_pcm16, encode_pcm16_le, float_to_i16,
    resolve_encoding, rms,
};
