//! Synthetic captures shared by the unit tests.

use std::path::PathBuf;

use bytes::Bytes;
use ffmpeg_next::Rational;

use crate::frame::{CapturedAudio, CapturedVideo, SourcePixelFormat};

pub fn bgra_frame(width: u32, height: u32, sequence: u64) -> CapturedVideo {
    let stride = width as usize * 4;
    let shade = (sequence * 16 % 256) as u8;
    CapturedVideo::packed(
        SourcePixelFormat::Bgra,
        width,
        height,
        stride,
        Rational(30, 1),
        Bytes::from(vec![shade; stride * height as usize]),
    )
    .with_sequence(sequence)
}

/// Planar float stereo at 48 kHz, a quiet sine so encoders see real signal.
pub fn stereo_chunk(samples: usize, sequence: u64) -> CapturedAudio {
    let mut data = Vec::with_capacity(samples * 4 * 2);
    for _ in 0..2 {
        for i in 0..samples {
            let t = (sequence as usize * samples + i) as f32 / 48000.0;
            let v = (t * 440.0 * std::f32::consts::TAU).sin() * 0.1;
            data.extend_from_slice(&v.to_ne_bytes());
        }
    }
    CapturedAudio::planar_f32(48000, 2, samples, samples * 4, Bytes::from(data))
        .with_sequence(sequence)
}

pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("restream-{}-{}", std::process::id(), name))
}
