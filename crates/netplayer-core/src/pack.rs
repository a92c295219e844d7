//! Gain, mixing and sample packing for sink writers.
//!
//! Frames travel through the pipeline as interleaved stereo `i32`, left-justified.
//! Gains are unsigned 16.16 fixed point where `0x10000` is unity.

use std::fmt;
use std::str::FromStr;

/// Unity gain in 16.16 fixed point.
pub const UNITY_GAIN: u32 = 0x10000;

/// DSD idle pattern placed in the low 24 bits of a DoP sample.
pub const DSD_SILENCE: i32 = 0x0069_6900;

const DOP_MARKER_A: u32 = 0x05;
const DOP_MARKER_B: u32 = 0xFA;

/// Scale `sample` by a 16.16 gain, saturating at the `i32` range.
#[inline]
pub fn gain(g: u32, sample: i32) -> i32 {
    if g == UNITY_GAIN {
        return sample;
    }
    let scaled = (sample as i64 * g as i64) >> 16;
    scaled.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Multiply two 16.16 gains.
#[inline]
pub fn combine_gain(a: u32, b: u32) -> u32 {
    ((a as u64 * b as u64) >> 16).min(u32::MAX as u64) as u32
}

/// Convert a linear float gain to 16.16 fixed point.
pub fn gain_from_f32(g: f32) -> u32 {
    if !g.is_finite() || g <= 0.0 {
        return 0;
    }
    (g as f64 * UNITY_GAIN as f64).round().min(u32::MAX as f64) as u32
}

/// Apply per-channel gain in place.
pub fn apply_gain(samples: &mut [i32], left: u32, right: u32) {
    if left == UNITY_GAIN && right == UNITY_GAIN {
        return;
    }
    for frame in samples.chunks_exact_mut(2) {
        frame[0] = gain(left, frame[0]);
        frame[1] = gain(right, frame[1]);
    }
}

/// Mix `incoming` into `outgoing` in place: `out * gain_out + in * gain_in`.
///
/// Only the shorter of the two slices is mixed.
pub fn cross_mix(outgoing: &mut [i32], incoming: &[i32], gain_out: u32, gain_in: u32) {
    for (o, i) in outgoing.iter_mut().zip(incoming) {
        let mixed = gain(gain_out, *o) as i64 + gain(gain_in, *i) as i64;
        *o = mixed.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
}

/// Output sample layout written to a byte-oriented sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S16Be,
    /// 24-bit samples in 4-byte containers, low-aligned.
    S24Le,
    S24Be,
    /// Packed 3-byte 24-bit samples.
    S24_3Le,
    S24_3Be,
    S32Le,
    S32Be,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S24_3Le | SampleFormat::S24_3Be => 3,
            SampleFormat::S24Le | SampleFormat::S24Be | SampleFormat::S32Le | SampleFormat::S32Be => 4,
        }
    }

    pub fn bytes_per_frame(self) -> usize {
        self.bytes_per_sample() * 2
    }

    /// Significant bits per sample; DoP needs at least 24.
    pub fn bits(self) -> u32 {
        match self {
            SampleFormat::S16Le | SampleFormat::S16Be => 16,
            SampleFormat::S32Le | SampleFormat::S32Be => 32,
            _ => 24,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::S24Le => "s24le",
            SampleFormat::S24Be => "s24be",
            SampleFormat::S24_3Le => "s24_3le",
            SampleFormat::S24_3Be => "s24_3be",
            SampleFormat::S32Le => "s32le",
            SampleFormat::S32Be => "s32be",
        };
        f.write_str(name)
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s16le" | "s16" => Ok(SampleFormat::S16Le),
            "s16be" => Ok(SampleFormat::S16Be),
            "s24le" | "s24" => Ok(SampleFormat::S24Le),
            "s24be" => Ok(SampleFormat::S24Be),
            "s24_3le" | "s24_3" => Ok(SampleFormat::S24_3Le),
            "s24_3be" => Ok(SampleFormat::S24_3Be),
            "s32le" | "s32" => Ok(SampleFormat::S32Le),
            "s32be" => Ok(SampleFormat::S32Be),
            other => Err(format!("unknown sample format '{other}'")),
        }
    }
}

/// Append `samples` to `out` in the given layout.
pub fn pack(samples: &[i32], format: SampleFormat, out: &mut Vec<u8>) {
    out.reserve(samples.len() * format.bytes_per_sample());
    for &s in samples {
        match format {
            SampleFormat::S16Le => out.extend_from_slice(&((s >> 16) as i16).to_le_bytes()),
            SampleFormat::S16Be => out.extend_from_slice(&((s >> 16) as i16).to_be_bytes()),
            SampleFormat::S24Le => out.extend_from_slice(&(s >> 8).to_le_bytes()),
            SampleFormat::S24Be => out.extend_from_slice(&(s >> 8).to_be_bytes()),
            SampleFormat::S24_3Le => out.extend_from_slice(&(s >> 8).to_le_bytes()[..3]),
            SampleFormat::S24_3Be => out.extend_from_slice(&(s >> 8).to_be_bytes()[1..]),
            SampleFormat::S32Le => out.extend_from_slice(&s.to_le_bytes()),
            SampleFormat::S32Be => out.extend_from_slice(&s.to_be_bytes()),
        }
    }
}

/// Inserts the alternating DoP marker byte above 16 DSD bits per channel.
///
/// The marker alternates per frame and must stay in phase across blocks, silence
/// included, so the phase only advances by frames the device actually accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct DopEncoder {
    odd: bool,
}

impl DopEncoder {
    /// Mark `samples` (interleaved stereo) in place starting at the current phase.
    pub fn encode(&self, samples: &mut [i32]) {
        let mut odd = self.odd;
        for frame in samples.chunks_exact_mut(2) {
            let marker = if odd { DOP_MARKER_B } else { DOP_MARKER_A };
            for s in frame {
                *s = ((marker << 24) | (*s as u32 & 0x00FF_FF00)) as i32;
            }
            odd = !odd;
        }
    }

    /// Advance the phase by `frames` delivered frames.
    pub fn commit(&mut self, frames: usize) {
        if frames % 2 == 1 {
            self.odd = !self.odd;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_gain_is_identity() {
        assert_eq!(gain(UNITY_GAIN, i32::MIN), i32::MIN);
        assert_eq!(gain(UNITY_GAIN, 12345), 12345);
    }

    #[test]
    fn gain_saturates() {
        assert_eq!(gain(UNITY_GAIN * 4, i32::MAX / 2), i32::MAX);
        assert_eq!(gain(UNITY_GAIN * 4, i32::MIN / 2), i32::MIN);
        assert_eq!(gain(UNITY_GAIN / 2, 1000), 500);
        assert_eq!(gain(0, 1000), 0);
    }

    #[test]
    fn float_gain_conversion() {
        assert_eq!(gain_from_f32(1.0), UNITY_GAIN);
        assert_eq!(gain_from_f32(0.5), UNITY_GAIN / 2);
        assert_eq!(gain_from_f32(-1.0), 0);
        assert_eq!(combine_gain(UNITY_GAIN, UNITY_GAIN / 4), UNITY_GAIN / 4);
    }

    #[test]
    fn cross_mix_blends_and_saturates() {
        let mut out = vec![1000, i32::MAX];
        cross_mix(&mut out, &[3000, i32::MAX], UNITY_GAIN / 2, UNITY_GAIN / 2);
        assert_eq!(out[0], 2000);
        assert_eq!(out[1], i32::MAX - 1);

        let mut out = vec![i32::MAX];
        cross_mix(&mut out, &[i32::MAX], UNITY_GAIN, UNITY_GAIN);
        assert_eq!(out[0], i32::MAX);
    }

    #[test]
    fn packs_common_layouts() {
        let s = [0x1234_5678_i32];
        let mut out = Vec::new();
        pack(&s, SampleFormat::S16Le, &mut out);
        assert_eq!(out, [0x34, 0x12]);

        out.clear();
        pack(&s, SampleFormat::S24_3Le, &mut out);
        assert_eq!(out, [0x56, 0x34, 0x12]);

        out.clear();
        pack(&s, SampleFormat::S24_3Be, &mut out);
        assert_eq!(out, [0x12, 0x34, 0x56]);

        out.clear();
        pack(&s, SampleFormat::S24Le, &mut out);
        assert_eq!(out, [0x56, 0x34, 0x12, 0x00]);

        out.clear();
        pack(&s, SampleFormat::S32Be, &mut out);
        assert_eq!(out, [0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("S24_3LE".parse::<SampleFormat>(), Ok(SampleFormat::S24_3Le));
        assert_eq!("s16".parse::<SampleFormat>(), Ok(SampleFormat::S16Le));
        assert!("f32".parse::<SampleFormat>().is_err());
        assert_eq!(SampleFormat::S24_3Le.bytes_per_frame(), 6);
    }

    #[test]
    fn dop_markers_alternate_per_frame_and_keep_phase() {
        let mut enc = DopEncoder::default();
        let mut block = vec![DSD_SILENCE; 6];
        enc.encode(&mut block);
        assert_eq!(block[0] as u32 >> 24, 0x05);
        assert_eq!(block[1] as u32 >> 24, 0x05);
        assert_eq!(block[2] as u32 >> 24, 0xFA);
        assert_eq!(block[4] as u32 >> 24, 0x05);
        assert_eq!(block[0] as u32 & 0x00FF_FFFF, 0x0069_6900);

        // Only one frame reached the device; the next block continues with 0xFA.
        enc.commit(1);
        let mut next = vec![DSD_SILENCE; 2];
        enc.encode(&mut next);
        assert_eq!(next[0] as u32 >> 24, 0xFA);
    }
}
