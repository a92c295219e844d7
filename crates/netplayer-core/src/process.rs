//! Sample-rate conversion between the decoder and the output buffer.
//!
//! Uses Rubato's streaming sinc resampler on fixed input chunks. Input frames are
//! accumulated until a chunk is full; the remainder is flushed with a partial chunk
//! at the end of the track.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::CodecError;

const CHANNELS: usize = 2;
const SCALE: f32 = 2_147_483_648.0;

struct Active {
    resampler: Async<f32>,
    chunk: usize,
    input: Vec<f32>,
    output: Vec<f32>,
}

/// Optional resampling step; passthrough while inactive.
#[derive(Default)]
pub(crate) struct Processor {
    active: Option<Active>,
}

impl Processor {
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Start converting `from` Hz input to `to` Hz.
    pub(crate) fn start(&mut self, from: u32, to: u32, chunk_frames: usize) -> Result<(), CodecError> {
        if from == 0 || to == 0 {
            return Err(CodecError::Unsupported(format!("cannot resample {from} Hz to {to} Hz")));
        }
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let chunk = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            to as f64 / from as f64,
            1.1,
            &params,
            chunk,
            CHANNELS,
            FixedAsync::Input,
        )
        .map_err(|e| CodecError::Backend(format!("resampler init: {e}")))?;

        let out_frames = resampler.output_frames_max();
        tracing::info!(from, to, chunk, "resampling enabled");
        self.active = Some(Active {
            resampler,
            chunk,
            input: Vec::with_capacity(chunk * CHANNELS),
            output: vec![0.0; out_frames * CHANNELS],
        });
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        self.active = None;
    }

    /// Convert interleaved stereo frames, appending whatever full chunks produce to `out`.
    pub(crate) fn process(&mut self, samples: &[i32], out: &mut Vec<i32>) {
        let Some(active) = self.active.as_mut() else {
            out.extend_from_slice(samples);
            return;
        };
        active
            .input
            .extend(samples.iter().map(|&s| s as f32 / SCALE));
        let chunk_samples = active.chunk * CHANNELS;
        while active.input.len() >= chunk_samples {
            if !active.run(active.chunk, None, out) {
                self.active = None;
                return;
            }
            active.input.drain(..chunk_samples);
        }
    }

    /// End of track: push the buffered remainder through as a partial chunk.
    pub(crate) fn drain(&mut self, out: &mut Vec<i32>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let tail = active.input.len() / CHANNELS;
        if tail > 0 {
            active.input.resize(active.chunk * CHANNELS, 0.0);
            active.run(active.chunk, Some(tail), out);
        }
        active.input.clear();
        let _ = active.resampler.reset();
    }
}

impl Active {
    /// Resample one chunk from the front of `input`. Returns `false` on a resampler error.
    fn run(&mut self, frames: usize, partial: Option<usize>, out: &mut Vec<i32>) -> bool {
        let input = match InterleavedSlice::new(&self.input[..frames * CHANNELS], CHANNELS, frames) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("interleaved slice (input) error: {e:#}");
                return false;
            }
        };
        let capacity = self.output.len() / CHANNELS;
        let mut output = match InterleavedSlice::new_mut(&mut self.output, CHANNELS, capacity) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("interleaved slice (output) error: {e:#}");
                return false;
            }
        };
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial,
        };
        match self
            .resampler
            .process_into_buffer(&input, &mut output, Some(&indexing))
        {
            Ok((_, produced)) => {
                out.extend(
                    self.output[..produced * CHANNELS]
                        .iter()
                        .map(|&s| (s * SCALE).clamp(i32::MIN as f32, i32::MAX as f32) as i32),
                );
                true
            }
            Err(e) => {
                tracing::error!("resampler process error: {e:#}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_processor_passes_frames_through() {
        let mut p = Processor::default();
        let mut out = Vec::new();
        p.process(&[1, 2, 3, 4], &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(!p.is_active());
    }

    #[test]
    fn upsampling_roughly_doubles_frame_count() {
        let mut p = Processor::default();
        p.start(22_050, 44_100, 256).unwrap();
        assert!(p.is_active());

        let input: Vec<i32> = (0..4096)
            .flat_map(|i| {
                let v = ((i as f32 * 0.05).sin() * 1.0e9) as i32;
                [v, v]
            })
            .collect();
        let mut out = Vec::new();
        p.process(&input, &mut out);
        p.drain(&mut out);

        let frames = out.len() / 2;
        assert!(frames > 7000 && frames < 8600, "produced {frames} frames");
        assert_eq!(out.len() % 2, 0);
    }

    #[test]
    fn rejects_zero_rates() {
        let mut p = Processor::default();
        assert!(p.start(0, 48_000, 256).is_err());
        assert!(!p.is_active());
    }
}
