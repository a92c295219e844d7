//! Gapless trimming of encoder delay and padding frames.

/// Drops `skip` leading frames and holds back the trailing `pad` frames of a track.
///
/// Frames are interleaved stereo `i32`. Held-back frames are released as more audio
/// arrives and discarded by [`GaplessTrim::finish`] at the end of the track.
#[derive(Clone, Debug, Default)]
pub struct GaplessTrim {
    skip: u64,
    pad: usize,
    held: Vec<i32>,
}

impl GaplessTrim {
    pub fn new(skip: u64, pad: usize) -> Self {
        Self {
            skip,
            pad,
            held: Vec::with_capacity(pad * 2),
        }
    }

    /// Feed decoded frames; frames cleared for output are appended to `out`.
    pub fn push(&mut self, samples: &[i32], out: &mut Vec<i32>) {
        let frames = samples.len() / 2;
        let skipped = (self.skip.min(frames as u64)) as usize;
        self.skip -= skipped as u64;
        let samples = &samples[skipped * 2..frames * 2];

        if self.pad == 0 {
            out.extend_from_slice(samples);
            return;
        }

        self.held.extend_from_slice(samples);
        let held_frames = self.held.len() / 2;
        if held_frames > self.pad {
            let release = (held_frames - self.pad) * 2;
            out.extend(self.held.drain(..release));
        }
    }

    /// End of track: drop the padding still held back. Returns the frames discarded.
    pub fn finish(&mut self) -> usize {
        let dropped = self.held.len() / 2;
        self.held.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(range: std::ops::Range<i32>) -> Vec<i32> {
        range.flat_map(|v| [v, -v]).collect()
    }

    #[test]
    fn skips_leading_delay_across_calls() {
        let mut trim = GaplessTrim::new(3, 0);
        let mut out = Vec::new();
        trim.push(&frames(0..2), &mut out);
        assert!(out.is_empty());
        trim.push(&frames(2..5), &mut out);
        assert_eq!(out, frames(3..5));
    }

    #[test]
    fn holds_back_padding_until_finish() {
        let mut trim = GaplessTrim::new(0, 2);
        let mut out = Vec::new();
        trim.push(&frames(0..3), &mut out);
        assert_eq!(out, frames(0..1));
        trim.push(&frames(3..5), &mut out);
        assert_eq!(out, frames(0..3));
        assert_eq!(trim.finish(), 2);
    }

    #[test]
    fn default_trim_passes_everything() {
        let mut trim = GaplessTrim::default();
        let mut out = Vec::new();
        trim.push(&frames(0..4), &mut out);
        assert_eq!(out, frames(0..4));
        assert_eq!(trim.finish(), 0);
    }
}
