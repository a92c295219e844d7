//! Sink writers: the device end of the output stage.
//!
//! The output stage hands each segment to a [`SinkWriter`] as a [`FrameBlock`]: raw
//! frames straight from the output buffer plus the gains (and optional crossfade
//! partner) to apply. Writers render the block into the device format and report
//! how many frames the device accepted.
//!
//! Pull devices (an audio callback) implement [`SinkWriter`] directly. Byte-stream
//! devices implement [`SinkDevice`] and are wrapped in a [`PackedSink`], which adds
//! packing, DoP framing and bounded error recovery. [`spawn_push_output`] drives a
//! push sink from its own thread.

use std::io::{self, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::SinkError;
use crate::output::OutputStage;
use crate::pack::{DopEncoder, SampleFormat, apply_gain, cross_mix, pack};

/// Frames of the track about to be mixed in during a crossfade.
#[derive(Clone, Copy, Debug)]
pub struct CrossBlock<'a> {
    pub samples: &'a [i32],
    pub gain_in: u32,
    pub gain_out: u32,
}

/// One contiguous segment handed to a sink.
#[derive(Clone, Copy, Debug)]
pub struct FrameBlock<'a> {
    /// Interleaved stereo frames.
    pub samples: &'a [i32],
    pub silence: bool,
    pub gain_left: u32,
    pub gain_right: u32,
    pub cross: Option<CrossBlock<'a>>,
    /// Frames carry DoP payload; gains and mixing do not apply.
    pub dsd: bool,
    pub sample_rate: u32,
}

impl FrameBlock<'_> {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    /// Final samples for the device: mixed, gain-scaled, and DoP-marked when `dop` is given.
    pub fn render(&self, out: &mut Vec<i32>, dop: Option<&DopEncoder>) {
        out.clear();
        out.extend_from_slice(self.samples);
        if self.dsd {
            if let Some(enc) = dop {
                enc.encode(out);
            }
            return;
        }
        if self.silence {
            return;
        }
        if let Some(cross) = &self.cross {
            cross_mix(out, cross.samples, cross.gain_out, cross.gain_in);
        }
        apply_gain(out, self.gain_left, self.gain_right);
    }
}

pub trait SinkWriter {
    /// Write as much of `block` as the device takes right now. Returns frames accepted.
    fn write_frames(&mut self, block: &FrameBlock<'_>) -> usize;

    /// Frames accepted by the device that are not yet audible.
    fn delay_frames(&self) -> u64 {
        0
    }
}

/// Byte-oriented output device.
pub trait SinkDevice: Send {
    fn name(&self) -> &str;

    fn open(&mut self, sample_rate: u32) -> Result<(), SinkError>;

    /// Write packed frames. Returns bytes accepted, a whole number of frames.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Try to bring the device back after a failed write.
    fn recover(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self);

    fn delay_frames(&self) -> u64 {
        0
    }
}

/// [`SinkWriter`] over a [`SinkDevice`] taking packed samples.
///
/// The device is opened lazily at the rate of the first block and reopened when the
/// rate changes. A failed write is retried after [`SinkDevice::recover`] up to the
/// retry limit; after that the device is closed and reopened on the next delivery.
pub struct PackedSink<D> {
    device: D,
    format: SampleFormat,
    dop: DopEncoder,
    open_rate: Option<u32>,
    retry_limit: u32,
    mixed: Vec<i32>,
    bytes: Vec<u8>,
}

impl<D: SinkDevice> PackedSink<D> {
    pub fn new(device: D, format: SampleFormat, retry_limit: u32) -> Self {
        Self {
            device,
            format,
            dop: DopEncoder::default(),
            open_rate: None,
            retry_limit,
            mixed: Vec::new(),
            bytes: Vec::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    fn ensure_open(&mut self, sample_rate: u32) -> bool {
        if self.open_rate == Some(sample_rate) {
            return true;
        }
        if self.open_rate.take().is_some() {
            self.device.close();
        }
        match self.device.open(sample_rate) {
            Ok(()) => {
                tracing::info!(
                    device = self.device.name(),
                    sample_rate,
                    format = %self.format,
                    "sink opened"
                );
                self.open_rate = Some(sample_rate);
                true
            }
            Err(e) => {
                tracing::warn!(device = self.device.name(), sample_rate, error = %e, "sink open failed");
                false
            }
        }
    }

    fn close(&mut self) {
        if self.open_rate.take().is_some() {
            self.device.close();
        }
    }
}

impl<D: SinkDevice> SinkWriter for PackedSink<D> {
    fn write_frames(&mut self, block: &FrameBlock<'_>) -> usize {
        if block.frames() == 0 || !self.ensure_open(block.sample_rate) {
            return 0;
        }
        if block.dsd && self.format.bits() < 24 {
            tracing::warn!(format = %self.format, "DoP needs a 24 or 32-bit output format; dropping frames");
            return block.frames();
        }

        block.render(&mut self.mixed, Some(&self.dop));
        self.bytes.clear();
        pack(&self.mixed, self.format, &mut self.bytes);
        let frame_bytes = self.format.bytes_per_frame();

        let mut attempts = 0;
        loop {
            match self.device.write(&self.bytes) {
                Ok(n) => {
                    let frames = n / frame_bytes;
                    if block.dsd {
                        self.dop.commit(frames);
                    }
                    return frames;
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(device = self.device.name(), attempts, error = %e, "sink write failed");
                    if attempts > self.retry_limit {
                        tracing::error!(device = self.device.name(), "closing sink after repeated failures");
                        self.close();
                        return 0;
                    }
                    if let Err(e) = self.device.recover() {
                        tracing::warn!(device = self.device.name(), error = %e, "sink recovery failed");
                        self.close();
                        return 0;
                    }
                }
            }
        }
    }

    fn delay_frames(&self) -> u64 {
        self.device.delay_frames()
    }
}

/// Packed samples to standard output, e.g. for piping into another player.
#[derive(Default)]
pub struct StdoutDevice {
    open: bool,
}

impl SinkDevice for StdoutDevice {
    fn name(&self) -> &str {
        "stdout"
    }

    fn open(&mut self, _sample_rate: u32) -> Result<(), SinkError> {
        self.open = true;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        if !self.open {
            return Err(SinkError::Closed);
        }
        let mut out = io::stdout().lock();
        out.write_all(bytes)?;
        out.flush()?;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Drive a push sink from a dedicated thread, one period of frames per iteration.
///
/// When only silence went out the thread sleeps for the period, so an idle pipeline
/// does not spin.
pub fn spawn_push_output<W>(mut stage: OutputStage, mut sink: W, period: Duration) -> Result<JoinHandle<()>>
where
    W: SinkWriter + Send + 'static,
{
    thread::Builder::new()
        .name("netplayer-output".into())
        .spawn(move || {
            tracing::debug!("output stage started");
            while stage.is_running() {
                let rate = stage.sample_rate().max(1) as u128;
                let wanted = (rate * period.as_millis() / 1000).max(1) as usize;
                let delivery = stage.fill(wanted, &mut sink);
                if delivery.audio_frames == 0 {
                    thread::sleep(period);
                }
            }
            tracing::debug!("output stage stopped");
        })
        .context("spawn output thread")
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryDevice;
    use super::*;
    use crate::pack::{DSD_SILENCE, UNITY_GAIN};

    struct FlakyDevice {
        fail_writes: u32,
        recoveries: u32,
        opens: u32,
        closes: u32,
        accept_frames: Option<usize>,
    }

    impl FlakyDevice {
        fn new(fail_writes: u32) -> Self {
            Self {
                fail_writes,
                recoveries: 0,
                opens: 0,
                closes: 0,
                accept_frames: None,
            }
        }
    }

    impl SinkDevice for FlakyDevice {
        fn name(&self) -> &str {
            "flaky"
        }

        fn open(&mut self, _sample_rate: u32) -> Result<(), SinkError> {
            self.opens += 1;
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
            if self.fail_writes > 0 {
                self.fail_writes -= 1;
                return Err(SinkError::Io(io::Error::other("xrun")));
            }
            Ok(match self.accept_frames {
                Some(frames) => (frames * 4).min(bytes.len()),
                None => bytes.len(),
            })
        }

        fn recover(&mut self) -> Result<(), SinkError> {
            self.recoveries += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.closes += 1;
        }
    }

    fn block(samples: &[i32], rate: u32) -> FrameBlock<'_> {
        FrameBlock {
            samples,
            silence: false,
            gain_left: UNITY_GAIN,
            gain_right: UNITY_GAIN,
            cross: None,
            dsd: false,
            sample_rate: rate,
        }
    }

    #[test]
    fn render_applies_crossfade_then_gain() {
        let old = [1000, 1000];
        let new = [3000, 3000];
        let b = FrameBlock {
            gain_left: UNITY_GAIN / 2,
            cross: Some(CrossBlock {
                samples: &new,
                gain_in: UNITY_GAIN / 2,
                gain_out: UNITY_GAIN / 2,
            }),
            ..block(&old, 44_100)
        };
        let mut out = Vec::new();
        b.render(&mut out, None);
        assert_eq!(out, [1000, 2000]);
    }

    #[test]
    fn dsd_blocks_skip_gain_and_get_markers() {
        let samples = [DSD_SILENCE; 4];
        let b = FrameBlock {
            gain_left: 0,
            gain_right: 0,
            dsd: true,
            ..block(&samples, 176_400)
        };
        let mut out = Vec::new();
        b.render(&mut out, Some(&DopEncoder::default()));
        assert_eq!(out[0] as u32, 0x0569_6900);
        assert_eq!(out[2] as u32, 0xFA69_6900);
    }

    #[test]
    fn memory_sink_packs_and_reopens_on_rate_change() {
        let device = MemoryDevice::default();
        let mut sink = PackedSink::new(device.clone(), SampleFormat::S16Le, 3);
        assert_eq!(sink.write_frames(&block(&[0x0001_0000, 0x0002_0000], 44_100)), 1);
        assert_eq!(sink.write_frames(&block(&[0x0003_0000, 0x0004_0000], 48_000)), 1);
        assert_eq!(device.bytes(), [1, 0, 2, 0, 3, 0, 4, 0]);
        assert_eq!(device.opened_rates(), vec![44_100, 48_000]);
    }

    #[test]
    fn transient_failures_recover_within_retry_limit() {
        let mut sink = PackedSink::new(FlakyDevice::new(2), SampleFormat::S16Le, 3);
        assert_eq!(sink.write_frames(&block(&[0; 8], 44_100)), 4);
        assert_eq!(sink.device().recoveries, 2);
        assert_eq!(sink.device().closes, 0);
    }

    #[test]
    fn repeated_failures_close_and_reopen_lazily() {
        let mut sink = PackedSink::new(FlakyDevice::new(10), SampleFormat::S16Le, 2);
        assert_eq!(sink.write_frames(&block(&[0; 8], 44_100)), 0);
        assert_eq!(sink.device().closes, 1);
        assert_eq!(sink.device().opens, 1);

        // Next delivery reopens; still failing, closes again.
        assert_eq!(sink.write_frames(&block(&[0; 8], 44_100)), 0);
        assert_eq!(sink.device().opens, 2);
        assert_eq!(sink.device().closes, 2);
    }

    #[test]
    fn partial_acceptance_reports_whole_frames() {
        let mut device = FlakyDevice::new(0);
        device.accept_frames = Some(3);
        let mut sink = PackedSink::new(device, SampleFormat::S16Le, 1);
        assert_eq!(sink.write_frames(&block(&[0; 16], 44_100)), 3);
    }
}
