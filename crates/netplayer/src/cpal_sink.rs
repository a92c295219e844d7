//! Pull output through a CPAL stream.
//!
//! The CPAL callback drives the output stage directly: each callback asks the stage
//! for exactly the frames the device wants and converts them to the device sample
//! format. A track at a new rate stalls the callback (silence) and records the rate;
//! the controller then reopens the stream via [`DeviceOutput::sync`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use netplayer_core::output::OutputStage;
use netplayer_core::pack::DopEncoder;
use netplayer_core::sink::{FrameBlock, SinkWriter};

use crate::device::{pick_buffer_size, pick_output_config};

/// A CPAL device fed by an [`OutputStage`].
pub struct DeviceOutput {
    device: cpal::Device,
    stage: Arc<Mutex<OutputStage>>,
    wanted_rate: Arc<AtomicU32>,
    stream: Option<cpal::Stream>,
    rate: u32,
}

impl DeviceOutput {
    pub fn new(device: cpal::Device, stage: OutputStage) -> Self {
        Self {
            device,
            stage: Arc::new(Mutex::new(stage)),
            wanted_rate: Arc::new(AtomicU32::new(0)),
            stream: None,
            rate: 0,
        }
    }

    /// Open the stream, or reopen it when the stage asked for a different rate.
    pub fn sync(&mut self) -> Result<()> {
        let wanted = match self.wanted_rate.swap(0, Ordering::Relaxed) {
            0 if self.stream.is_some() => return Ok(()),
            0 => self
                .stage
                .lock()
                .map_err(|_| anyhow!("output stage lock poisoned"))?
                .sample_rate(),
            rate => rate,
        };
        if self.stream.is_some() && wanted == self.rate {
            return Ok(());
        }

        self.stream = None;
        let config = pick_output_config(&self.device, wanted)?;
        let sample_format = config.sample_format();
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }
        if stream_config.sample_rate != wanted {
            tracing::warn!(
                track_rate_hz = wanted,
                device_rate_hz = stream_config.sample_rate,
                "device cannot open track rate; pass --rates to resample"
            );
        }
        tracing::info!(
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            format = ?sample_format,
            buffer_size = ?stream_config.buffer_size,
            "device output config"
        );

        let feed = Feed {
            stage: self.stage.clone(),
            wanted_rate: self.wanted_rate.clone(),
            rate: wanted,
            channels: stream_config.channels as usize,
            bit_perfect: sample_format == cpal::SampleFormat::I32,
        };
        let stream = build_output_stream(&self.device, &stream_config, sample_format, feed)?;
        stream.play()?;
        self.stream = Some(stream);
        self.rate = wanted;
        Ok(())
    }
}

struct Feed {
    stage: Arc<Mutex<OutputStage>>,
    wanted_rate: Arc<AtomicU32>,
    rate: u32,
    channels: usize,
    bit_perfect: bool,
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    feed: Feed,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, feed),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, feed),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, feed),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, feed),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(device: &cpal::Device, config: &cpal::StreamConfig, feed: Feed) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<i32>,
{
    let channels = feed.channels.max(1);
    let mut scratch: Vec<i32> = Vec::new();
    let mut dop = DopEncoder::default();
    let mut dsd_warned = false;

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
            let ts = info.timestamp();
            let delay = ts
                .playback
                .duration_since(&ts.callback)
                .map(|d| (d.as_secs_f64() * feed.rate as f64) as u64)
                .unwrap_or(0);
            let frames = data.len() / channels;
            let mut writer = CallbackWriter {
                out: &mut *data,
                channels,
                pos: 0,
                rate: feed.rate,
                wanted_rate: &feed.wanted_rate,
                bit_perfect: feed.bit_perfect,
                delay,
                scratch: &mut scratch,
                dop: &mut dop,
                dsd_warned: &mut dsd_warned,
            };
            if let Ok(mut stage) = feed.stage.lock() {
                stage.fill(frames, &mut writer);
            }
            let filled = writer.pos * channels;
            for s in &mut data[filled..] {
                *s = T::EQUILIBRIUM;
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// [`SinkWriter`] over one callback buffer.
struct CallbackWriter<'a, T> {
    out: &'a mut [T],
    channels: usize,
    /// Frames written so far.
    pos: usize,
    rate: u32,
    wanted_rate: &'a AtomicU32,
    bit_perfect: bool,
    delay: u64,
    scratch: &'a mut Vec<i32>,
    dop: &'a mut DopEncoder,
    dsd_warned: &'a mut bool,
}

impl<T> SinkWriter for CallbackWriter<'_, T>
where
    T: cpal::Sample + cpal::FromSample<i32>,
{
    fn write_frames(&mut self, block: &FrameBlock<'_>) -> usize {
        if block.sample_rate != self.rate {
            self.wanted_rate.store(block.sample_rate, Ordering::Relaxed);
            return 0;
        }
        let room = self.out.len() / self.channels - self.pos;
        let n = block.frames().min(room);
        if n == 0 {
            return 0;
        }

        if block.dsd && !self.bit_perfect {
            if !*self.dsd_warned {
                *self.dsd_warned = true;
                tracing::warn!("device is not 32-bit integer; dropping DoP frames");
            }
            let start = self.pos * self.channels;
            for s in &mut self.out[start..start + n * self.channels] {
                *s = T::EQUILIBRIUM;
            }
            self.pos += n;
            return n;
        }

        let dop = block.dsd.then_some(&*self.dop);
        block.render(self.scratch, dop);
        for (f, frame) in self.scratch.chunks_exact(2).take(n).enumerate() {
            let base = (self.pos + f) * self.channels;
            for ch in 0..self.channels {
                self.out[base + ch] = T::from_sample(map_channel(frame, self.channels, ch));
            }
        }
        if block.dsd {
            self.dop.commit(n);
        }
        self.pos += n;
        n
    }

    fn delay_frames(&self) -> u64 {
        self.delay
    }
}

/// Sample for device channel `ch` from a stereo frame.
fn map_channel(frame: &[i32], channels: usize, ch: usize) -> i32 {
    match (channels, ch) {
        (1, _) => ((frame[0] as i64 + frame[1] as i64) / 2) as i32,
        (_, 0) | (_, 1) => frame[ch],
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(samples: &[i32], rate: u32) -> FrameBlock<'_> {
        FrameBlock {
            samples,
            silence: false,
            gain_left: 0x10000,
            gain_right: 0x10000,
            cross: None,
            dsd: false,
            sample_rate: rate,
        }
    }

    struct Parts {
        wanted: AtomicU32,
        scratch: Vec<i32>,
        dop: DopEncoder,
        warned: bool,
    }

    impl Parts {
        fn new() -> Self {
            Self {
                wanted: AtomicU32::new(0),
                scratch: Vec::new(),
                dop: DopEncoder::default(),
                warned: false,
            }
        }

        fn writer<'a, T>(&'a mut self, out: &'a mut [T], channels: usize) -> CallbackWriter<'a, T> {
            CallbackWriter {
                out,
                channels,
                pos: 0,
                rate: 44_100,
                wanted_rate: &self.wanted,
                bit_perfect: true,
                delay: 0,
                scratch: &mut self.scratch,
                dop: &mut self.dop,
                dsd_warned: &mut self.warned,
            }
        }
    }

    #[test]
    fn writes_up_to_callback_room() {
        let mut parts = Parts::new();
        let mut out = [0i32; 4];
        let mut w = parts.writer(&mut out, 2);
        let samples = [1, 2, 3, 4, 5, 6];
        assert_eq!(w.write_frames(&block(&samples, 44_100)), 2);
        assert_eq!(w.write_frames(&block(&samples, 44_100)), 0);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn rate_change_stalls_and_requests_reopen() {
        let mut parts = Parts::new();
        let mut out = [0i32; 4];
        let mut w = parts.writer(&mut out, 2);
        assert_eq!(w.write_frames(&block(&[7, 7], 48_000)), 0);
        assert_eq!(w.pos, 0);
        assert_eq!(parts.wanted.load(Ordering::Relaxed), 48_000);
    }

    #[test]
    fn maps_stereo_to_device_layouts() {
        assert_eq!(map_channel(&[100, 300], 1, 0), 200);
        assert_eq!(map_channel(&[100, 300], 4, 1), 300);
        assert_eq!(map_channel(&[100, 300], 4, 3), 0);
    }

    #[test]
    fn converts_to_float_devices() {
        let mut parts = Parts::new();
        let mut out = [1.0f32; 2];
        let mut w = parts.writer(&mut out, 2);
        assert_eq!(w.write_frames(&block(&[0, i32::MIN], 44_100)), 1);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], -1.0);
    }
}
