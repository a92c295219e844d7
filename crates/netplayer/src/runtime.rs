//! Local controller for `netplayer play`.
//!
//! Plays a list of sources back to back: each source gets its own stream and codec,
//! and the next one is opened as soon as the decoder finishes the current one so the
//! output buffer carries the transition.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use cpal::traits::DeviceTrait;
use crossbeam_channel::{Receiver, bounded, select};
use netplayer_core::Pipeline;
use netplayer_core::codec::CodecSpec;
use netplayer_core::pack::gain_from_f32;
use netplayer_core::sink::{PackedSink, StdoutDevice, spawn_push_output};
use netplayer_core::stream::StreamRequest;
use netplayer_core::stream::icy::stream_title;
use netplayer_types::{DecodeState, DisconnectReason, PlayerEvent};

use crate::cli::{OutputKind, local_path};
use crate::config::PlayConfig;
use crate::cpal_sink::DeviceOutput;
use crate::device;

const TICK: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const PUSH_PERIOD: Duration = Duration::from_millis(20);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Play every source in `config` and return once the last one has drained.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let (pipeline, events) = Pipeline::start(config.player.clone())?;
    let gain = gain_from_f32(config.gain);
    pipeline.set_gain(gain, gain);
    pipeline.set_fade(config.fade, config.fade_duration);

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    let mut output = Output::start(&pipeline, &config)?;
    let mut controller = Controller::new(&config);
    if !controller.begin_next(&pipeline) {
        bail!("no playable source");
    }
    pipeline.start_output();

    let result = controller.run(&pipeline, &events, &stop_rx, &mut output);
    if result.is_ok() && output.is_device() {
        // Let the device play out its own buffer.
        thread::sleep(Duration::from_millis(250));
    }
    pipeline.shutdown();
    output.join();
    result
}

enum Output {
    Device(DeviceOutput),
    Push(Option<JoinHandle<()>>),
}

impl Output {
    fn start(pipeline: &Pipeline, config: &PlayConfig) -> Result<Self> {
        let stage = pipeline.output_stage();
        match config.output {
            OutputKind::Stdout => {
                let sink = PackedSink::new(StdoutDevice::default(), config.format, pipeline.config().sink_retry_limit);
                let handle = spawn_push_output(stage, sink, PUSH_PERIOD)?;
                tracing::info!(format = %config.format, "writing to stdout");
                Ok(Output::Push(Some(handle)))
            }
            OutputKind::Device => {
                let host = cpal::default_host();
                let device_name = normalize_device_name(config.device.clone());
                let device = device::pick_device(&host, device_name.as_deref())?;
                tracing::info!(device = %device.description()?, "output device");
                let mut out = DeviceOutput::new(device, stage);
                out.sync()?;
                Ok(Output::Device(out))
            }
        }
    }

    fn is_device(&self) -> bool {
        matches!(self, Output::Device(_))
    }

    fn tick(&mut self) -> Result<()> {
        match self {
            Output::Device(out) => out.sync(),
            Output::Push(_) => Ok(()),
        }
    }

    fn join(&mut self) {
        if let Output::Push(handle) = self {
            if let Some(h) = handle.take() {
                if h.join().is_err() {
                    tracing::warn!("output thread panicked");
                }
            }
        }
    }
}

struct Controller {
    pending: VecDeque<(String, char)>,
    threshold: u64,
    /// No source is left to open.
    exhausted: bool,
}

impl Controller {
    fn new(config: &PlayConfig) -> Self {
        Self {
            pending: config
                .sources
                .iter()
                .map(|s| (s.clone(), config.codec_for(s)))
                .collect(),
            threshold: config.threshold_bytes,
            exhausted: false,
        }
    }

    /// Open the next playable source. Returns `false` when none is left.
    fn begin_next(&mut self, pipeline: &Pipeline) -> bool {
        while let Some((source, tag)) = self.pending.pop_front() {
            match self.begin(pipeline, &source, tag) {
                Ok(codec) => {
                    tracing::info!(source = %source, codec, "track queued");
                    return true;
                }
                Err(e) => tracing::warn!(source = %source, "skipping source: {e:#}"),
            }
        }
        self.exhausted = true;
        false
    }

    fn begin(&self, pipeline: &Pipeline, source: &str, tag: char) -> Result<&'static str> {
        match local_path(source) {
            Some(path) => {
                if !path.is_file() {
                    bail!("no such file: {}", path.display());
                }
                pipeline.stream_file(path, 0);
            }
            None => {
                let request = StreamRequest::http_get(source)?.threshold(self.threshold);
                pipeline.stream_connect(request);
            }
        }
        Ok(pipeline.codec_open(&CodecSpec::new(tag))?)
    }

    fn run(
        &mut self,
        pipeline: &Pipeline,
        events: &Receiver<PlayerEvent>,
        stop: &Receiver<()>,
        output: &mut Output,
    ) -> Result<()> {
        let mut last_status = Instant::now();
        loop {
            select! {
                recv(events) -> ev => {
                    let ev = ev.context("pipeline event channel closed")?;
                    log_event(&ev);
                    self.on_event(pipeline, &ev);
                }
                recv(stop) -> _ => {
                    tracing::info!("interrupted");
                    return Ok(());
                }
                default(TICK) => {}
            }

            output.tick()?;
            if last_status.elapsed() >= STATUS_INTERVAL {
                last_status = Instant::now();
                log_status(pipeline);
            }
            if self.exhausted && idle(pipeline) {
                tracing::info!("playback finished");
                return Ok(());
            }
        }
    }

    fn on_event(&mut self, pipeline: &Pipeline, ev: &PlayerEvent) {
        match ev {
            PlayerEvent::DecodeComplete | PlayerEvent::DecodeError { .. } => {
                if !self.exhausted {
                    self.begin_next(pipeline);
                }
            }
            PlayerEvent::StreamDisconnected { reason } => {
                if !matches!(reason, DisconnectReason::Ok | DisconnectReason::Local) {
                    tracing::warn!(reason = ?reason, "stream ended early");
                }
            }
            _ => {}
        }
    }
}

/// Nothing left anywhere in the pipeline.
fn idle(pipeline: &Pipeline) -> bool {
    let status = pipeline.status();
    status.output_buffer_used == 0 && status.decode_state != DecodeState::Running
}

fn log_event(ev: &PlayerEvent) {
    match ev {
        PlayerEvent::Metadata { text } => match stream_title(text) {
            Some(title) => tracing::info!(title, "now playing"),
            None => tracing::info!(metadata = %text, "stream metadata"),
        },
        PlayerEvent::StreamHeaders { headers } => tracing::debug!(headers = %headers, "stream headers"),
        _ => match serde_json::to_string(ev) {
            Ok(json) => tracing::info!(event = %json, "player event"),
            Err(e) => tracing::warn!("event encode failed: {e}"),
        },
    }
}

fn log_status(pipeline: &Pipeline) {
    match serde_json::to_string(&pipeline.status()) {
        Ok(json) => tracing::info!(status = %json, "player status"),
        Err(e) => tracing::warn!("status encode failed: {e}"),
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
