//! Pipeline owner: the stream and decode threads plus the buffers they share.
//!
//! A [`Pipeline`] is the controller's handle. It owns the shared state, spawns the
//! stream and decode stages, and hands out [`OutputStage`]s for sink drivers. Edge
//! signals from every stage arrive on the event receiver returned by
//! [`Pipeline::start`].

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, unbounded};
use netplayer_types::{FadeMode, PlayerEvent, PlayerStatus};

use crate::codec::{CodecRegistry, CodecSpec};
use crate::config::PlayerConfig;
use crate::error::CodecError;
use crate::output::{self, OutputStage, OutputStatus};
use crate::shared::Shared;
use crate::stream::{self, StreamControl, StreamRequest};
use crate::{decode, status};

pub struct Pipeline {
    shared: Arc<Shared>,
    stream: StreamControl,
    registry: CodecRegistry,
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Allocate the buffers and start the stage threads with the default codecs.
    pub fn start(config: PlayerConfig) -> Result<(Self, Receiver<PlayerEvent>)> {
        Self::with_registry(config, CodecRegistry::with_defaults())
    }

    pub fn with_registry(
        config: PlayerConfig,
        registry: CodecRegistry,
    ) -> Result<(Self, Receiver<PlayerEvent>)> {
        let (event_tx, events) = unbounded();
        let (cmd_tx, cmd_rx) = unbounded();
        let shared = Arc::new(Shared::new(config, event_tx)?);
        let mut threads = Vec::with_capacity(2);
        threads.push(stream::spawn(shared.clone(), cmd_rx)?);
        threads.push(decode::spawn(shared.clone())?);
        tracing::info!(
            stream_buf = shared.config.stream_buf_bytes,
            output_buf = shared.config.output_buf_bytes,
            codecs = %registry.formats().into_iter().collect::<String>(),
            "pipeline started"
        );
        let pipeline = Self {
            stream: StreamControl::new(shared.clone(), cmd_tx),
            shared,
            registry,
            threads,
        };
        Ok((pipeline, events))
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.shared.config
    }

    /// A consumer for the output buffer. Run one per sink.
    pub fn output_stage(&self) -> OutputStage {
        OutputStage::new(self.shared.clone())
    }

    pub fn stream_connect(&self, request: StreamRequest) {
        self.stream.connect(request);
    }

    pub fn stream_file(&self, path: impl Into<PathBuf>, threshold: u64) {
        self.stream.open_file(path.into(), threshold);
    }

    /// Release a stream held in `Wait`. Returns `false` if it was not waiting.
    pub fn stream_continue(&self, meta_interval: usize) -> bool {
        self.stream.resume(meta_interval)
    }

    pub fn stream_disconnect(&self) -> bool {
        self.stream.disconnect()
    }

    /// Replace the current codec. Buffered output of the previous track keeps playing.
    pub fn codec_open(&self, spec: &CodecSpec) -> Result<&'static str, CodecError> {
        decode::open_codec(&self.shared, &self.registry, spec)
    }

    /// Drop everything in flight: codec, stream source and both buffers.
    pub fn flush(&self) {
        decode::flush(&self.shared);
        self.stream.disconnect();
        self.shared.stream.flush();
        output::flush(&self.shared);
        tracing::info!("pipeline flushed");
    }

    /// Reallocate the stream buffer; only meaningful while nothing is streaming.
    pub fn resize_stream_buffer(&self, bytes: usize) -> bool {
        self.shared.stream.resize(bytes)
    }

    pub fn start_output(&self) {
        self.with_output(OutputStatus::start);
        tracing::info!("output start requested");
    }

    pub fn pause(&self) {
        self.with_output(OutputStatus::pause);
        tracing::info!("output paused");
    }

    pub fn unpause(&self) {
        self.with_output(OutputStatus::unpause);
        tracing::info!("output unpaused");
    }

    pub fn unpause_at(&self, at: Instant) {
        self.with_output(|o| o.unpause_at(at));
        tracing::info!(in_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64, "output unpause scheduled");
    }

    pub fn pause_for(&self, d: Duration) {
        self.with_output(|o| o.pause_for(d));
        tracing::info!(ms = d.as_millis() as u64, "output paused for interval");
    }

    pub fn skip_ahead(&self, d: Duration) {
        self.with_output(|o| o.skip_ahead(d));
        tracing::info!(ms = d.as_millis() as u64, "output skipping ahead");
    }

    /// Per-channel gain in 16.16 fixed point.
    pub fn set_gain(&self, left: u32, right: u32) {
        self.with_output(|o| o.set_gain(left, right));
        tracing::debug!(left, right, "gain set");
    }

    pub fn set_replay_gain(&self, gain: Option<u32>) {
        self.with_output(|o| o.set_replay_gain(gain));
    }

    pub fn set_fade(&self, mode: FadeMode, duration: Duration) {
        self.with_output(|o| o.set_fade(mode, duration));
        tracing::debug!(?mode, ms = duration.as_millis() as u64, "fade set");
    }

    pub fn status(&self) -> PlayerStatus {
        status::snapshot(&self.shared)
    }

    /// Stop the stage threads and wait for them.
    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn with_output(&self, f: impl FnOnce(&mut OutputStatus)) {
        f(&mut self.shared.output.lock().state.output);
        self.shared.wake.notify();
    }

    fn stop_threads(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("pipeline thread panicked");
            }
        }
        tracing::info!("pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
