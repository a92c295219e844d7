//! Decode stage: runs the current codec whenever input and output space allow.
//!
//! The codec slot is held for the length of a decode call so the controller can
//! never swap or close a codec underneath it. Decoded frames go through the
//! [`FrameWriter`], which owns the optional resampler and announces a new track's
//! start position and rate to the output stage on the first write after an open.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use netplayer_types::{DecodeState, PlayerEvent, StreamState};

use crate::buffer::{BYTES_PER_FRAME, Locked};
use crate::codec::{Codec, CodecRegistry, CodecSpec, DecodeIo, DecodeStep, TrackFormat};
use crate::config::ResampleConfig;
use crate::error::CodecError;
use crate::process::Processor;
use crate::shared::Shared;

/// Decode state colocated with the output buffer.
#[derive(Clone, Copy, Debug)]
pub struct DecodeStatus {
    pub state: DecodeState,
    /// The next frames written start a new track.
    pub new_stream: bool,
    /// Frames reach the output buffer without resampling.
    pub direct: bool,
    /// Label of the open codec.
    pub codec: Option<&'static str>,
}

impl Default for DecodeStatus {
    fn default() -> Self {
        Self {
            state: DecodeState::Stopped,
            new_stream: true,
            direct: true,
            codec: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct CodecSlot {
    pub(crate) codec: Option<Box<dyn Codec>>,
    pub(crate) writer: FrameWriter,
    /// Codec finished; waiting for pending frames to drain.
    finished: bool,
    /// Stream session the last codec read to its end.
    drained_session: Option<u64>,
}

struct Announce {
    rate: u32,
    dsd: bool,
    direct: bool,
}

/// Frames produced by the codec on their way to the output buffer.
#[derive(Default)]
pub(crate) struct FrameWriter {
    pending: Vec<i32>,
    announce: Option<Announce>,
    track: Option<TrackFormat>,
    process: Processor,
}

impl FrameWriter {
    pub(crate) fn new_track(
        &mut self,
        format: TrackFormat,
        resample: Option<&ResampleConfig>,
    ) -> Result<(), CodecError> {
        let target = match resample {
            Some(cfg) if !format.dsd => cfg
                .target_rate(format.sample_rate)
                .map(|rate| (rate, cfg.chunk_frames)),
            _ => None,
        };
        match target {
            Some((rate, chunk)) => self.process.start(format.sample_rate, rate, chunk)?,
            None => self.process.stop(),
        }
        let rate = target.map_or(format.sample_rate, |(rate, _)| rate);
        tracing::info!(
            sample_rate = format.sample_rate,
            output_rate = rate,
            dsd = format.dsd,
            "track format"
        );
        self.announce = Some(Announce {
            rate,
            dsd: format.dsd,
            direct: !self.process.is_active(),
        });
        self.track = Some(format);
        Ok(())
    }

    pub(crate) fn push(&mut self, samples: &[i32]) {
        self.process.process(samples, &mut self.pending);
    }

    /// End of track: flush the resampler tail into the pending frames.
    pub(crate) fn finish(&mut self) {
        self.process.drain(&mut self.pending);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.len() >= 2
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.announce = None;
        self.track = None;
        self.process.stop();
    }

    /// Move pending frames into the output buffer. Returns frames written.
    pub(crate) fn flush(&mut self, shared: &Shared) -> usize {
        if !self.has_pending() {
            return 0;
        }
        let written = {
            let mut g = shared.output.lock();
            let Locked { buf, state } = &mut *g;
            if buf.space() / BYTES_PER_FRAME == 0 {
                return 0;
            }
            if let Some(a) = self.announce.take() {
                if state.decode.new_stream {
                    state.decode.new_stream = false;
                    state.decode.direct = a.direct;
                    state.output.announce_track(buf, a.rate, a.dsd);
                }
            }
            buf.write_samples(&self.pending)
        };
        self.pending.drain(..written * 2);
        written
    }

    #[cfg(test)]
    pub(crate) fn take_pending(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.pending)
    }

    #[cfg(test)]
    pub(crate) fn track(&self) -> Option<TrackFormat> {
        self.track
    }
}

/// Spawn the decode stage thread.
pub(crate) fn spawn(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("netplayer-decode".into())
        .spawn(move || {
            tracing::debug!("decode stage started");
            while shared.is_running() {
                if !step(&shared) {
                    shared.wake.wait(shared.config.decode_idle);
                }
            }
            tracing::debug!("decode stage stopped");
        })
        .context("spawn decode thread")
}

/// One pass of the decode loop. Returns `false` when nothing could be done.
fn step(shared: &Arc<Shared>) -> bool {
    let mut slot = shared.lock_codec();
    let CodecSlot {
        codec,
        writer,
        finished,
        drained_session,
    } = &mut *slot;
    let Some(codec) = codec.as_mut() else {
        return false;
    };
    if shared.output.lock().state.decode.state != DecodeState::Running {
        return false;
    }

    let flushed = writer.flush(shared);
    if writer.has_pending() {
        return flushed > 0;
    }
    if *finished {
        *finished = false;
        *drained_session = Some(stream_session(shared));
        complete(shared, codec.name());
        return true;
    }

    let space = shared.output.lock().buf.space();
    let (bytes, ended, idle) = {
        let g = shared.stream.lock();
        let state = g.state.state;
        let stale = state.is_ended() && *drained_session == Some(g.state.session);
        (g.buf.used(), state.is_ended(), state == StreamState::Stopped || stale)
    };
    if bytes == 0 && idle {
        // Codec opened ahead of its stream.
        return flushed > 0;
    }
    if space <= codec.min_space() || !(bytes > codec.min_read_bytes() || ended) {
        return flushed > 0;
    }

    let generation = shared.flush_generation();
    let mut io = DecodeIo::new(shared, writer);
    let result = codec.decode(&mut io);
    let progressed = io.progressed();
    if shared.flush_generation() != generation {
        // Flushed while the codec was blocked; the controller resets everything next.
        return true;
    }

    match result {
        Ok(DecodeStep::Running) => {
            writer.flush(shared);
            progressed || flushed > 0
        }
        Ok(DecodeStep::Complete) => {
            writer.finish();
            writer.flush(shared);
            if writer.has_pending() {
                *finished = true;
            } else {
                *drained_session = Some(stream_session(shared));
                complete(shared, codec.name());
            }
            true
        }
        Err(e) => {
            writer.clear();
            *drained_session = Some(stream_session(shared));
            fail(shared, codec.name(), &e);
            true
        }
    }
}

fn stream_session(shared: &Shared) -> u64 {
    shared.stream.lock().state.session
}

fn complete(shared: &Shared, codec: &str) {
    {
        let mut g = shared.output.lock();
        if g.state.decode.state != DecodeState::Running {
            return;
        }
        g.state.decode.state = DecodeState::Complete;
    }
    tracing::info!(codec, "decode complete");
    shared.emit(PlayerEvent::DecodeComplete);
}

fn fail(shared: &Shared, codec: &str, err: &CodecError) {
    shared.output.lock().state.decode.state = DecodeState::Error;
    tracing::warn!(codec, error = %err, "decode error");
    shared.emit(PlayerEvent::DecodeError {
        message: err.to_string(),
    });
}

/// Close the current codec (if any) and open the one registered for `spec.format`.
pub(crate) fn open_codec(
    shared: &Shared,
    registry: &CodecRegistry,
    spec: &CodecSpec,
) -> Result<&'static str, CodecError> {
    let mut slot = shared.lock_codec();
    if let Some(mut old) = slot.codec.take() {
        tracing::debug!(codec = old.name(), "closing codec");
        old.close();
    }
    slot.writer.clear();
    slot.finished = false;

    let opened = registry
        .create(spec.format)
        .ok_or_else(|| CodecError::Unsupported(format!("no codec for format '{}'", spec.format)))
        .and_then(|mut codec| {
            codec.open(spec)?;
            Ok(codec)
        });

    let result = {
        let mut g = shared.output.lock();
        g.state.decode.new_stream = true;
        g.state.decode.direct = true;
        match opened {
            Ok(codec) => {
                let name = codec.name();
                slot.codec = Some(codec);
                g.state.decode.state = DecodeState::Running;
                g.state.decode.codec = Some(name);
                Ok(name)
            }
            Err(e) => {
                g.state.decode.state = DecodeState::Error;
                g.state.decode.codec = None;
                Err(e)
            }
        }
    };
    drop(slot);

    match &result {
        Ok(name) => tracing::info!(codec = name, format = %spec.format, "codec open"),
        Err(e) => {
            tracing::warn!(format = %spec.format, error = %e, "codec open failed");
            shared.emit(PlayerEvent::DecodeError {
                message: e.to_string(),
            });
        }
    }
    shared.wake.notify();
    result
}

/// Close the codec and drop everything queued between it and the output buffer.
pub(crate) fn flush(shared: &Shared) {
    shared.begin_flush();
    let mut slot = shared.lock_codec();
    if let Some(mut codec) = slot.codec.take() {
        codec.close();
    }
    slot.writer.clear();
    slot.finished = false;
    slot.drained_session = None;
    let mut g = shared.output.lock();
    g.state.decode = DecodeStatus::default();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::codec::Endianness;
    use crate::config::PlayerConfig;

    fn shared_with(config: PlayerConfig) -> (Arc<Shared>, crossbeam_channel::Receiver<PlayerEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(Shared::new(config, tx).unwrap()), rx)
    }

    fn feed(shared: &Shared, bytes: &[u8], ended: bool) {
        let mut g = shared.stream.lock();
        assert_eq!(g.buf.write_from(bytes), bytes.len());
        if ended {
            g.state.state = StreamState::Disconnect;
        } else {
            g.state.state = StreamState::StreamingHttp;
        }
    }

    fn pcm16(frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| {
                let v = i as i16;
                let mut f = v.to_le_bytes().to_vec();
                f.extend_from_slice(&(-v).to_le_bytes());
                f
            })
            .collect()
    }

    #[test]
    fn announces_track_at_first_write() {
        let (shared, _rx) = shared_with(PlayerConfig::default());
        let mut writer = FrameWriter::default();
        writer
            .new_track(
                TrackFormat {
                    sample_rate: 48_000,
                    dsd: false,
                },
                None,
            )
            .unwrap();
        writer.push(&[1, 2, 3, 4]);
        let start = shared.output.lock().buf.write_pos();
        assert_eq!(writer.flush(&shared), 2);

        let g = shared.output.lock();
        assert!(!g.state.decode.new_stream);
        assert_eq!(g.state.output.next_sample_rate(), 48_000);
        assert_eq!(g.state.output.track_start(), Some(start));
        assert_eq!(g.buf.used(), 2 * BYTES_PER_FRAME);
    }

    #[test]
    fn pending_frames_wait_for_output_space() {
        let config = PlayerConfig {
            output_buf_bytes: 4 * BYTES_PER_FRAME,
            ..PlayerConfig::default()
        };
        let (shared, _rx) = shared_with(config);
        let mut writer = FrameWriter::default();
        writer.push(&[7; 10]);
        assert_eq!(writer.flush(&shared), 3);
        assert!(writer.has_pending());
        assert_eq!(writer.flush(&shared), 0);

        shared.output.lock().buf.advance_read(2 * BYTES_PER_FRAME);
        assert_eq!(writer.flush(&shared), 2);
        assert!(!writer.has_pending());
    }

    #[test]
    fn unknown_format_sets_error_and_reports() {
        let (shared, rx) = shared_with(PlayerConfig::default());
        let err = open_codec(&shared, &CodecRegistry::with_defaults(), &CodecSpec::new('z'));
        assert!(matches!(err, Err(CodecError::Unsupported(_))));
        assert_eq!(shared.output.lock().state.decode.state, DecodeState::Error);
        assert!(matches!(rx.try_recv(), Ok(PlayerEvent::DecodeError { .. })));
    }

    #[test]
    fn decode_loop_drains_raw_pcm_and_completes() {
        let (shared, rx) = shared_with(PlayerConfig::default());
        feed(&shared, &pcm16(1000), true);
        let spec = CodecSpec::pcm(16, 44_100, 2, Endianness::Little);
        assert_eq!(open_codec(&shared, &CodecRegistry::with_defaults(), &spec).unwrap(), "pcm");

        let mut steps = 0;
        while shared.output.lock().state.decode.state == DecodeState::Running && steps < 100 {
            step(&shared);
            steps += 1;
        }

        let g = shared.output.lock();
        assert_eq!(g.state.decode.state, DecodeState::Complete);
        assert_eq!(g.buf.used(), 1000 * BYTES_PER_FRAME);
        assert_eq!(g.state.output.next_sample_rate(), 44_100);
        drop(g);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), PlayerEvent::DecodeComplete);
    }

    #[test]
    fn decode_waits_for_min_read_bytes_until_stream_ends() {
        let (shared, _rx) = shared_with(PlayerConfig::default());
        feed(&shared, &pcm16(10), false);
        let spec = CodecSpec::pcm(16, 44_100, 2, Endianness::Little);
        open_codec(&shared, &CodecRegistry::with_defaults(), &spec).unwrap();

        assert!(!step(&shared));
        assert_eq!(shared.output.lock().buf.used(), 0);

        shared.stream.lock().state.state = StreamState::Disconnect;
        assert!(step(&shared));
        assert_eq!(shared.output.lock().buf.used(), 10 * BYTES_PER_FRAME);
    }

    fn run_to_end(shared: &Arc<Shared>) {
        let mut steps = 0;
        while shared.output.lock().state.decode.state == DecodeState::Running && steps < 100 {
            step(shared);
            steps += 1;
        }
    }

    #[test]
    fn codec_opened_before_next_stream_waits_for_it() {
        let (shared, rx) = shared_with(PlayerConfig::default());
        let registry = CodecRegistry::with_defaults();
        let spec = CodecSpec::pcm(16, 44_100, 2, Endianness::Little);
        feed(&shared, &pcm16(100), true);
        open_codec(&shared, &registry, &spec).unwrap();
        run_to_end(&shared);
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::DecodeComplete));

        // The finished stream still reads as disconnected and empty.
        open_codec(&shared, &registry, &spec).unwrap();
        assert!(!step(&shared));
        assert!(!step(&shared));
        assert_eq!(shared.output.lock().state.decode.state, DecodeState::Running);
        assert!(rx.try_recv().is_err());

        shared.stream.lock().state.session += 1;
        feed(&shared, &pcm16(50), true);
        run_to_end(&shared);
        let g = shared.output.lock();
        assert_eq!(g.state.decode.state, DecodeState::Complete);
        assert_eq!(g.buf.used(), 150 * BYTES_PER_FRAME);
        assert_eq!(g.state.output.pending_tracks(), 2);
    }

    #[test]
    fn empty_stream_opened_first_still_completes() {
        let (shared, rx) = shared_with(PlayerConfig::default());
        let registry = CodecRegistry::with_defaults();
        let spec = CodecSpec::pcm(16, 44_100, 2, Endianness::Little);
        feed(&shared, &pcm16(10), true);
        open_codec(&shared, &registry, &spec).unwrap();
        run_to_end(&shared);
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::DecodeComplete));

        shared.stream.lock().state.session += 1;
        open_codec(&shared, &registry, &spec).unwrap();
        run_to_end(&shared);
        assert_eq!(shared.output.lock().state.decode.state, DecodeState::Complete);
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::DecodeComplete));
    }

    #[test]
    fn flush_closes_codec_and_resets_decode_state() {
        let (shared, _rx) = shared_with(PlayerConfig::default());
        let spec = CodecSpec::pcm(16, 44_100, 2, Endianness::Little);
        open_codec(&shared, &CodecRegistry::with_defaults(), &spec).unwrap();
        assert_eq!(shared.output.lock().state.decode.codec, Some("pcm"));
        flush(&shared);
        assert!(shared.lock_codec().codec.is_none());
        let g = shared.output.lock();
        assert_eq!(g.state.decode.codec, None);
        assert_eq!(g.state.decode.state, DecodeState::Stopped);
        assert!(g.state.decode.new_stream);
    }
}
