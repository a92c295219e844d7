//! Output stage: moves decoded frames from the output buffer into a sink.
//!
//! Every delivery runs under the output buffer lock. The stage emits at most one
//! contiguous segment per call and never lets a segment straddle a track boundary
//! or the start of a scheduled fade, so rate changes, "track started" signals and
//! fade gains take effect on an exact frame.
//!
//! Delivery is the same for push and pull sinks: the caller says how many frames it
//! wants and gets back how many the sink accepted. Anything short of `wanted` is
//! simply delivered on the next call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netplayer_types::{DecodeState, FadeMode, OutputState, PlayerEvent};

use crate::buffer::{BYTES_PER_FRAME, Locked, RingBuffer};
use crate::config::PlayerConfig;
use crate::decode::DecodeStatus;
use crate::pack::{DSD_SILENCE, UNITY_GAIN, combine_gain};
use crate::shared::Shared;
use crate::sink::{CrossBlock, FrameBlock, SinkWriter};

/// Largest segment emitted while a fade is active; gains are constant per segment.
const FADE_STEP: usize = 32;

const FALLBACK_RATE: u32 = 44_100;

/// Decode and output state colocated with the output buffer.
pub struct OutputShared {
    pub decode: DecodeStatus,
    pub output: OutputStatus,
}

impl OutputShared {
    pub(crate) fn new(config: &PlayerConfig) -> Self {
        Self {
            decode: DecodeStatus::default(),
            output: OutputStatus::new(config),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FadeDir {
    Up,
    Down,
    Cross,
}

#[derive(Clone, Copy, Debug)]
struct Fade {
    dir: FadeDir,
    /// Buffer position where the fade begins; `None` once it is running.
    start: Option<usize>,
    total: u64,
    done: u64,
    /// Frames of the incoming track already mixed in (crossfade only).
    mixed: u64,
}

impl Fade {
    fn running(dir: FadeDir, total: u64) -> Self {
        Self {
            dir,
            start: None,
            total,
            done: 0,
            mixed: 0,
        }
    }

    /// `(falling, rising)` levels for a segment of `frames` starting at `done`.
    fn levels(&self, frames: usize) -> (u32, u32) {
        let total = self.total.max(1);
        let mid = (self.done + frames as u64 / 2).min(total);
        let rising = (UNITY_GAIN as u64 * mid / total) as u32;
        (UNITY_GAIN - rising, rising)
    }
}

/// A track whose first frame is buffered but not yet heard.
#[derive(Clone, Copy, Debug)]
struct PendingTrack {
    /// Output buffer position of the track's first frame.
    pos: usize,
    sample_rate: u32,
    dsd: bool,
    fade_in: Option<u64>,
    /// Fade that ends on this track's first frame; armed once the previous track is heard.
    ending: Option<(FadeDir, u64)>,
}

/// Output lifecycle, gains and track-boundary bookkeeping.
#[derive(Debug)]
pub struct OutputStatus {
    pub state: OutputState,
    /// Rate of the track being heard.
    pub current_sample_rate: u32,
    /// Announced tracks in buffer order.
    pending: VecDeque<PendingTrack>,
    pub frames_played: u64,
    pub(crate) updated_at: Option<Instant>,
    pub device_frames: u64,
    pub gain_left: u32,
    pub gain_right: u32,
    pub replay_gain: Option<u32>,
    pub next_replay_gain: Option<u32>,
    pub fade_mode: FadeMode,
    pub fade_duration: Duration,
    fade: Option<Fade>,
    /// Incoming-track frames already heard through a crossfade.
    cross_skip: u64,
    pub pause_frames: u64,
    pub skip_frames: u64,
    pub start_at: Option<Instant>,
    threshold: Duration,
    pub dsd: bool,
    pub underrun_events: u64,
    underrun_reported: bool,
    drained_reported: bool,
}

impl OutputStatus {
    fn new(config: &PlayerConfig) -> Self {
        Self {
            state: OutputState::Stopped,
            current_sample_rate: 0,
            pending: VecDeque::new(),
            frames_played: 0,
            updated_at: None,
            device_frames: 0,
            gain_left: UNITY_GAIN,
            gain_right: UNITY_GAIN,
            replay_gain: None,
            next_replay_gain: None,
            fade_mode: FadeMode::None,
            fade_duration: Duration::ZERO,
            fade: None,
            cross_skip: 0,
            pause_frames: 0,
            skip_frames: 0,
            start_at: None,
            threshold: config.output_threshold,
            dsd: false,
            underrun_events: 0,
            underrun_reported: false,
            drained_reported: false,
        }
    }

    /// Output buffer position of the next track's first frame.
    pub fn track_start(&self) -> Option<usize> {
        self.pending.front().map(|t| t.pos)
    }

    /// Rate of the next track to start, or 0 when none is buffered.
    pub fn next_sample_rate(&self) -> u32 {
        self.pending.front().map_or(0, |t| t.sample_rate)
    }

    /// Tracks buffered but not yet started.
    pub fn pending_tracks(&self) -> usize {
        self.pending.len()
    }

    /// Rate used for silence and duration conversions.
    pub fn rate(&self) -> u32 {
        [self.current_sample_rate, self.next_sample_rate()]
            .into_iter()
            .find(|r| *r > 0)
            .unwrap_or(FALLBACK_RATE)
    }

    fn frames_for(&self, d: Duration) -> u64 {
        (d.as_millis() * self.rate() as u128 / 1000) as u64
    }

    /// Record that the next frames written to `buf` begin a new track.
    ///
    /// Called by the decode stage under the output lock, right before the track's
    /// first write. Several tracks may be buffered at once; each keeps its own rate
    /// and fades until the read cursor reaches it. A fade that ends at the boundary is
    /// measured back from it over the frames of the previous track still buffered.
    pub(crate) fn announce_track(&mut self, buf: &RingBuffer, sample_rate: u32, dsd: bool) {
        let (prev_rate, prev_dsd) = self
            .pending
            .back()
            .map_or((self.current_sample_rate, self.dsd), |t| (t.sample_rate, t.dsd));
        let mut track = PendingTrack {
            pos: buf.write_pos(),
            sample_rate,
            dsd,
            fade_in: None,
            ending: None,
        };

        let frames = (self.fade_duration.as_millis() * sample_rate as u128 / 1000) as u64;
        if frames > 0 && !dsd {
            match self.fade_mode {
                FadeMode::None => {}
                FadeMode::CrossFade => {
                    if prev_rate == sample_rate && !prev_dsd {
                        track.ending = Some((FadeDir::Cross, frames));
                    }
                }
                FadeMode::In => track.fade_in = Some(frames),
                FadeMode::Out => track.ending = Some((FadeDir::Down, frames)),
                FadeMode::InOut => {
                    track.ending = Some((FadeDir::Down, frames / 2));
                    track.fade_in = Some(frames / 2);
                }
            }
        }
        tracing::debug!(
            mode = ?self.fade_mode,
            sample_rate,
            pending = self.pending.len() + 1,
            ending = ?track.ending,
            fade_in_frames = track.fade_in.unwrap_or(0),
            "track announced"
        );
        self.pending.push_back(track);
        self.arm_ending_fade(buf);
    }

    /// Schedule the fade that ends at the next track boundary, if none is running.
    fn arm_ending_fade(&mut self, buf: &RingBuffer) {
        if self.fade.is_some() {
            return;
        }
        let Some(next) = self.pending.front_mut() else {
            return;
        };
        let Some((dir, frames)) = next.ending.take() else {
            return;
        };
        let pos = next.pos;
        let total = frames.min((buf.distance(buf.read_pos(), pos) / BYTES_PER_FRAME) as u64);
        if total == 0 {
            return;
        }
        self.fade = Some(Fade {
            start: Some(buf.offset(pos, buf.size() - total as usize * BYTES_PER_FRAME)),
            ..Fade::running(dir, total)
        });
        tracing::debug!(dir = ?dir, frames = total, "track end fade scheduled");
    }

    /// Begin playback once the start threshold is buffered.
    pub fn start(&mut self) {
        self.state = OutputState::Buffer;
        self.start_at = None;
    }

    /// Stop consuming frames; the buffer is left as is.
    pub fn pause(&mut self) {
        self.state = OutputState::Stopped;
    }

    pub fn unpause(&mut self) {
        self.state = OutputState::Running;
        self.start_at = None;
    }

    /// Resume playback at a wall-clock instant.
    pub fn unpause_at(&mut self, at: Instant) {
        self.state = OutputState::StartAt;
        self.start_at = Some(at);
    }

    /// Insert `d` of silence, then continue playing.
    pub fn pause_for(&mut self, d: Duration) {
        self.pause_frames = self.frames_for(d);
        self.state = OutputState::PauseFrames;
    }

    /// Drop `d` of buffered audio, then continue playing.
    pub fn skip_ahead(&mut self, d: Duration) {
        self.skip_frames = self.frames_for(d);
        self.state = OutputState::SkipFrames;
    }

    pub fn set_gain(&mut self, left: u32, right: u32) {
        self.gain_left = left;
        self.gain_right = right;
    }

    /// Replay gain for the next track to start; `None` clears it.
    pub fn set_replay_gain(&mut self, gain: Option<u32>) {
        self.next_replay_gain = gain;
    }

    pub fn set_fade(&mut self, mode: FadeMode, duration: Duration) {
        self.fade_mode = mode;
        self.fade_duration = duration;
    }

    /// Forget everything tied to buffered frames. Gains, fade mode and rates survive.
    pub(crate) fn reset(&mut self) {
        self.state = OutputState::Stopped;
        self.pending.clear();
        self.frames_played = 0;
        self.updated_at = None;
        self.device_frames = 0;
        self.fade = None;
        self.cross_skip = 0;
        self.pause_frames = 0;
        self.skip_frames = 0;
        self.start_at = None;
        self.underrun_reported = false;
        self.drained_reported = false;
    }
}

/// Frames handed to a sink by one delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub frames: usize,
    /// Frames that came from the buffer rather than the silence pattern.
    pub audio_frames: usize,
}

struct Work {
    pcm_silence: Vec<i32>,
    dsd_silence: Vec<i32>,
    frames: Vec<i32>,
    cross: Vec<i32>,
    events: Vec<PlayerEvent>,
}

impl Work {
    fn silence(&self, out: &OutputStatus, wanted: usize, sink: &mut dyn SinkWriter) -> Delivery {
        let pattern = if out.dsd {
            &self.dsd_silence
        } else {
            &self.pcm_silence
        };
        let frames = wanted.min(pattern.len() / 2);
        if frames == 0 {
            return Delivery::default();
        }
        let block = FrameBlock {
            samples: &pattern[..frames * 2],
            silence: true,
            gain_left: UNITY_GAIN,
            gain_right: UNITY_GAIN,
            cross: None,
            dsd: out.dsd,
            sample_rate: out.rate(),
        };
        Delivery {
            frames: sink.write_frames(&block).min(frames),
            audio_frames: 0,
        }
    }
}

/// Consumer end of the output buffer. One per sink.
pub struct OutputStage {
    shared: Arc<Shared>,
    work: Work,
}

impl OutputStage {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let len = shared.config.silence_frames.max(1) * 2;
        Self {
            shared,
            work: Work {
                pcm_silence: vec![0; len],
                dsd_silence: vec![DSD_SILENCE; len],
                frames: Vec::new(),
                cross: Vec::new(),
                events: Vec::new(),
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Rate the sink should currently run at.
    pub fn sample_rate(&self) -> u32 {
        self.shared.output.lock().state.output.rate()
    }

    /// Hand at most one contiguous segment (or one silence block) to `sink`.
    pub fn deliver(&mut self, wanted: usize, sink: &mut dyn SinkWriter) -> Delivery {
        if wanted == 0 {
            return Delivery::default();
        }
        let now = Instant::now();
        let delivery = {
            let mut g = self.shared.output.lock();
            let Locked { buf, state } = &mut *g;
            let decode = state.decode.state;
            let out = &mut state.output;
            out.device_frames = sink.delay_frames();
            deliver_locked(&mut self.work, buf, out, decode, wanted, sink, now)
        };
        for event in self.work.events.drain(..) {
            self.shared.emit(event);
        }
        if delivery.audio_frames > 0 {
            self.shared.wake.notify();
        }
        delivery
    }

    /// Deliver until `wanted` frames went out or the sink stops accepting.
    pub fn fill(&mut self, wanted: usize, sink: &mut dyn SinkWriter) -> Delivery {
        let mut total = Delivery::default();
        while total.frames < wanted {
            let d = self.deliver(wanted - total.frames, sink);
            if d.frames == 0 {
                break;
            }
            total.frames += d.frames;
            total.audio_frames += d.audio_frames;
        }
        total
    }
}

fn deliver_locked(
    w: &mut Work,
    buf: &mut RingBuffer,
    out: &mut OutputStatus,
    decode: DecodeState,
    wanted: usize,
    sink: &mut dyn SinkWriter,
    now: Instant,
) -> Delivery {
    match out.state {
        OutputState::Stopped => return w.silence(out, wanted, sink),
        OutputState::Buffer => {
            let frames = (buf.used() / BYTES_PER_FRAME) as u64;
            let rate = if out.next_sample_rate() > 0 {
                out.next_sample_rate()
            } else {
                out.rate()
            };
            let needed = (out.threshold.as_millis() * rate as u128 / 1000).max(1) as u64;
            if frames < needed && (frames == 0 || decode == DecodeState::Running) {
                return w.silence(out, wanted, sink);
            }
            tracing::info!(buffered_frames = frames, "output threshold reached");
            out.state = OutputState::Running;
        }
        OutputState::StartAt => {
            if out.start_at.is_some_and(|at| now < at) {
                return w.silence(out, wanted, sink);
            }
            tracing::info!("timed start reached");
            out.start_at = None;
            out.state = OutputState::Running;
        }
        OutputState::PauseFrames if out.pause_frames > 0 => {
            let n = (wanted as u64).min(out.pause_frames) as usize;
            let d = w.silence(out, n, sink);
            out.pause_frames -= d.frames as u64;
            if out.pause_frames == 0 {
                out.state = OutputState::Running;
            }
            return d;
        }
        OutputState::PauseFrames => out.state = OutputState::Running,
        OutputState::SkipFrames => {
            skip(w, buf, out);
            if out.skip_frames > 0 {
                return w.silence(out, wanted, sink);
            }
            out.state = OutputState::Running;
        }
        OutputState::Running => {}
    }
    play(w, buf, out, decode, wanted, sink, now)
}

/// Switch to the next track when the read cursor sits exactly on its first frame.
fn latch_track_start(w: &mut Work, buf: &mut RingBuffer, out: &mut OutputStatus) {
    if out.track_start() != Some(buf.read_pos()) {
        return;
    }
    let Some(track) = out.pending.pop_front() else {
        return;
    };
    out.current_sample_rate = track.sample_rate;
    out.dsd = track.dsd;
    out.replay_gain = out.next_replay_gain.take();
    out.fade = None;

    let skip = out.cross_skip.min((buf.used() / BYTES_PER_FRAME) as u64);
    buf.advance_read(skip as usize * BYTES_PER_FRAME);
    out.frames_played = skip;
    out.cross_skip = 0;
    out.updated_at = None;

    if let Some(frames) = track.fade_in.filter(|f| *f > 0) {
        out.fade = Some(Fade::running(FadeDir::Up, frames));
    }
    out.arm_ending_fade(buf);
    tracing::info!(
        sample_rate = out.current_sample_rate,
        dsd = out.dsd,
        crossfaded_frames = skip,
        "track started"
    );
    w.events.push(PlayerEvent::TrackStarted {
        sample_rate: out.current_sample_rate,
    });
}

fn skip(w: &mut Work, buf: &mut RingBuffer, out: &mut OutputStatus) {
    if out.fade.take().is_some() {
        tracing::debug!("skip cancelled fade");
    }
    while out.skip_frames > 0 {
        latch_track_start(w, buf, out);
        let mut frames = (buf.used() / BYTES_PER_FRAME) as u64;
        if frames == 0 {
            break;
        }
        if let Some(ts) = out.track_start() {
            frames = frames.min((buf.distance(buf.read_pos(), ts) / BYTES_PER_FRAME) as u64);
        }
        frames = frames.min(out.skip_frames);
        buf.advance_read(frames as usize * BYTES_PER_FRAME);
        out.skip_frames -= frames;
        out.frames_played += frames;
    }
    tracing::debug!(remaining = out.skip_frames, "skipped buffered frames");
}

fn load(buf: &RingBuffer, pos: usize, frames: usize, out: &mut Vec<i32>) {
    out.clear();
    out.extend(
        buf.slice_at(pos, frames * BYTES_PER_FRAME)
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
    );
}

fn play(
    w: &mut Work,
    buf: &mut RingBuffer,
    out: &mut OutputStatus,
    decode: DecodeState,
    wanted: usize,
    sink: &mut dyn SinkWriter,
    now: Instant,
) -> Delivery {
    latch_track_start(w, buf, out);

    let used = buf.used() / BYTES_PER_FRAME;
    if used == 0 {
        match decode {
            DecodeState::Complete | DecodeState::Error if !out.drained_reported => {
                out.drained_reported = true;
                tracing::info!(frames_played = out.frames_played, "output drained");
                w.events.push(PlayerEvent::OutputDrained);
            }
            DecodeState::Running if !out.underrun_reported => {
                out.underrun_reported = true;
                out.underrun_events += 1;
                tracing::warn!(underruns = out.underrun_events, "output underrun");
                w.events.push(PlayerEvent::OutputUnderrun);
            }
            _ => {}
        }
        return w.silence(out, wanted, sink);
    }
    out.underrun_reported = false;
    out.drained_reported = false;

    let read = buf.read_pos();
    let mut frames = wanted.min(used).min(buf.cont_read() / BYTES_PER_FRAME);
    if let Some(ts) = out.track_start() {
        frames = frames.min(buf.distance(read, ts) / BYTES_PER_FRAME);
    }
    if let Some(fade) = out.fade.as_mut() {
        if let Some(start) = fade.start {
            let d = buf.distance(read, start) / BYTES_PER_FRAME;
            if d == 0 {
                fade.start = None;
                tracing::debug!(dir = ?fade.dir, frames = fade.total, "fade running");
            } else {
                frames = frames.min(d);
            }
        }
    }

    let (mut gain_left, mut gain_right) = (out.gain_left, out.gain_right);
    if let Some(rg) = out.replay_gain {
        gain_left = combine_gain(gain_left, rg);
        gain_right = combine_gain(gain_right, rg);
    }

    // (position of incoming frames, gain_in, gain_out)
    let mut cross = None;
    if let Some(fade) = out.fade.filter(|f| f.start.is_none()) {
        let remaining = fade.total.saturating_sub(fade.done) as usize;
        frames = frames.min(FADE_STEP).min(remaining.max(1));
        let incoming = match (fade.dir, out.track_start()) {
            (FadeDir::Cross, Some(ts)) => {
                let pos = buf.offset(ts, fade.mixed as usize * BYTES_PER_FRAME);
                let end = out.pending.get(1).map_or(buf.write_pos(), |t| t.pos);
                let ready = (buf.distance(ts, end) / BYTES_PER_FRAME)
                    .saturating_sub(fade.mixed as usize);
                let n = frames.min(ready).min((buf.size() - pos) / BYTES_PER_FRAME);
                (n > 0).then_some((pos, n))
            }
            _ => None,
        };
        if let Some((_, n)) = incoming {
            frames = n;
        }
        let (falling, rising) = fade.levels(frames);
        match (fade.dir, incoming) {
            (FadeDir::Up, _) => {
                gain_left = combine_gain(gain_left, rising);
                gain_right = combine_gain(gain_right, rising);
            }
            (FadeDir::Cross, Some((pos, _))) => cross = Some((pos, rising, falling)),
            (FadeDir::Down | FadeDir::Cross, _) => {
                gain_left = combine_gain(gain_left, falling);
                gain_right = combine_gain(gain_right, falling);
            }
        }
    }

    load(buf, read, frames, &mut w.frames);
    if let Some((pos, _, _)) = cross {
        load(buf, pos, frames, &mut w.cross);
    }
    let block = FrameBlock {
        samples: &w.frames,
        silence: false,
        gain_left,
        gain_right,
        cross: cross.map(|(_, gain_in, gain_out)| CrossBlock {
            samples: &w.cross,
            gain_in,
            gain_out,
        }),
        dsd: out.dsd,
        sample_rate: out.rate(),
    };
    let accepted = sink.write_frames(&block).min(frames);
    if accepted == 0 {
        return Delivery::default();
    }

    buf.advance_read(accepted * BYTES_PER_FRAME);
    out.frames_played += accepted as u64;
    out.updated_at = Some(now);

    let mut finished = None;
    if let Some(fade) = out.fade.as_mut().filter(|f| f.start.is_none()) {
        fade.done += accepted as u64;
        if cross.is_some() {
            fade.mixed += accepted as u64;
        }
        if fade.done >= fade.total {
            finished = Some(*fade);
        }
    }
    if let Some(fade) = finished {
        if fade.dir == FadeDir::Cross {
            out.cross_skip = fade.mixed;
        }
        out.fade = None;
        tracing::debug!(dir = ?fade.dir, "fade finished");
        out.arm_ending_fade(buf);
    }
    tracing::trace!(frames = accepted, "frames delivered");
    Delivery {
        frames: accepted,
        audio_frames: accepted,
    }
}

/// Drop every buffered frame and return the stage to `Stopped`.
pub(crate) fn flush(shared: &Shared) {
    let mut g = shared.output.lock();
    g.buf.reset();
    g.state.output.reset();
}
