//! Codec adapters.
//!
//! A [`Codec`] pulls encoded bytes from the stream buffer through [`DecodeIo`] and
//! pushes interleaved stereo `i32` frames back through it. The decode stage calls
//! [`Codec::decode`] repeatedly; each call should make a bounded amount of progress.

pub mod compressed;
pub mod dsd;
pub mod pcm;

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use symphonia::core::io::MediaSource;

use crate::decode::FrameWriter;
use crate::error::CodecError;
use crate::shared::Shared;
use crate::trim::GaplessTrim;

/// Byte order of raw PCM input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Parameters handed to [`Codec::open`].
///
/// Fields left as `None` are taken from the container header when there is one.
#[derive(Clone, Debug)]
pub struct CodecSpec {
    /// Single-character codec tag, e.g. `'f'` for FLAC.
    pub format: char,
    /// Bits per sample of raw PCM.
    pub sample_size: Option<u16>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub endianness: Option<Endianness>,
    /// Encoder delay and padding, in frames, declared by the controller.
    pub trim: Option<(u64, usize)>,
}

impl CodecSpec {
    pub fn new(format: char) -> Self {
        Self {
            format,
            sample_size: None,
            sample_rate: None,
            channels: None,
            endianness: None,
            trim: None,
        }
    }

    /// Raw PCM with every parameter fixed up front.
    pub fn pcm(sample_size: u16, sample_rate: u32, channels: u16, endianness: Endianness) -> Self {
        Self {
            sample_size: Some(sample_size),
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            endianness: Some(endianness),
            ..Self::new('p')
        }
    }

    pub(crate) fn gapless_trim(&self) -> GaplessTrim {
        match self.trim {
            Some((skip, pad)) => GaplessTrim::new(skip, pad),
            None => GaplessTrim::default(),
        }
    }
}

/// Format of the frames a codec is about to push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackFormat {
    pub sample_rate: u32,
    /// Frames carry 16 DSD bits per channel for DoP framing.
    pub dsd: bool,
}

/// Outcome of one successful [`Codec::decode`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStep {
    /// More input may produce more frames.
    Running,
    /// The track is fully decoded.
    Complete,
}

pub trait Codec: Send {
    /// Tag this adapter is registered under.
    fn format(&self) -> char;

    fn name(&self) -> &'static str;

    /// Buffered input required before a decode call is worthwhile, unless the stream ended.
    fn min_read_bytes(&self) -> usize;

    /// Free output space, in bytes, required before a decode call.
    fn min_space(&self) -> usize;

    fn open(&mut self, spec: &CodecSpec) -> Result<(), CodecError>;

    fn close(&mut self);

    fn decode(&mut self, io: &mut DecodeIo<'_>) -> Result<DecodeStep, CodecError>;
}

pub type CodecFactory = fn() -> Box<dyn Codec>;

/// Codec adapters selectable by tag.
#[derive(Clone)]
pub struct CodecRegistry {
    entries: Vec<(char, CodecFactory)>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry with every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register('p', || Box::new(pcm::PcmCodec::default()));
        registry.register('f', || Box::new(compressed::SymphoniaCodec::flac()));
        registry.register('m', || Box::new(compressed::SymphoniaCodec::mp3()));
        registry.register('a', || Box::new(compressed::SymphoniaCodec::aac()));
        registry.register('l', || Box::new(compressed::SymphoniaCodec::alac()));
        registry.register('o', || Box::new(compressed::SymphoniaCodec::vorbis()));
        registry.register('d', || Box::new(dsd::DsdCodec::default()));
        registry
    }

    /// Add or replace the adapter for `format`.
    pub fn register(&mut self, format: char, factory: CodecFactory) {
        self.entries.retain(|(f, _)| *f != format);
        self.entries.push((format, factory));
    }

    pub fn create(&self, format: char) -> Option<Box<dyn Codec>> {
        self.entries
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, factory)| factory())
    }

    pub fn formats(&self) -> Vec<char> {
        self.entries.iter().map(|(f, _)| *f).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// What a codec sees of the pipeline during one decode call.
pub struct DecodeIo<'a> {
    shared: &'a Arc<Shared>,
    writer: &'a mut FrameWriter,
    progressed: bool,
}

impl<'a> DecodeIo<'a> {
    pub(crate) fn new(shared: &'a Arc<Shared>, writer: &'a mut FrameWriter) -> Self {
        Self {
            shared,
            writer,
            progressed: false,
        }
    }

    /// `true` if the call consumed input or produced frames.
    pub(crate) fn progressed(&self) -> bool {
        self.progressed
    }

    /// Encoded bytes currently buffered.
    pub fn available(&self) -> usize {
        self.shared.stream.lock().buf.used()
    }

    /// No more bytes will arrive for this stream.
    pub fn stream_ended(&self) -> bool {
        self.shared.stream.lock().state.state.is_ended()
    }

    /// Copy buffered bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        self.shared.stream.lock().buf.peek_into(dst)
    }

    /// Drop up to `n` buffered bytes. Returns bytes dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = {
            let mut g = self.shared.stream.lock();
            let n = n.min(g.buf.used());
            g.buf.advance_read(n);
            n
        };
        if n > 0 {
            self.progressed = true;
            self.shared.stream.notify();
        }
        n
    }

    /// Copy and consume buffered bytes.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.shared.stream.lock().buf.read_into(dst);
        if n > 0 {
            self.progressed = true;
            self.shared.stream.notify();
        }
        n
    }

    /// Blocking reader over the stream buffer for libraries that pull their own input.
    pub fn stream_reader(&self) -> StreamReader {
        StreamReader {
            shared: self.shared.clone(),
            generation: self.shared.flush_generation(),
        }
    }

    /// Record progress made through a [`StreamReader`].
    pub fn mark_progress(&mut self) {
        self.progressed = true;
    }

    /// Declare the format of the frames that follow.
    pub fn new_track(&mut self, format: TrackFormat) -> Result<(), CodecError> {
        if format.dsd && !self.shared.config.dop {
            return Err(CodecError::Unsupported(
                "DSD playback needs DoP output enabled".into(),
            ));
        }
        let resample = self.shared.config.resample.as_ref();
        self.writer.new_track(format, resample)
    }

    /// Queue interleaved stereo frames for the output buffer.
    pub fn push_frames(&mut self, samples: &[i32]) {
        if !samples.is_empty() {
            self.progressed = true;
            self.writer.push(samples);
        }
    }
}

/// [`Read`] over the stream buffer that blocks until bytes arrive or the stream ends.
///
/// Reads fail once the pipeline is flushed or shut down, so a codec blocked inside a
/// library call unwinds promptly.
pub struct StreamReader {
    shared: Arc<Shared>,
    generation: u64,
}

impl Read for StreamReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let poll = self.shared.config.stream_poll;
        let mut g = self.shared.stream.lock();
        loop {
            if !self.shared.is_running() || self.shared.flush_generation() != self.generation {
                return Err(io::Error::other("stream flushed"));
            }
            let n = g.buf.read_into(dst);
            if n > 0 {
                drop(g);
                self.shared.stream.notify();
                return Ok(n);
            }
            if g.state.state.is_ended() {
                return Ok(0);
            }
            g = self.shared.stream.wait_timeout(g, poll);
        }
    }
}

impl Seek for StreamReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream buffer is not seekable",
        ))
    }
}

impl MediaSource for StreamReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Convert `frames` of interleaved input with `channels` channels to stereo.
///
/// Mono is duplicated; channels beyond the first two are dropped.
pub(crate) fn to_stereo(samples: &[i32], channels: usize, out: &mut Vec<i32>) {
    match channels {
        0 => {}
        1 => out.extend(samples.iter().flat_map(|&s| [s, s])),
        2 => out.extend_from_slice(samples),
        n => {
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crossbeam_channel::{Receiver, unbounded};
    use netplayer_types::{PlayerEvent, StreamState};

    use super::*;
    use crate::config::PlayerConfig;

    /// Drives a codec directly against a pre-filled stream buffer.
    pub(crate) struct CodecHarness {
        pub(crate) shared: Arc<Shared>,
        writer: FrameWriter,
        _events: Receiver<PlayerEvent>,
    }

    impl CodecHarness {
        pub(crate) fn new(input: &[u8], ended: bool) -> Self {
            Self::with_config(input, ended, PlayerConfig::default())
        }

        pub(crate) fn with_config(input: &[u8], ended: bool, config: PlayerConfig) -> Self {
            let config = PlayerConfig {
                stream_buf_bytes: (input.len() * 2).max(64 * 1024),
                ..config
            };
            let (tx, rx) = unbounded();
            let mut h = Self {
                shared: Arc::new(Shared::new(config, tx).unwrap()),
                writer: FrameWriter::default(),
                _events: rx,
            };
            h.append(input, ended);
            h
        }

        pub(crate) fn append(&mut self, bytes: &[u8], ended: bool) {
            let mut g = self.shared.stream.lock();
            assert_eq!(g.buf.write_from(bytes), bytes.len());
            g.state.state = if ended {
                StreamState::Disconnect
            } else {
                StreamState::StreamingHttp
            };
        }

        pub(crate) fn io(&mut self) -> DecodeIo<'_> {
            DecodeIo::new(&self.shared, &mut self.writer)
        }

        /// Decode until the codec completes; returns every frame it pushed.
        pub(crate) fn run(&mut self, codec: &mut dyn Codec) -> Result<Vec<i32>, CodecError> {
            let mut out = Vec::new();
            for _ in 0..10_000 {
                let step = {
                    let mut io = self.io();
                    codec.decode(&mut io)?
                };
                out.extend(self.writer.take_pending());
                if step == DecodeStep::Complete {
                    self.writer.finish();
                    out.extend(self.writer.take_pending());
                    return Ok(out);
                }
            }
            panic!("codec did not complete");
        }

        pub(crate) fn track(&self) -> Option<TrackFormat> {
            self.writer.track()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_is_duplicated_and_extra_channels_dropped() {
        let mut out = Vec::new();
        to_stereo(&[1, 2], 1, &mut out);
        assert_eq!(out, [1, 1, 2, 2]);

        out.clear();
        to_stereo(&[1, 2, 3, 4, 5, 6], 3, &mut out);
        assert_eq!(out, [1, 2, 4, 5]);
    }

    #[test]
    fn registry_selects_by_tag() {
        let registry = CodecRegistry::with_defaults();
        for tag in ['p', 'f', 'm', 'a', 'l', 'o', 'd'] {
            let codec = registry.create(tag).expect("codec");
            assert_eq!(codec.format(), tag);
        }
        assert!(registry.create('u').is_none());
    }

    #[test]
    fn register_replaces_existing_tag() {
        let mut registry = CodecRegistry::empty();
        registry.register('x', || Box::new(pcm::PcmCodec::default()));
        registry.register('x', || Box::new(dsd::DsdCodec::default()));
        assert_eq!(registry.formats(), vec!['x']);
        assert_eq!(registry.create('x').unwrap().name(), "dsd");
    }
}
