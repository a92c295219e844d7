//! Compressed formats decoded with Symphonia: FLAC, MP3, AAC, ALAC and Vorbis.
//!
//! The container is probed lazily on the first decode call, once enough bytes are
//! buffered (or the stream already ended). Symphonia pulls input through a blocking
//! [`super::StreamReader`], so each decode call handles exactly one packet.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{Codec, CodecSpec, DecodeIo, DecodeStep, TrackFormat, to_stereo};
use crate::error::CodecError;

const PROBE_BYTES: usize = 16 * 1024;

struct Active {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: Option<u32>,
    announced: bool,
}

pub struct SymphoniaCodec {
    tag: char,
    name: &'static str,
    extension: &'static str,
    active: Option<Active>,
    stereo: Vec<i32>,
}

impl SymphoniaCodec {
    fn new(tag: char, name: &'static str, extension: &'static str) -> Self {
        Self {
            tag,
            name,
            extension,
            active: None,
            stereo: Vec::new(),
        }
    }

    pub fn flac() -> Self {
        Self::new('f', "flac", "flac")
    }

    pub fn mp3() -> Self {
        Self::new('m', "mp3", "mp3")
    }

    pub fn aac() -> Self {
        Self::new('a', "aac", "aac")
    }

    pub fn alac() -> Self {
        Self::new('l', "alac", "m4a")
    }

    pub fn vorbis() -> Self {
        Self::new('o', "vorbis", "ogg")
    }

    /// Probe the container and build a decoder. `false` means "wait for more input".
    fn start(&mut self, io: &mut DecodeIo<'_>) -> Result<bool, CodecError> {
        if io.available() < PROBE_BYTES && !io.stream_ended() {
            return Ok(false);
        }

        let mss = MediaSourceStream::new(Box::new(io.stream_reader()), Default::default());
        let mut hint = Hint::new();
        hint.with_extension(self.extension);
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &format_opts,
            &MetadataOptions::default(),
        )?;
        io.mark_progress();

        let reader = probed.format;
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| CodecError::Malformed("no decodable audio track".into()))?;
        let decoder =
            symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        tracing::debug!(
            codec = self.name,
            sample_rate = ?track.codec_params.sample_rate,
            channels = ?track.codec_params.channels.map(|c| c.count()),
            "container probed"
        );
        self.active = Some(Active {
            track_id: track.id,
            sample_rate: track.codec_params.sample_rate,
            reader,
            decoder,
            announced: false,
        });
        Ok(true)
    }
}

fn is_eof(e: &SymphoniaError) -> bool {
    matches!(e, SymphoniaError::IoError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}

impl Codec for SymphoniaCodec {
    fn format(&self) -> char {
        self.tag
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn min_read_bytes(&self) -> usize {
        2048
    }

    fn min_space(&self) -> usize {
        32 * 1024
    }

    fn open(&mut self, _spec: &CodecSpec) -> Result<(), CodecError> {
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        self.active = None;
    }

    fn decode(&mut self, io: &mut DecodeIo<'_>) -> Result<DecodeStep, CodecError> {
        if self.active.is_none() && !self.start(io)? {
            return Ok(DecodeStep::Running);
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(DecodeStep::Running);
        };

        let packet = match active.reader.next_packet() {
            Ok(packet) => packet,
            Err(e) if is_eof(&e) => return Ok(DecodeStep::Complete),
            Err(SymphoniaError::ResetRequired) => return Ok(DecodeStep::Complete),
            Err(e) => return Err(e.into()),
        };
        io.mark_progress();
        if packet.track_id() != active.track_id {
            return Ok(DecodeStep::Running);
        }

        let decoded = match active.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(codec = self.name, error = e, "skipping undecodable packet");
                return Ok(DecodeStep::Running);
            }
            Err(e) if is_eof(&e) => return Ok(DecodeStep::Complete),
            Err(e) => return Err(e.into()),
        };
        if decoded.frames() == 0 {
            return Ok(DecodeStep::Running);
        }

        let spec = *decoded.spec();
        if !active.announced {
            io.new_track(TrackFormat {
                sample_rate: active.sample_rate.unwrap_or(spec.rate),
                dsd: false,
            })?;
            active.announced = true;
        }

        let mut samples = SampleBuffer::<i32>::new(decoded.frames() as u64, spec);
        samples.copy_interleaved_ref(decoded);
        self.stereo.clear();
        to_stereo(samples.samples(), spec.channels.count(), &mut self.stereo);
        io.push_frames(&self.stereo);
        Ok(DecodeStep::Running)
    }
}
