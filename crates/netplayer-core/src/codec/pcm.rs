//! Uncompressed PCM: raw sample streams, WAV and AIFF.
//!
//! A RIFF or FORM header at the start of the stream overrides the parameters given
//! at open. Header parsing only peeks, so it resumes cleanly when the header has not
//! fully arrived yet.

use super::{Codec, CodecSpec, DecodeIo, DecodeStep, Endianness, TrackFormat, to_stereo};
use crate::buffer::BYTES_PER_FRAME;
use crate::error::CodecError;
use crate::trim::GaplessTrim;

const CHUNK_FRAMES: usize = 4096;
const MAX_HEADER_PEEK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Layout {
    bits: u16,
    channels: u16,
    rate: u32,
    endianness: Endianness,
    /// WAV stores 8-bit samples unsigned.
    unsigned8: bool,
}

impl Layout {
    fn frame_bytes(&self) -> usize {
        self.bits as usize / 8 * self.channels as usize
    }

    fn validate(self) -> Result<Self, CodecError> {
        if !matches!(self.bits, 8 | 16 | 24 | 32) {
            return Err(CodecError::Unsupported(format!("{}-bit PCM", self.bits)));
        }
        if self.channels == 0 || self.rate == 0 {
            return Err(CodecError::Malformed(format!(
                "{} channels at {} Hz",
                self.channels, self.rate
            )));
        }
        Ok(self)
    }
}

/// Header found at the start of the stream.
struct Header {
    layout: Layout,
    /// Bytes before the first sample.
    len: usize,
    /// Declared sample bytes, when the container states it.
    data_len: Option<u64>,
}

#[derive(Default)]
pub struct PcmCodec {
    spec: Option<CodecSpec>,
    layout: Option<Layout>,
    data_left: Option<u64>,
    trim: GaplessTrim,
    raw: Vec<u8>,
    decoded: Vec<i32>,
    stereo: Vec<i32>,
    trimmed: Vec<i32>,
}

impl PcmCodec {
    /// Find the sample layout, consuming any container header. `None` means "need more bytes".
    fn read_header(&mut self, io: &mut DecodeIo<'_>) -> Result<Option<Layout>, CodecError> {
        let ended = io.stream_ended();
        let avail = io.available().min(MAX_HEADER_PEEK);
        if avail < 12 && !ended {
            return Ok(None);
        }
        let mut head = vec![0u8; avail];
        let n = io.peek(&mut head);
        head.truncate(n);

        let parsed = match head.get(..4) {
            Some(b"RIFF") => parse_wav(&head)?,
            Some(b"FORM") => parse_aiff(&head)?,
            _ => {
                return self.raw_layout().map(Some);
            }
        };
        match parsed {
            Some(header) => {
                io.consume(header.len);
                self.data_left = header.data_len;
                tracing::debug!(
                    bits = header.layout.bits,
                    channels = header.layout.channels,
                    rate = header.layout.rate,
                    data_len = ?header.data_len,
                    "pcm header"
                );
                Ok(Some(header.layout))
            }
            None if ended || avail >= MAX_HEADER_PEEK => {
                Err(CodecError::Malformed("truncated PCM container header".into()))
            }
            None => Ok(None),
        }
    }

    fn raw_layout(&self) -> Result<Layout, CodecError> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| CodecError::Backend("codec not open".into()))?;
        match (spec.sample_size, spec.sample_rate, spec.channels) {
            (Some(bits), Some(rate), Some(channels)) => Layout {
                bits,
                channels,
                rate,
                endianness: spec.endianness.unwrap_or(Endianness::Little),
                unsigned8: false,
            }
            .validate(),
            _ => Err(CodecError::Malformed(
                "raw PCM needs sample size, rate and channels".into(),
            )),
        }
    }
}

impl Codec for PcmCodec {
    fn format(&self) -> char {
        'p'
    }

    fn name(&self) -> &'static str {
        "pcm"
    }

    fn min_read_bytes(&self) -> usize {
        4096
    }

    fn min_space(&self) -> usize {
        CHUNK_FRAMES * BYTES_PER_FRAME
    }

    fn open(&mut self, spec: &CodecSpec) -> Result<(), CodecError> {
        self.close();
        self.trim = spec.gapless_trim();
        self.spec = Some(spec.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.spec = None;
        self.layout = None;
        self.data_left = None;
        self.trim = GaplessTrim::default();
    }

    fn decode(&mut self, io: &mut DecodeIo<'_>) -> Result<DecodeStep, CodecError> {
        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                let Some(layout) = self.read_header(io)? else {
                    return Ok(DecodeStep::Running);
                };
                io.new_track(TrackFormat {
                    sample_rate: layout.rate,
                    dsd: false,
                })?;
                self.layout = Some(layout);
                layout
            }
        };

        let frame_bytes = layout.frame_bytes();
        let ended = io.stream_ended();
        let avail = io.available();
        if self.data_left == Some(0) || (ended && avail < frame_bytes) {
            if avail > 0 && self.data_left != Some(0) {
                // Trailing partial frame.
                io.consume(avail);
            }
            let dropped = self.trim.finish();
            if dropped > 0 {
                tracing::debug!(frames = dropped, "dropped trailing padding");
            }
            return Ok(DecodeStep::Complete);
        }

        let mut want = avail.min(CHUNK_FRAMES * frame_bytes);
        if let Some(left) = self.data_left {
            want = want.min(left.min(usize::MAX as u64) as usize);
        }
        want -= want % frame_bytes;
        if want == 0 {
            return Ok(DecodeStep::Running);
        }

        self.raw.resize(want, 0);
        let got = io.read(&mut self.raw);
        self.raw.truncate(got - got % frame_bytes);
        if let Some(left) = self.data_left.as_mut() {
            *left -= got as u64;
        }

        self.decoded.clear();
        convert(&self.raw, layout, &mut self.decoded);
        self.stereo.clear();
        to_stereo(&self.decoded, layout.channels as usize, &mut self.stereo);
        self.trimmed.clear();
        self.trim.push(&self.stereo, &mut self.trimmed);
        io.push_frames(&self.trimmed);
        Ok(DecodeStep::Running)
    }
}

/// Widen raw samples to left-justified `i32`.
fn convert(raw: &[u8], layout: Layout, out: &mut Vec<i32>) {
    let big = layout.endianness == Endianness::Big;
    match layout.bits {
        8 if layout.unsigned8 => out.extend(raw.iter().map(|&b| (b as i32 - 128) << 24)),
        8 => out.extend(raw.iter().map(|&b| (b as i8 as i32) << 24)),
        16 => out.extend(raw.chunks_exact(2).map(|c| {
            let v = if big {
                i16::from_be_bytes([c[0], c[1]])
            } else {
                i16::from_le_bytes([c[0], c[1]])
            };
            (v as i32) << 16
        })),
        24 => out.extend(raw.chunks_exact(3).map(|c| {
            let (hi, mid, lo) = if big { (c[0], c[1], c[2]) } else { (c[2], c[1], c[0]) };
            i32::from_be_bytes([hi, mid, lo, 0])
        })),
        _ => out.extend(raw.chunks_exact(4).map(|c| {
            let bytes = [c[0], c[1], c[2], c[3]];
            if big {
                i32::from_be_bytes(bytes)
            } else {
                i32::from_le_bytes(bytes)
            }
        })),
    }
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn parse_wav(h: &[u8]) -> Result<Option<Header>, CodecError> {
    if h.len() < 12 {
        return Ok(None);
    }
    if &h[8..12] != b"WAVE" {
        return Err(CodecError::Malformed("RIFF stream is not WAVE".into()));
    }
    let mut pos = 12;
    let mut layout = None;
    loop {
        if pos + 8 > h.len() {
            return Ok(None);
        }
        let id = &h[pos..pos + 4];
        let size = le32(h, pos + 4) as usize;
        let body = pos + 8;
        match id {
            b"fmt " => {
                if body + 16 > h.len() {
                    return Ok(None);
                }
                let mut tag = le16(h, body);
                if tag == 0xFFFE {
                    if body + 26 > h.len() {
                        return Ok(None);
                    }
                    tag = le16(h, body + 24);
                }
                if tag != 1 {
                    return Err(CodecError::Unsupported(format!("WAV format tag {tag:#x}")));
                }
                let bits = le16(h, body + 14);
                layout = Some(
                    Layout {
                        bits,
                        channels: le16(h, body + 2),
                        rate: le32(h, body + 4),
                        endianness: Endianness::Little,
                        unsigned8: bits == 8,
                    }
                    .validate()?,
                );
            }
            b"data" => {
                let layout =
                    layout.ok_or_else(|| CodecError::Malformed("WAV data before fmt".into()))?;
                let data_len = match size as u32 {
                    0 | u32::MAX => None,
                    n => Some(n as u64),
                };
                return Ok(Some(Header {
                    layout,
                    len: body,
                    data_len,
                }));
            }
            _ => {}
        }
        pos = body + size + (size & 1);
    }
}

fn parse_aiff(h: &[u8]) -> Result<Option<Header>, CodecError> {
    if h.len() < 12 {
        return Ok(None);
    }
    let aifc = match &h[8..12] {
        b"AIFF" => false,
        b"AIFC" => true,
        _ => return Err(CodecError::Malformed("FORM stream is not AIFF".into())),
    };
    let mut pos = 12;
    let mut layout = None;
    loop {
        if pos + 8 > h.len() {
            return Ok(None);
        }
        let id = &h[pos..pos + 4];
        let size = be32(h, pos + 4) as usize;
        let body = pos + 8;
        match id {
            b"COMM" => {
                let need = if aifc { 22 } else { 18 };
                if body + need > h.len() {
                    return Ok(None);
                }
                let endianness = if aifc {
                    match &h[body + 18..body + 22] {
                        b"NONE" | b"twos" => Endianness::Big,
                        b"sowt" => Endianness::Little,
                        other => {
                            return Err(CodecError::Unsupported(format!(
                                "AIFC compression {}",
                                String::from_utf8_lossy(other)
                            )));
                        }
                    }
                } else {
                    Endianness::Big
                };
                layout = Some(
                    Layout {
                        bits: be16(h, body + 6),
                        channels: be16(h, body),
                        rate: extended_to_u32(&h[body + 8..body + 18]),
                        endianness,
                        unsigned8: false,
                    }
                    .validate()?,
                );
            }
            b"SSND" => {
                if body + 8 > h.len() {
                    return Ok(None);
                }
                let layout =
                    layout.ok_or_else(|| CodecError::Malformed("AIFF SSND before COMM".into()))?;
                let offset = be32(h, body) as usize;
                let data_len = size.checked_sub(8 + offset).map(|n| n as u64);
                return Ok(Some(Header {
                    layout,
                    len: body + 8 + offset,
                    data_len: data_len.filter(|n| *n > 0),
                }));
            }
            _ => {}
        }
        pos = body + size + (size & 1);
    }
}

/// 80-bit IEEE extended float (AIFF sample rate) to an integer.
fn extended_to_u32(b: &[u8]) -> u32 {
    let exponent = (((b[0] & 0x7F) as i32) << 8) | b[1] as i32;
    let mantissa = u64::from_be_bytes([b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9]]);
    let shift = 16383 + 63 - exponent;
    if !(0..64).contains(&shift) {
        return 0;
    }
    (mantissa >> shift).min(u32::MAX as u64) as u32
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::testing::CodecHarness;

    pub(crate) fn wav(bits: u16, channels: u16, rate: u32, data: &[u8]) -> Vec<u8> {
        let mut out = b"RIFF".to_vec();
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        let block = channels * bits / 8;
        out.extend_from_slice(&(rate * block as u32).to_le_bytes());
        out.extend_from_slice(&block.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn wav_header_sets_layout_and_stops_at_data_end() {
        let data: Vec<u8> = [100i16, -100, 200, -200]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut stream = wav(16, 2, 48_000, &data);
        stream.extend_from_slice(b"LIST\x04\x00\x00\x00junk");

        let mut h = CodecHarness::new(&stream, true);
        let mut codec = PcmCodec::default();
        codec.open(&CodecSpec::new('p')).unwrap();
        let frames = h.run(&mut codec).unwrap();

        assert_eq!(frames, vec![100 << 16, -100 << 16, 200 << 16, -200 << 16]);
        assert_eq!(
            h.track(),
            Some(TrackFormat {
                sample_rate: 48_000,
                dsd: false
            })
        );
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let stream = wav(16, 1, 8_000, &[1, 0, 2, 0]);
        let mut h = CodecHarness::new(&stream[..20], false);
        let mut codec = PcmCodec::default();
        codec.open(&CodecSpec::new('p')).unwrap();

        let mut io = h.io();
        assert_eq!(codec.decode(&mut io).unwrap(), DecodeStep::Running);
        assert!(!io.progressed());
        drop(io);

        h.append(&stream[20..], true);
        let frames = h.run(&mut codec).unwrap();
        assert_eq!(frames, vec![1 << 16, 1 << 16, 2 << 16, 2 << 16]);
    }

    #[test]
    fn raw_big_endian_24_bit() {
        let stream = [0x12, 0x34, 0x56, 0xFF, 0xFF, 0xFE];
        let mut h = CodecHarness::new(&stream, true);
        let mut codec = PcmCodec::default();
        codec
            .open(&CodecSpec::pcm(24, 44_100, 2, Endianness::Big))
            .unwrap();
        let frames = h.run(&mut codec).unwrap();
        assert_eq!(frames, vec![0x1234_5600, -512]);
    }

    #[test]
    fn raw_without_parameters_is_malformed() {
        let mut h = CodecHarness::new(&[0u8; 64], true);
        let mut codec = PcmCodec::default();
        codec.open(&CodecSpec::new('p')).unwrap();
        assert!(matches!(h.run(&mut codec), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn declared_trim_drops_delay_and_padding() {
        let data: Vec<u8> = (1..=6i16).flat_map(|v| [v.to_le_bytes(), v.to_le_bytes()].concat()).collect();
        let mut h = CodecHarness::new(&data, true);
        let mut codec = PcmCodec::default();
        let spec = CodecSpec {
            trim: Some((2, 1)),
            ..CodecSpec::pcm(16, 44_100, 2, Endianness::Little)
        };
        codec.open(&spec).unwrap();
        let frames = h.run(&mut codec).unwrap();
        let lefts: Vec<i32> = frames.iter().step_by(2).map(|s| s >> 16).collect();
        assert_eq!(lefts, vec![3, 4, 5]);
    }

    #[test]
    fn aiff_rate_and_big_endian_samples() {
        let mut comm = Vec::new();
        comm.extend_from_slice(&1u16.to_be_bytes());
        comm.extend_from_slice(&2u32.to_be_bytes());
        comm.extend_from_slice(&16u16.to_be_bytes());
        // 44100 as 80-bit extended.
        comm.extend_from_slice(&[0x40, 0x0E, 0xAC, 0x44, 0, 0, 0, 0, 0, 0]);
        let samples = [0x01, 0x00, 0xFF, 0x00];

        let mut stream = b"FORM\x00\x00\x00\x00AIFFCOMM".to_vec();
        stream.extend_from_slice(&(comm.len() as u32).to_be_bytes());
        stream.extend_from_slice(&comm);
        stream.extend_from_slice(b"SSND");
        stream.extend_from_slice(&(8 + samples.len() as u32).to_be_bytes());
        stream.extend_from_slice(&[0; 8]);
        stream.extend_from_slice(&samples);

        let mut h = CodecHarness::new(&stream, true);
        let mut codec = PcmCodec::default();
        codec.open(&CodecSpec::new('p')).unwrap();
        let frames = h.run(&mut codec).unwrap();
        assert_eq!(frames, vec![0x0100 << 16, 0x0100 << 16, -(0x100 << 16), -(0x100 << 16)]);
        assert_eq!(h.track().map(|t| t.sample_rate), Some(44_100));
    }
}
