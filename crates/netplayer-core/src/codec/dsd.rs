//! DSD from DSF files, emitted as DoP payload frames.
//!
//! Each output frame carries 16 consecutive DSD bits per channel in bits 8..24,
//! oldest bit first; the sink adds the alternating DoP marker byte. The frame rate
//! is the DSD bit rate divided by 16.

use super::{Codec, CodecSpec, DecodeIo, DecodeStep, TrackFormat};
use crate::buffer::BYTES_PER_FRAME;
use crate::error::CodecError;

const HEADER_BYTES: usize = 28 + 52 + 12;

#[derive(Clone, Copy, Debug)]
struct DsfHeader {
    channels: usize,
    bit_rate: u32,
    lsb_first: bool,
    block_size: usize,
    /// Header bytes before the first data block.
    len: usize,
    /// Output frames still expected from the declared sample count.
    frames: u64,
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn parse_dsf(h: &[u8]) -> Result<DsfHeader, CodecError> {
    if &h[..4] != b"DSD " {
        return Err(CodecError::Unsupported("only DSF streams are supported".into()));
    }
    let fmt = le64(h, 4) as usize;
    if fmt.saturating_add(52) > h.len() || &h[fmt..fmt + 4] != b"fmt " {
        return Err(CodecError::Malformed("DSF fmt chunk missing".into()));
    }
    let fmt_size = le64(h, fmt + 4) as usize;
    let data = fmt.saturating_add(fmt_size);
    if data.saturating_add(12) > h.len() {
        return Err(CodecError::Malformed("DSF fmt chunk too large".into()));
    }
    if &h[data..data + 4] != b"data" {
        return Err(CodecError::Malformed("DSF data chunk missing".into()));
    }

    let channels = le32(h, fmt + 24) as usize;
    let bit_rate = le32(h, fmt + 28);
    let bits = le32(h, fmt + 32);
    let sample_count = le64(h, fmt + 36);
    let block_size = le32(h, fmt + 44) as usize;
    if !(1..=2).contains(&channels) {
        return Err(CodecError::Unsupported(format!("{channels}-channel DSD")));
    }
    if bit_rate == 0 || block_size == 0 || block_size % 2 != 0 {
        return Err(CodecError::Malformed("bad DSF format chunk".into()));
    }
    Ok(DsfHeader {
        channels,
        bit_rate,
        lsb_first: bits == 1,
        block_size,
        len: data + 12,
        frames: sample_count / 16,
    })
}

#[derive(Default)]
pub struct DsdCodec {
    header: Option<DsfHeader>,
    block: Vec<u8>,
    frames: Vec<i32>,
}

impl Codec for DsdCodec {
    fn format(&self) -> char {
        'd'
    }

    fn name(&self) -> &'static str {
        "dsd"
    }

    fn min_read_bytes(&self) -> usize {
        8192
    }

    fn min_space(&self) -> usize {
        2048 * BYTES_PER_FRAME
    }

    fn open(&mut self, _spec: &CodecSpec) -> Result<(), CodecError> {
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        self.header = None;
    }

    fn decode(&mut self, io: &mut DecodeIo<'_>) -> Result<DecodeStep, CodecError> {
        let header = match self.header {
            Some(h) => h,
            None => {
                let ended = io.stream_ended();
                if io.available() < HEADER_BYTES {
                    if ended {
                        return Err(CodecError::Malformed("truncated DSF header".into()));
                    }
                    return Ok(DecodeStep::Running);
                }
                let mut head = vec![0u8; HEADER_BYTES];
                io.peek(&mut head);
                let header = parse_dsf(&head)?;
                io.consume(header.len);
                io.new_track(TrackFormat {
                    sample_rate: header.bit_rate / 16,
                    dsd: true,
                })?;
                tracing::debug!(
                    channels = header.channels,
                    bit_rate = header.bit_rate,
                    frames = header.frames,
                    "dsf header"
                );
                self.header = Some(header);
                header
            }
        };

        let group = header.block_size * header.channels;
        if header.frames == 0 {
            return Ok(DecodeStep::Complete);
        }
        let avail = io.available().min(group);
        if avail < group && !io.stream_ended() {
            return Ok(DecodeStep::Running);
        }
        if avail == 0 {
            return Ok(DecodeStep::Complete);
        }

        self.block.clear();
        self.block.resize(group, 0);
        let got = io.read(&mut self.block[..avail]);
        // A truncated last group still carries whole byte pairs for every channel.
        let last = got.saturating_sub((header.channels - 1) * header.block_size);
        let n = ((last.min(header.block_size) / 2) as u64).min(header.frames) as usize;
        if got < group {
            tracing::warn!(bytes = got, frames = n, "truncated final dsf block");
            if let Some(h) = self.header.as_mut() {
                h.frames = n as u64;
            }
        }
        self.frames.clear();
        for i in 0..n {
            for ch in 0..2 {
                let src = (if header.channels == 1 { 0 } else { ch }) * header.block_size + i * 2;
                let (mut b0, mut b1) = (self.block[src], self.block[src + 1]);
                if header.lsb_first {
                    b0 = b0.reverse_bits();
                    b1 = b1.reverse_bits();
                }
                self.frames.push(((b0 as i32) << 16) | ((b1 as i32) << 8));
            }
        }
        if let Some(h) = self.header.as_mut() {
            h.frames -= n as u64;
        }
        io.push_frames(&self.frames);
        Ok(DecodeStep::Running)
    }
}
