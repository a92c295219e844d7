use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use netplayer_core::pack::SampleFormat;
use netplayer_types::FadeMode;

#[derive(Parser, Debug)]
#[command(name = "netplayer", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Where decoded audio goes
    #[arg(long, value_enum, default_value_t = OutputKind::Device)]
    pub output: OutputKind,

    /// Sample layout for `--output stdout`, e.g. s16le, s24_3le, s32le
    #[arg(long, default_value = "s16le")]
    pub format: SampleFormat,

    /// Stream buffer size in KiB (encoded data)
    #[arg(long, default_value_t = 2048)]
    pub stream_buf_kb: usize,

    /// Output buffer size in KiB (decoded frames)
    #[arg(long, default_value_t = 3446)]
    pub output_buf_kb: usize,

    /// Output buffering before playback starts, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub output_threshold_ms: u64,

    /// Comma-separated rates the output can open; other rates are resampled
    #[arg(long, value_delimiter = ',')]
    pub rates: Vec<u32>,

    /// Resampler input chunk size in frames
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Send DSD as DoP frames (requires a 24-bit or wider output)
    #[arg(long)]
    pub dop: bool,

    /// Linear output gain (1.0 = unity)
    #[arg(long, default_value_t = 1.0)]
    pub gain: f32,

    /// Track transition fade
    #[arg(long, value_enum, default_value_t = FadeArg::None)]
    pub fade: FadeArg,

    /// Fade length in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub fade_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one or more sources back to back (http:// URLs or local paths)
    Play {
        #[arg(required = true)]
        sources: Vec<String>,

        /// Codec tag (p, f, m, a, l, o, d); inferred from the extension when omitted
        #[arg(long)]
        codec: Option<char>,

        /// Encoded bytes buffered before decoding starts, in KiB
        #[arg(long, default_value_t = 64)]
        threshold_kb: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputKind {
    /// Play through an audio device
    Device,
    /// Write packed samples to stdout
    Stdout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FadeArg {
    None,
    Cross,
    In,
    Out,
    InOut,
}

impl From<FadeArg> for FadeMode {
    fn from(arg: FadeArg) -> Self {
        match arg {
            FadeArg::None => FadeMode::None,
            FadeArg::Cross => FadeMode::CrossFade,
            FadeArg::In => FadeMode::In,
            FadeArg::Out => FadeMode::Out,
            FadeArg::InOut => FadeMode::InOut,
        }
    }
}

/// Local path of a `play` source, or `None` for URLs.
pub fn local_path(source: &str) -> Option<PathBuf> {
    if source.starts_with("http://") || source.starts_with("https://") {
        None
    } else {
        Some(PathBuf::from(source))
    }
}
