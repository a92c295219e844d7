use std::path::Path;
use std::time::Duration;

use netplayer_core::config::{PlayerConfig, ResampleConfig};
use netplayer_core::pack::SampleFormat;
use netplayer_types::FadeMode;

use crate::cli::{Args, OutputKind};

/// Everything the local controller needs for one `play` run.
#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub sources: Vec<String>,
    pub codec: Option<char>,
    pub threshold_bytes: u64,
    pub device: Option<String>,
    pub output: OutputKind,
    pub format: SampleFormat,
    pub gain: f32,
    pub fade: FadeMode,
    pub fade_duration: Duration,
    pub player: PlayerConfig,
}

impl PlayConfig {
    pub fn from_args(args: &Args, sources: Vec<String>, codec: Option<char>, threshold_kb: u64) -> Self {
        Self {
            sources,
            codec,
            threshold_bytes: threshold_kb * 1024,
            device: args.device.clone(),
            output: args.output,
            format: args.format,
            gain: args.gain,
            fade: args.fade.into(),
            fade_duration: Duration::from_millis(args.fade_ms),
            player: player_config(args),
        }
    }

    /// Codec tag for `source`: the explicit one, else a guess from the extension.
    pub fn codec_for(&self, source: &str) -> char {
        self.codec.unwrap_or_else(|| codec_from_extension(source))
    }
}

fn player_config(args: &Args) -> PlayerConfig {
    let defaults = PlayerConfig::default();
    let resample = (!args.rates.is_empty()).then(|| ResampleConfig {
        supported_rates: args.rates.clone(),
        chunk_frames: args.chunk_frames.max(1),
    });
    PlayerConfig {
        stream_buf_bytes: args.stream_buf_kb * 1024,
        output_buf_bytes: args.output_buf_kb * 1024,
        output_threshold: Duration::from_millis(args.output_threshold_ms),
        resample,
        dop: args.dop,
        ..defaults
    }
}

/// Map a file extension to a codec tag; unknown extensions fall back to PCM.
pub fn codec_from_extension(source: &str) -> char {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("flac") => 'f',
        Some("mp3") => 'm',
        Some("aac") | Some("m4a") | Some("mp4") => 'a',
        Some("alac") => 'l',
        Some("ogg") | Some("oga") => 'o',
        Some("dsf") => 'd',
        _ => 'p',
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn extension_picks_codec() {
        assert_eq!(codec_from_extension("/music/a.FLAC"), 'f');
        assert_eq!(codec_from_extension("http://host/b.mp3?sid=1"), 'm');
        assert_eq!(codec_from_extension("c.dsf"), 'd');
        assert_eq!(codec_from_extension("d.wav"), 'p');
        assert_eq!(codec_from_extension("noext"), 'p');
    }

    #[test]
    fn args_map_to_player_config() {
        let args = Args::parse_from([
            "netplayer",
            "--stream-buf-kb",
            "512",
            "--rates",
            "48000",
            "--dop",
            "play",
            "x.ogg",
        ]);
        let cfg = PlayConfig::from_args(&args, vec!["x.ogg".into()], None, 16);
        assert_eq!(cfg.player.stream_buf_bytes, 512 * 1024);
        assert!(cfg.player.dop);
        assert_eq!(cfg.threshold_bytes, 16 * 1024);
        let resample = cfg.player.resample.as_ref().unwrap();
        assert_eq!(resample.supported_rates, vec![48_000]);
        assert_eq!(cfg.codec_for("x.ogg"), 'o');
    }

    #[test]
    fn explicit_codec_wins() {
        let args = Args::parse_from(["netplayer", "play", "--codec", "f", "stream"]);
        let cfg = PlayConfig::from_args(&args, vec!["stream".into()], Some('f'), 64);
        assert_eq!(cfg.codec_for("stream"), 'f');
        assert!(cfg.player.resample.is_none());
    }
}
