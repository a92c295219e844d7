//! netplayer: a headless network audio player.
//!
//! `play` streams each source (HTTP URL or local file) through the stream, decode and
//! output stages of `netplayer-core` and plays it on a CPAL device or writes packed
//! samples to stdout. Sources play back to back; fades and crossfades are applied at
//! the boundaries when requested.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netplayer::cli::{Args, Command};
use netplayer::config::PlayConfig;
use netplayer::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,netplayer=info,netplayer_core=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    match &args.cmd {
        Some(Command::Play {
            sources,
            codec,
            threshold_kb,
        }) => {
            let config = PlayConfig::from_args(&args, sources.clone(), *codec, *threshold_kb);
            runtime::run_play(config)
        }
        None => {
            anyhow::bail!("nothing to do; try `netplayer play <source>` or --list-devices")
        }
    }
}
