//! Status snapshots for the controller.
//!
//! Each buffer lock is taken on its own; a snapshot never holds both.

use std::time::{Duration, Instant};

use netplayer_types::{OutputState, PlayerStatus};

use crate::shared::Shared;

/// Elapsed playback of the current track in milliseconds.
///
/// Frames still queued in the device are not audible yet and are subtracted. While
/// playing, the time since the last delivery is added so polls between deliveries
/// see a smoothly advancing clock.
pub fn elapsed_ms(frames_played: u64, device_frames: u64, sample_rate: u32, since_update: Option<Duration>) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    let heard = frames_played.saturating_sub(device_frames);
    let ms = heard.saturating_mul(1000) / sample_rate as u64;
    ms + since_update.map_or(0, |d| d.as_millis() as u64)
}

pub(crate) fn snapshot(shared: &Shared) -> PlayerStatus {
    let mut status = PlayerStatus::default();
    {
        let g = shared.stream.lock();
        status.stream_state = g.state.state;
        status.disconnect_reason = g.state.disconnect;
        status.stream_bytes = g.state.bytes;
        status.stream_buffer_used = g.buf.used() as u64;
        status.stream_buffer_size = g.buf.size() as u64;
    }

    let now = Instant::now();
    let g = shared.output.lock();
    let out = &g.state.output;
    status.decode_state = g.state.decode.state;
    status.codec = g.state.decode.codec.map(str::to_owned);
    status.resampling = !g.state.decode.direct;
    status.output_state = out.state;
    status.output_buffer_used = g.buf.used() as u64;
    status.output_buffer_size = g.buf.size() as u64;
    status.sample_rate = out.current_sample_rate;
    status.frames_played = out.frames_played;
    status.device_frames = out.device_frames;
    status.underrun_events = out.underrun_events;
    let since = match out.state {
        OutputState::Running => out.updated_at.map(|at| now.saturating_duration_since(at)),
        _ => None,
    };
    status.elapsed_ms = elapsed_ms(out.frames_played, out.device_frames, out.current_sample_rate, since);
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_subtracts_device_delay() {
        assert_eq!(elapsed_ms(44_100, 4_410, 44_100, None), 900);
        assert_eq!(elapsed_ms(100, 400, 44_100, None), 0);
    }

    #[test]
    fn elapsed_extrapolates_between_deliveries() {
        assert_eq!(elapsed_ms(48_000, 0, 48_000, Some(Duration::from_millis(25))), 1025);
    }

    #[test]
    fn unknown_rate_reports_zero() {
        assert_eq!(elapsed_ms(1_000, 0, 0, Some(Duration::from_secs(1))), 0);
    }

    #[test]
    fn snapshot_reports_buffer_sizes_and_states() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let shared = Shared::new(crate::config::PlayerConfig::default(), tx).unwrap();
        let status = snapshot(&shared);
        assert_eq!(status.output_state, OutputState::Stopped);
        assert_eq!(status.stream_buffer_size, 2 * 1024 * 1024);
        assert_eq!(status.output_buffer_size % 8, 0);
        assert_eq!(status.codec, None);
        assert!(!status.resampling);
    }
}
