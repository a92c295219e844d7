use std::time::Duration;

use crate::buffer::BYTES_PER_FRAME;

/// Tuning parameters shared by the stream/decode/output stages.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Stream buffer capacity in bytes (encoded data).
    pub stream_buf_bytes: usize,
    /// Output buffer capacity in bytes (decoded frames).
    pub output_buf_bytes: usize,
    /// Readiness wait used by the stream stage between reads.
    pub stream_poll: Duration,
    /// Sleep used by the decode stage when it cannot make progress.
    pub decode_idle: Duration,
    /// Largest silent block emitted per delivery.
    pub silence_frames: usize,
    /// Buffered audio required before `Buffer` switches to `Running`.
    pub output_threshold: Duration,
    /// Consecutive sink recovery attempts before the sink is closed.
    pub sink_retry_limit: u32,
    /// Optional resampling stage used when a track rate is not supported.
    pub resample: Option<ResampleConfig>,
    /// Emit DSD tracks as DoP frames instead of native DSD samples.
    pub dop: bool,
}

impl Default for PlayerConfig {
    /// Defaults tuned for 44.1 kHz stereo with roughly ten seconds of decoded headroom.
    fn default() -> Self {
        Self {
            stream_buf_bytes: 2 * 1024 * 1024,
            output_buf_bytes: 44_100 * BYTES_PER_FRAME * 10,
            stream_poll: Duration::from_millis(100),
            decode_idle: Duration::from_millis(100),
            silence_frames: 2048,
            output_threshold: Duration::from_millis(200),
            sink_retry_limit: 3,
            resample: None,
            dop: false,
        }
    }
}

/// Configuration for the resampling process stage.
#[derive(Clone, Debug)]
pub struct ResampleConfig {
    /// Sample rates the sink can open. Tracks at other rates are resampled.
    pub supported_rates: Vec<u32>,
    /// Resampler input chunk size in frames.
    pub chunk_frames: usize,
}

impl ResampleConfig {
    /// Output rate for a track at `rate`, or `None` when it can play directly.
    ///
    /// Prefers the lowest supported rate that is an integer multiple of the source,
    /// then the highest supported rate.
    pub fn target_rate(&self, rate: u32) -> Option<u32> {
        if self.supported_rates.is_empty() || self.supported_rates.contains(&rate) {
            return None;
        }
        let multiple = self
            .supported_rates
            .iter()
            .copied()
            .filter(|r| rate > 0 && *r > rate && r % rate == 0)
            .min();
        multiple.or_else(|| self.supported_rates.iter().copied().max())
    }
}
