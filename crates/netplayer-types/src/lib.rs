use serde::{Deserialize, Serialize};

/// Stream stage lifecycle.
///
/// Variants are ordered: everything at or below [`StreamState::Disconnect`] means
/// "no more bytes are coming" for the decode stage.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No descriptor open.
    #[default]
    Stopped,
    /// Descriptor closed after EOF or error; waiting for the controller to reset.
    Disconnect,
    /// Headers parsed, body reading held until the controller sends `continue`.
    Wait,
    /// Body bytes flowing, threshold not reached yet.
    Buffering,
    /// Reading a local file.
    StreamingFile,
    /// Body bytes flowing past the buffering threshold.
    StreamingHttp,
    /// Writing the outgoing request header.
    SendHeaders,
    /// Reading the response header one byte at a time.
    RecvHeaders,
}

impl StreamState {
    /// `true` once the byte source is exhausted or was never opened.
    pub fn is_ended(self) -> bool {
        self <= StreamState::Disconnect
    }
}

/// Reason reported with a stream disconnect.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Remote end closed after delivering the whole body.
    #[default]
    Ok,
    /// Closed on request of the controller.
    Local,
    /// Remote end reset or failed mid-stream.
    Remote,
    /// Connection could not be established.
    Unreachable,
    /// Connection attempt or header exchange timed out.
    Timeout,
}

/// Decode stage lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodeState {
    #[default]
    Stopped,
    Running,
    Complete,
    Error,
}

/// Output stage lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    /// Emitting silence, buffer untouched.
    #[default]
    Stopped,
    /// Emitting silence until the start threshold is buffered.
    Buffer,
    /// Playing buffered frames.
    Running,
    /// Emitting a fixed number of silent frames, then running.
    PauseFrames,
    /// Discarding a fixed number of buffered frames, then running.
    SkipFrames,
    /// Emitting silence until a wall-clock instant, then running.
    StartAt,
}

/// Transition applied between tracks.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FadeMode {
    #[default]
    None,
    CrossFade,
    In,
    Out,
    InOut,
}

/// Edge signals raised by the pipeline stages for the controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// Socket connected (or file opened).
    StreamConnected,
    /// Raw response header block received.
    StreamHeaders { headers: String },
    /// Buffered bytes crossed the stream threshold.
    BufferThreshold,
    /// Inline stream metadata block (ICY).
    Metadata { text: String },
    /// Descriptor closed.
    StreamDisconnected { reason: DisconnectReason },
    /// Playback crossed into a new track.
    TrackStarted { sample_rate: u32 },
    /// Decoder consumed the whole track.
    DecodeComplete,
    /// Decoder failed for the current track.
    DecodeError { message: String },
    /// Output ran dry while the decoder was still expected to produce frames.
    OutputUnderrun,
    /// Output played every frame of a completed track.
    OutputDrained,
}

/// Point-in-time view of the three stages, suitable for reporting upstream.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    pub stream_state: StreamState,
    pub disconnect_reason: DisconnectReason,
    /// Body bytes received for the current stream.
    pub stream_bytes: u64,
    pub stream_buffer_used: u64,
    pub stream_buffer_size: u64,
    pub decode_state: DecodeState,
    /// Codec label of the current decoder.
    pub codec: Option<String>,
    pub output_state: OutputState,
    pub output_buffer_used: u64,
    pub output_buffer_size: u64,
    /// Sample rate of the track currently heard.
    pub sample_rate: u32,
    pub frames_played: u64,
    /// Elapsed playback extrapolated to the snapshot instant.
    pub elapsed_ms: u64,
    /// Frames held by the device but not yet audible.
    pub device_frames: u64,
    pub underrun_events: u64,
    /// Output is resampling the current track.
    pub resampling: bool,
}

impl PlayerStatus {
    /// Output buffer fullness in percent.
    pub fn output_fullness_percent(&self) -> u8 {
        percent(self.output_buffer_used, self.output_buffer_size)
    }

    /// Stream buffer fullness in percent.
    pub fn stream_fullness_percent(&self) -> u8 {
        percent(self.stream_buffer_used, self.stream_buffer_size)
    }
}

fn percent(used: u64, size: u64) -> u8 {
    if size == 0 {
        return 0;
    }
    (used.saturating_mul(100) / size).min(100) as u8
}
