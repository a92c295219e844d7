//! State owned by a pipeline and shared with its stage threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use netplayer_types::PlayerEvent;

use crate::buffer::{BYTES_PER_FRAME, SharedBuffer};
use crate::config::PlayerConfig;
use crate::decode::CodecSlot;
use crate::output::OutputShared;
use crate::stream::StreamStatus;

/// Level-triggered wakeup for the decode stage.
pub(crate) struct Wake {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Wake {
    fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_one();
    }

    /// Block until notified or `timeout` elapses, consuming the notification.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !*pending {
            pending = match self.cv.wait_timeout(pending, timeout) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        *pending = false;
    }
}

pub(crate) struct Shared {
    pub(crate) config: PlayerConfig,
    /// Encoded bytes plus stream state.
    pub(crate) stream: SharedBuffer<StreamStatus>,
    /// Decoded frames plus decode and output state.
    pub(crate) output: SharedBuffer<OutputShared>,
    /// Current codec; held by the decode stage for the length of a decode call.
    pub(crate) codec: Mutex<CodecSlot>,
    pub(crate) wake: Wake,
    running: AtomicBool,
    /// Bumped by flush so blocked codec reads give up.
    flush_gen: AtomicU64,
    events: Sender<PlayerEvent>,
}

impl Shared {
    pub(crate) fn new(config: PlayerConfig, events: Sender<PlayerEvent>) -> Result<Self> {
        let stream = SharedBuffer::new(config.stream_buf_bytes, StreamStatus::default())
            .context("allocate stream buffer")?;
        let output = SharedBuffer::new(config.output_buf_bytes, OutputShared::new(&config))
            .context("allocate output buffer")?;
        // Frames must never straddle the wrap point.
        output.adjust(BYTES_PER_FRAME);
        Ok(Self {
            config,
            stream,
            output,
            codec: Mutex::new(CodecSlot::default()),
            wake: Wake::new(),
            running: AtomicBool::new(true),
            flush_gen: AtomicU64::new(0),
            events,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask every stage loop to exit and wake anything blocked.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.flush_gen.fetch_add(1, Ordering::AcqRel);
        self.stream.notify();
        self.output.notify();
        self.wake.notify();
    }

    pub(crate) fn flush_generation(&self) -> u64 {
        self.flush_gen.load(Ordering::Acquire)
    }

    pub(crate) fn begin_flush(&self) {
        self.flush_gen.fetch_add(1, Ordering::AcqRel);
        self.stream.notify();
    }

    pub(crate) fn lock_codec(&self) -> MutexGuard<'_, CodecSlot> {
        self.codec.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forward an edge event to the controller. A dropped receiver is not an error.
    pub(crate) fn emit(&self, event: PlayerEvent) {
        tracing::debug!(?event, "event");
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn wake_notification_is_level_triggered() {
        let wake = Wake::new();
        wake.notify();
        let start = Instant::now();
        wake.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wake_times_out_without_notification() {
        let wake = Arc::new(Wake::new());
        let start = Instant::now();
        wake.wait(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));

        let w = wake.clone();
        let handle = thread::spawn(move || w.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        wake.notify();
        handle.join().unwrap();
    }

    #[test]
    fn emit_ignores_dropped_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Shared::new(PlayerConfig::default(), tx).unwrap();
        drop(rx);
        shared.emit(PlayerEvent::DecodeComplete);
        assert!(shared.is_running());
        shared.stop();
        assert!(!shared.is_running());
    }
}
