//! Fixed-capacity circular byte buffers shared between pipeline stages.
//!
//! [`RingBuffer`] is the plain cursor arithmetic; it is never locked by itself.
//! [`SharedBuffer`] pairs one ring with the small state record that lives "next to" it
//! (stream state beside the stream buffer, decode/output state beside the output buffer)
//! under a single mutex, plus a [`Condvar`] used as an occupancy-changed signal.
//!
//! One byte is always kept free so that `read == write` unambiguously means empty.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};

/// Internal frame layout of the output buffer: interleaved L/R `i32`.
pub const BYTES_PER_FRAME: usize = 8;

/// Circular byte buffer with explicit read/write cursors.
///
/// Cursors are indices in `0..size`; `size` is the wrap point and may be smaller than
/// the allocation after [`RingBuffer::adjust`].
pub struct RingBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    size: usize,
    base_size: usize,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let data = allocate(capacity)?;
        Ok(Self {
            data,
            read: 0,
            write: 0,
            size: capacity,
            base_size: capacity,
        })
    }

    /// Current wrap point (usable capacity including the reserved byte).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity requested at allocation time.
    pub fn base_size(&self) -> usize {
        self.base_size
    }

    pub fn read_pos(&self) -> usize {
        self.read
    }

    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// Bytes currently holding data.
    pub fn used(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.size - (self.read - self.write)
        }
    }

    /// Bytes free for writing.
    pub fn space(&self) -> usize {
        self.size - self.used() - 1
    }

    /// Readable bytes before the wrap point.
    pub fn cont_read(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.size - self.read
        }
    }

    /// Bytes before the wrap point (or the read cursor) from the write cursor.
    ///
    /// This is not clamped to [`RingBuffer::space`]; writers take the minimum.
    pub fn cont_write(&self) -> usize {
        if self.write >= self.read {
            self.size - self.write
        } else {
            self.read - self.write
        }
    }

    /// Bytes that can be written in one contiguous copy.
    pub fn writable_len(&self) -> usize {
        self.space().min(self.cont_write())
    }

    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.used(), "read cursor overtook write cursor");
        self.read = self.offset(self.read, n);
    }

    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.space(), "write cursor overtook read cursor");
        self.write = self.offset(self.write, n);
    }

    /// Position `n` bytes after `pos`, wrapping at the wrap point.
    pub fn offset(&self, pos: usize, n: usize) -> usize {
        let p = pos + n % self.size;
        if p >= self.size { p - self.size } else { p }
    }

    /// Forward distance in bytes from `from` to `to`.
    pub fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            self.size - (from - to)
        }
    }

    /// Contiguous readable bytes at the read cursor.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read..self.read + self.cont_read()]
    }

    /// Contiguous writable bytes at the write cursor, clamped to free space.
    pub fn writable(&mut self) -> &mut [u8] {
        let len = self.writable_len();
        &mut self.data[self.write..self.write + len]
    }

    /// Contiguous bytes starting at an arbitrary cursor `pos`, at most `len` long.
    pub fn slice_at(&self, pos: usize, len: usize) -> &[u8] {
        let end = (pos + len).min(self.size);
        &self.data[pos..end]
    }

    /// Copy as much of `src` as fits, splitting at the wrap point. Returns bytes copied.
    pub fn write_from(&mut self, src: &[u8]) -> usize {
        let mut done = 0;
        while done < src.len() {
            let dst = self.writable();
            let n = dst.len().min(src.len() - done);
            if n == 0 {
                break;
            }
            dst[..n].copy_from_slice(&src[done..done + n]);
            self.advance_write(n);
            done += n;
        }
        done
    }

    /// Copy buffered bytes into `dst` without consuming them.
    pub fn peek_into(&self, dst: &mut [u8]) -> usize {
        let want = dst.len().min(self.used());
        let first = want.min(self.cont_read());
        dst[..first].copy_from_slice(&self.data[self.read..self.read + first]);
        let second = want - first;
        if second > 0 {
            dst[first..want].copy_from_slice(&self.data[..second]);
        }
        want
    }

    /// Copy buffered bytes into `dst` and consume them.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek_into(dst);
        self.advance_read(n);
        n
    }

    /// Append interleaved samples as native-endian bytes. Returns whole frames written.
    pub fn write_samples(&mut self, samples: &[i32]) -> usize {
        let frames = (self.space() / BYTES_PER_FRAME).min(samples.len() / 2);
        for sample in &samples[..frames * 2] {
            self.write_from(&sample.to_ne_bytes());
        }
        frames
    }

    /// Reset both cursors without reallocating.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Shrink the wrap point to the largest multiple of `frame_size` within the base size.
    pub fn adjust(&mut self, frame_size: usize) {
        let frame_size = frame_size.max(1);
        self.size = (self.base_size / frame_size * frame_size).max(frame_size * 2);
        self.size = self.size.min(self.data.len());
        self.reset();
    }

    /// Replace the storage, discarding contents. The old storage survives a failure.
    pub fn reallocate(&mut self, capacity: usize) -> Result<()> {
        let data = allocate(capacity)?;
        self.data = data;
        self.size = capacity;
        self.base_size = capacity;
        self.reset();
        Ok(())
    }
}

fn allocate(capacity: usize) -> Result<Vec<u8>> {
    if capacity < 2 {
        return Err(anyhow!("ring buffer capacity {capacity} is too small"));
    }
    let mut data = Vec::new();
    data.try_reserve_exact(capacity)
        .map_err(|e| anyhow!("allocate {capacity} byte ring buffer: {e}"))?;
    data.resize(capacity, 0);
    Ok(data)
}

/// Ring plus its colocated state record, as seen while the lock is held.
pub struct Locked<S> {
    pub buf: RingBuffer,
    pub state: S,
}

/// A [`RingBuffer`] and state record guarded by one mutex.
pub struct SharedBuffer<S> {
    inner: Mutex<Locked<S>>,
    cv: Condvar,
}

impl<S> SharedBuffer<S> {
    pub fn new(capacity: usize, state: S) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Locked {
                buf: RingBuffer::new(capacity)?,
                state,
            }),
            cv: Condvar::new(),
        })
    }

    /// Acquire the lock. A poisoned lock is recovered; stage loops must keep running.
    pub fn lock(&self) -> MutexGuard<'_, Locked<S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake anyone waiting for an occupancy change.
    pub fn notify(&self) {
        self.cv.notify_all();
    }

    /// Release the lock while waiting for a notification or the timeout.
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Locked<S>>,
        timeout: Duration,
    ) -> MutexGuard<'a, Locked<S>> {
        match self.cv.wait_timeout(guard, timeout) {
            Ok((g, _)) => g,
            Err(e) => e.into_inner().0,
        }
    }

    /// Discard buffered bytes.
    pub fn flush(&self) {
        self.lock().buf.reset();
        self.notify();
    }

    /// Re-align the wrap point to `frame_size` and discard contents.
    pub fn adjust(&self, frame_size: usize) {
        self.lock().buf.adjust(frame_size);
        self.notify();
    }

    /// Reallocate to `capacity`. On failure the previous storage is kept.
    pub fn resize(&self, capacity: usize) -> bool {
        let mut g = self.lock();
        match g.buf.reallocate(capacity) {
            Ok(()) => {
                drop(g);
                self.notify();
                true
            }
            Err(e) => {
                tracing::warn!(capacity, error = %e, "buffer resize failed; keeping previous storage");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x & 0xff) as u8
            })
            .collect()
    }

    #[test]
    fn used_plus_space_plus_one_is_size() {
        let mut rb = RingBuffer::new(37).unwrap();
        let steps = [(10, 0), (20, 5), (0, 25), (30, 0), (3, 33), (6, 2), (0, 9)];
        for (w, r) in steps {
            let w = w.min(rb.space());
            rb.advance_write(w);
            let r = r.min(rb.used());
            rb.advance_read(r);
            assert_eq!(rb.used() + rb.space() + 1, rb.size());
            assert!(rb.cont_read() <= rb.used());
            assert!(rb.writable_len() <= rb.space());
        }
    }

    #[test]
    fn contiguous_spans_never_cross_wrap() {
        let mut rb = RingBuffer::new(16).unwrap();
        rb.advance_write(12);
        rb.advance_read(10);
        rb.advance_write(4);
        // write cursor wrapped to 0, read cursor at 10
        assert_eq!(rb.write_pos(), 0);
        assert_eq!(rb.cont_read(), 6);
        assert_eq!(rb.used(), 6);
        assert_eq!(rb.cont_write(), 10);
        assert_eq!(rb.writable_len(), 9);
    }

    #[test]
    fn write_cannot_exceed_space() {
        let mut rb = RingBuffer::new(8).unwrap();
        let n = rb.write_from(&[1u8; 20]);
        assert_eq!(n, 7);
        assert_eq!(rb.space(), 0);
        assert_eq!(rb.write_from(&[2u8; 4]), 0);
    }

    #[test]
    fn straddling_write_round_trips() {
        let mut rb = RingBuffer::new(64).unwrap();
        rb.advance_write(50);
        rb.advance_read(50);
        let data = pseudo_random(40, 0x1234_5678);
        assert_eq!(rb.write_from(&data), 40);
        assert_eq!(rb.write_pos(), 26);
        let mut out = vec![0u8; 40];
        assert_eq!(rb.read_into(&mut out), 40);
        assert_eq!(out, data);
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut rb = RingBuffer::new(16).unwrap();
        rb.write_from(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(rb.peek_into(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.used(), 6);
    }

    #[test]
    fn adjust_aligns_wrap_to_frame_size() {
        let mut rb = RingBuffer::new(1000).unwrap();
        rb.advance_write(10);
        rb.adjust(24);
        assert_eq!(rb.size(), 984);
        assert_eq!(rb.used(), 0);
        assert_eq!(rb.base_size(), 1000);
    }

    #[test]
    fn samples_never_split_when_frame_aligned() {
        let mut rb = RingBuffer::new(40).unwrap();
        rb.adjust(BYTES_PER_FRAME);
        rb.advance_write(32);
        rb.advance_read(32);
        let frames = rb.write_samples(&[1, 2, 3, 4]);
        assert_eq!(frames, 2);
        assert_eq!(rb.write_pos(), 8);
        assert_eq!(rb.cont_read(), 8);
    }

    #[test]
    fn offset_and_distance_wrap() {
        let rb = RingBuffer::new(10).unwrap();
        assert_eq!(rb.offset(8, 4), 2);
        assert_eq!(rb.distance(8, 2), 4);
        assert_eq!(rb.distance(2, 8), 6);
        assert_eq!(rb.distance(5, 5), 0);
    }

    #[test]
    fn reallocate_discards_and_resizes() {
        let mut rb = RingBuffer::new(10).unwrap();
        rb.write_from(b"xyz");
        rb.reallocate(32).unwrap();
        assert_eq!(rb.size(), 32);
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn failed_reallocate_keeps_storage() {
        let mut rb = RingBuffer::new(10).unwrap();
        rb.write_from(b"xyz");
        assert!(rb.reallocate(1).is_err());
        assert_eq!(rb.size(), 10);
        assert_eq!(rb.used(), 3);
    }

    #[test]
    fn shared_flush_resets_cursors() {
        let shared = SharedBuffer::new(16, ()).unwrap();
        shared.lock().buf.write_from(b"hello");
        shared.flush();
        assert_eq!(shared.lock().buf.used(), 0);
    }
}
