//! # Cyclic Queue Codec
//!
//! Wrap-around-safe byte writer/reader over one of the four rings living in
//! the shared memory region. The ring is shared with the firmware, so the
//! only mutable shared state is the pair of cursors in the queue control
//! block.
//!
//! ## Memory Ordering
//!
//! ```text
//! producer                          consumer
//! ────────                          ────────
//! load  read_cursor  (Acquire)      load  write_cursor (Acquire)
//! copy payload bytes (Relaxed)      copy payload bytes (Relaxed)
//! store write_cursor (Release) ───► ...
//!                              ◄─── store read_cursor  (Release)
//! ```
//!
//! Cursors are byte offsets in `0..=capacity` stored little-endian. Any
//! cursor beyond the capacity means the control block is corrupted: the codec
//! reports [`QueueError::Corrupted`] before doing any arithmetic with it.
//!
//! A write that exactly fills the free space leaves `write == read`, which
//! the consumer observes as an empty ring. Producers are expected to keep
//! control traffic far below the ring capacity.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Errors specific to queue operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueError {
    /// The message does not fit in the free space of the ring
    InsufficientSpace,
    /// A cursor or the capacity in the control block is out of range
    Corrupted,
    /// Attempted to read more bytes than the batch holds
    Underflow,
}

/// Queue control block as laid out in shared memory: `{wr_ptr, rd_ptr, size}`
#[repr(C)]
#[derive(Debug)]
pub struct QueueControl {
    wr_ptr: AtomicU32,
    rd_ptr: AtomicU32,
    size: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<QueueControl>() == 12);

impl QueueControl {
    /// Create a detached control block, mostly useful for rings that live
    /// outside the shared region (tests, simulators).
    pub const fn new(capacity: u32) -> Self {
        Self {
            wr_ptr: AtomicU32::new(0),
            rd_ptr: AtomicU32::new(0),
            size: AtomicU32::new(capacity.to_le()),
        }
    }

    #[inline]
    pub fn write_cursor(&self) -> u32 {
        u32::from_le(self.wr_ptr.load(Ordering::Acquire))
    }

    #[inline]
    pub fn read_cursor(&self) -> u32 {
        u32::from_le(self.rd_ptr.load(Ordering::Acquire))
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        u32::from_le(self.size.load(Ordering::Relaxed))
    }

    /// Publish a new write cursor. Only the producer may call this.
    #[inline]
    pub fn publish_write(&self, cursor: u32) {
        self.wr_ptr.store(cursor.to_le(), Ordering::Release);
    }

    /// Publish a new read cursor. Only the consumer may call this.
    #[inline]
    pub fn publish_read(&self, cursor: u32) {
        self.rd_ptr.store(cursor.to_le(), Ordering::Release);
    }

    /// Reset both cursors and set the capacity. Used while initializing the
    /// shared region, before the firmware is told about it.
    pub fn init(&self, capacity: u32) {
        self.size.store(capacity.to_le(), Ordering::Relaxed);
        self.rd_ptr.store(0, Ordering::Relaxed);
        self.wr_ptr.store(0, Ordering::Release);
    }

    /// Raw "has unread data" check, without validation
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.wr_ptr.load(Ordering::Acquire) != self.rd_ptr.load(Ordering::Acquire)
    }

    /// Snapshot and validate the cursors
    pub fn cursors(&self) -> Result<Cursors, QueueError> {
        Cursors::new(self.read_cursor(), self.write_cursor(), self.capacity())
    }
}

/// A validated snapshot of the cursors of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cursors {
    pub read: u32,
    pub write: u32,
    pub capacity: u32,
}

impl Cursors {
    /// Validate raw cursor values: both must be within `0..=capacity` and
    /// the capacity must be non-zero.
    pub fn new(read: u32, write: u32, capacity: u32) -> Result<Self, QueueError> {
        if capacity == 0 || read > capacity || write > capacity {
            return Err(QueueError::Corrupted);
        }
        Ok(Self {
            read,
            write,
            capacity,
        })
    }

    /// Bytes written but not yet consumed
    #[inline]
    pub fn occupancy(&self) -> u32 {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.capacity - self.read + self.write
        }
    }

    /// Bytes the producer may still write
    #[inline]
    pub fn free(&self) -> u32 {
        self.capacity - self.occupancy()
    }
}

/// Producer/consumer view of one ring: its control block plus its bytes
#[derive(Clone, Copy)]
pub struct CyclicQueue<'a> {
    ctrl: &'a QueueControl,
    ring: &'a [AtomicU8],
}

impl<'a> CyclicQueue<'a> {
    pub fn new(ctrl: &'a QueueControl, ring: &'a [AtomicU8]) -> Self {
        Self { ctrl, ring }
    }

    pub fn control(&self) -> &'a QueueControl {
        self.ctrl
    }

    /// Load the cursors and check them against both the advertised capacity
    /// and the real size of the ring memory.
    pub fn cursors(&self) -> Result<Cursors, QueueError> {
        let cursors = self.ctrl.cursors()?;
        if cursors.capacity as usize != self.ring.len() {
            return Err(QueueError::Corrupted);
        }
        Ok(cursors)
    }

    pub fn occupancy(&self) -> Result<u32, QueueError> {
        Ok(self.cursors()?.occupancy())
    }

    pub fn free_space(&self) -> Result<u32, QueueError> {
        Ok(self.cursors()?.free())
    }

    /// True when the consumer has not caught up with the producer
    pub fn is_pending(&self) -> bool {
        self.ctrl.is_pending()
    }

    /// Write `bytes` as one unit and publish the new write cursor.
    ///
    /// Returns the published write cursor.
    pub fn write(&self, bytes: &[u8]) -> Result<u32, QueueError> {
        self.write_parts(&[bytes])
    }

    /// Write several slices back to back with a single space check and a
    /// single publish, so a header and its payload appear atomically.
    pub fn write_parts(&self, parts: &[&[u8]]) -> Result<u32, QueueError> {
        let cursors = self.cursors()?;
        let total: usize = parts.iter().map(|p| p.len()).sum();

        if total > cursors.free() as usize {
            return Err(QueueError::InsufficientSpace);
        }

        let mut wr = cursors.write;
        for part in parts {
            wr = copy_in(self.ring, cursors.capacity, wr, part);
        }

        self.ctrl.publish_write(wr);
        Ok(wr)
    }

    /// Read `out.len()` bytes from the read cursor and publish the advanced
    /// read cursor. Not reading past the write cursor is the caller's job.
    pub fn read(&self, out: &mut [u8]) -> Result<u32, QueueError> {
        let cursors = self.cursors()?;
        if out.len() > cursors.capacity as usize {
            return Err(QueueError::Underflow);
        }

        let rd = copy_out(self.ring, cursors.capacity, cursors.read, out);
        self.ctrl.publish_read(rd);
        Ok(rd)
    }

    /// Start a batch read over everything currently published.
    ///
    /// The read cursor is not touched until [`QueueReader::finish`] or
    /// [`QueueReader::commit`].
    pub fn reader(&self) -> Result<QueueReader<'a>, QueueError> {
        let cursors = self.cursors()?;
        Ok(QueueReader {
            ctrl: self.ctrl,
            ring: self.ring,
            rd: cursors.read,
            wr: cursors.write,
            capacity: cursors.capacity,
            remaining: cursors.occupancy(),
        })
    }
}

/// Consumer-side batch over a snapshot of the queue
pub struct QueueReader<'a> {
    ctrl: &'a QueueControl,
    ring: &'a [AtomicU8],
    rd: u32,
    wr: u32,
    capacity: u32,
    remaining: u32,
}

impl QueueReader<'_> {
    /// Bytes left in the snapshot
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Copy the next `out.len()` bytes of the batch
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), QueueError> {
        if out.len() > self.remaining as usize {
            return Err(QueueError::Underflow);
        }
        self.rd = copy_out(self.ring, self.capacity, self.rd, out);
        self.remaining -= out.len() as u32;
        Ok(())
    }

    /// Skip the next `len` bytes of the batch
    pub fn skip(&mut self, len: u32) -> Result<(), QueueError> {
        if len > self.remaining {
            return Err(QueueError::Underflow);
        }
        self.rd = ((self.rd as u64 + len as u64) % self.capacity as u64) as u32;
        self.remaining -= len;
        Ok(())
    }

    /// Publish the local read cursor (everything read or skipped so far)
    pub fn commit(self) -> u32 {
        self.ctrl.publish_read(self.rd);
        self.rd
    }

    /// Consume the whole snapshot: publish the read cursor at the write
    /// cursor observed when the batch started.
    pub fn finish(self) -> u32 {
        self.ctrl.publish_read(self.wr);
        self.wr
    }
}

// A cursor equal to the capacity is legal and means offset 0.
fn copy_in(ring: &[AtomicU8], capacity: u32, wr: u32, data: &[u8]) -> u32 {
    let cap = capacity as usize;
    let mut pos = wr as usize;
    if pos == cap {
        pos = 0;
    }
    for byte in data {
        ring[pos].store(*byte, Ordering::Relaxed);
        pos += 1;
        if pos == cap {
            pos = 0;
        }
    }
    pos as u32
}

fn copy_out(ring: &[AtomicU8], capacity: u32, rd: u32, out: &mut [u8]) -> u32 {
    let cap = capacity as usize;
    let mut pos = rd as usize;
    if pos == cap {
        pos = 0;
    }
    for byte in out.iter_mut() {
        *byte = ring[pos].load(Ordering::Relaxed);
        pos += 1;
        if pos == cap {
            pos = 0;
        }
    }
    pos as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> (QueueControl, Vec<AtomicU8>) {
        let ctrl = QueueControl::new(capacity as u32);
        let bytes = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        (ctrl, bytes)
    }

    #[test]
    fn test_new_queue_is_empty() {
        let (ctrl, bytes) = ring(64);
        let q = CyclicQueue::new(&ctrl, &bytes);
        assert_eq!(q.occupancy(), Ok(0));
        assert_eq!(q.free_space(), Ok(64));
        assert!(!q.is_pending());
    }

    #[test]
    fn test_write_and_read() {
        let (ctrl, bytes) = ring(64);
        let q = CyclicQueue::new(&ctrl, &bytes);

        assert_eq!(q.write(b"hello"), Ok(5));
        assert!(q.is_pending());
        assert_eq!(q.occupancy(), Ok(5));

        let mut out = [0u8; 5];
        assert_eq!(q.read(&mut out), Ok(5));
        assert_eq!(&out, b"hello");
        assert!(!q.is_pending());
    }

    #[test]
    fn test_wrapped_write_fills_free_space_exactly() {
        // 10 bytes stored from offset 12, wrapping to offset 6
        let (ctrl, bytes) = ring(16);
        ctrl.publish_read(12);
        ctrl.publish_write(6);
        let q = CyclicQueue::new(&ctrl, &bytes);
        assert_eq!(q.occupancy(), Ok(10));

        assert_eq!(q.write(&[7u8; 7]), Err(QueueError::InsufficientSpace));
        assert_eq!(ctrl.write_cursor(), 6);
        assert_eq!(ctrl.read_cursor(), 12);

        assert_eq!(q.write(&[9u8; 6]), Ok(12));
        assert_eq!(ctrl.read_cursor(), 12);
        for b in &bytes[6..12] {
            assert_eq!(b.load(Ordering::Relaxed), 9);
        }
    }

    #[test]
    fn test_exact_fill_reads_back_as_empty() {
        // No reserved byte: filling every free byte makes the cursors meet.
        let (ctrl, bytes) = ring(16);
        let q = CyclicQueue::new(&ctrl, &bytes);

        assert_eq!(q.write(&[0xAB; 16]), Ok(0));
        assert_eq!(ctrl.write_cursor(), ctrl.read_cursor());
        assert_eq!(q.occupancy(), Ok(0));
        assert!(!q.is_pending());
        assert_eq!(q.reader().unwrap().remaining(), 0);

        // One byte short of full is still readable.
        assert_eq!(q.write(&[0xCD; 15]), Ok(15));
        assert_eq!(q.occupancy(), Ok(15));
        let mut out = [0u8; 15];
        assert_eq!(q.read(&mut out), Ok(15));
        assert_eq!(out, [0xCD; 15]);
    }

    #[test]
    fn test_out_of_range_cursor_is_corruption() {
        let (ctrl, bytes) = ring(16);
        ctrl.publish_write(17);
        let q = CyclicQueue::new(&ctrl, &bytes);
        assert_eq!(q.occupancy(), Err(QueueError::Corrupted));
        assert_eq!(q.write(b"x"), Err(QueueError::Corrupted));
        assert!(q.reader().is_err());

        ctrl.publish_write(0);
        ctrl.publish_read(u32::MAX);
        assert_eq!(q.free_space(), Err(QueueError::Corrupted));
    }

    #[test]
    fn test_capacity_mismatch_is_corruption() {
        let (ctrl, bytes) = ring(16);
        ctrl.init(32);
        let q = CyclicQueue::new(&ctrl, &bytes);
        assert_eq!(q.write(b"abc"), Err(QueueError::Corrupted));

        ctrl.init(0);
        assert_eq!(q.occupancy(), Err(QueueError::Corrupted));
    }

    #[test]
    fn test_occupancy_bounds() {
        for capacity in [1u32, 7, 16] {
            for read in 0..=capacity {
                for write in 0..=capacity {
                    let c = Cursors::new(read, write, capacity).unwrap();
                    assert!(c.occupancy() <= capacity);
                    assert_eq!(c.occupancy() + c.free(), capacity);
                }
            }
        }
    }

    #[test]
    fn test_drain_reproduces_bytes_at_every_wrap_point() {
        for start in 0..16u32 {
            let (ctrl, bytes) = ring(16);
            ctrl.publish_read(start);
            ctrl.publish_write(start);
            let q = CyclicQueue::new(&ctrl, &bytes);

            let first = [1u8, 2, 3, 4, 5];
            let second = [6u8, 7, 8, 9, 10, 11, 12];
            q.write(&first).unwrap();
            q.write_parts(&[&second[..3], &second[3..]]).unwrap();

            let mut reader = q.reader().unwrap();
            assert_eq!(reader.remaining(), 12);
            let mut out = [0u8; 12];
            reader.read(&mut out).unwrap();
            assert!(reader.is_empty());
            reader.finish();

            assert_eq!(&out[..5], &first);
            assert_eq!(&out[5..], &second);
            assert_eq!(ctrl.read_cursor(), ctrl.write_cursor());
        }
    }

    #[test]
    fn test_reader_underflow_and_skip() {
        let (ctrl, bytes) = ring(8);
        let q = CyclicQueue::new(&ctrl, &bytes);
        q.write(&[1, 2, 3]).unwrap();

        let mut reader = q.reader().unwrap();
        let mut big = [0u8; 4];
        assert_eq!(reader.read(&mut big), Err(QueueError::Underflow));
        reader.skip(2).unwrap();
        let mut one = [0u8; 1];
        reader.read(&mut one).unwrap();
        assert_eq!(one, [3]);
        assert_eq!(reader.skip(1), Err(QueueError::Underflow));
        assert_eq!(reader.commit(), 3);
        assert_eq!(ctrl.read_cursor(), 3);
    }

    #[test]
    fn test_cursor_at_capacity_reads_from_start() {
        let (ctrl, bytes) = ring(4);
        bytes[0].store(0xAA, Ordering::Relaxed);
        bytes[1].store(0xBB, Ordering::Relaxed);
        ctrl.publish_read(4);
        ctrl.publish_write(2);
        let q = CyclicQueue::new(&ctrl, &bytes);
        assert_eq!(q.occupancy(), Ok(2));

        let mut out = [0u8; 2];
        q.read(&mut out).unwrap();
        assert_eq!(out, [0xAA, 0xBB]);
    }
}
