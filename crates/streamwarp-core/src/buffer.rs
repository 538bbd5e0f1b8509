//! Buffer regions used by stream sessions.
//!
//! [`SendBuffer`] is the double-buffered send region: application
//! writes accumulate in the main region while the flush region is
//! drained to the kernel, and the two swap when the flush region
//! empties. [`RecvBuffer`] is the growable receive region a session
//! reads into; it is never handed out past a callback.

/// Double-buffered send region.
///
/// Appends go to the main region; the writer drains the flush region.
/// When the flush region empties the main region is swapped into its
/// place, preserving append order while allowing concurrent append and
/// flush.
#[derive(Debug)]
pub struct SendBuffer {
    main: Vec<u8>,
    flush: Vec<u8>,
    flush_offset: usize,
    limit: usize,
    overflow: bool,
}

impl SendBuffer {
    /// Creates an empty send region with the given pending-byte limit
    /// (0 = unbounded).
    pub fn new(limit: usize) -> Self {
        Self { main: Vec::new(), flush: Vec::new(), flush_offset: 0, limit, overflow: false }
    }

    /// Appends bytes to the main region.
    ///
    /// Returns `false` without appending when the pending total would
    /// exceed the limit.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.limit > 0 && self.pending() + data.len() > self.limit {
            return false;
        }
        self.main.extend_from_slice(data);
        self.overflow = false;
        true
    }

    /// Total bytes not yet handed to the kernel.
    pub fn pending(&self) -> usize {
        self.main.len() + self.flush.len() - self.flush_offset
    }

    /// Whether both regions are fully drained.
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Configured pending-byte limit (0 = unbounded).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Replaces the pending-byte limit.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Swaps the main region into the flush position if the flush
    /// region is drained. Returns `true` if the flush region holds data
    /// afterwards.
    pub fn prepare_flush(&mut self) -> bool {
        if self.flush_offset == self.flush.len() {
            self.flush.clear();
            self.flush_offset = 0;
            std::mem::swap(&mut self.main, &mut self.flush);
        }
        self.flush_offset < self.flush.len()
    }

    /// Unwritten part of the flush region.
    pub fn flush_chunk(&self) -> &[u8] {
        &self.flush[self.flush_offset..]
    }

    /// Marks `n` bytes of the flush region as written.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.flush_offset + n <= self.flush.len());
        self.flush_offset += n;
    }

    /// Drops all pending data.
    pub fn clear(&mut self) {
        self.main.clear();
        self.flush.clear();
        self.flush_offset = 0;
        self.overflow = false;
    }

    /// Records an overflow rejection; returns `true` only on the first
    /// rejection since the region was last below the limit.
    pub fn note_overflow(&mut self) -> bool {
        let first = !self.overflow;
        self.overflow = true;
        first
    }
}

/// Growable receive region.
///
/// Starts at a configured initial size and doubles whenever a read
/// fills it completely, up to an optional limit.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl RecvBuffer {
    /// Creates a receive region of `initial` bytes with a growth limit
    /// (0 = unbounded).
    pub fn new(initial: usize, limit: usize) -> Self {
        Self { buf: vec![0; initial.max(1)], limit }
    }

    /// The whole region as a writable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Current capacity of the region.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Configured growth limit (0 = unbounded).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Replaces the growth limit.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Doubles the region, clamped to the limit. Returns `false` when
    /// the region is already at its limit.
    pub fn grow(&mut self) -> bool {
        let current = self.buf.len();
        let mut target = current.saturating_mul(2);
        if self.limit > 0 {
            target = target.min(self.limit);
        }
        if target <= current {
            return false;
        }
        self.buf.resize(target, 0);
        true
    }
}
