//! Fixed-capacity session buffer for TLS record staging.
//!
//! Each TLS session owns three of these, all sized to the engine's packet
//! buffer size: one for inbound ciphertext, one for inbound plaintext, and
//! one for outbound ciphertext. The layout is linear with start/end offsets
//! rather than a ring: TLS wrap/unwrap needs contiguous slices, so residual
//! bytes are reclaimed with an explicit `compact()` using `copy_within()`.
//!
//! Filling writes at the end (`write_slice()` + `advance_write()`), draining
//! consumes from the front (`as_slice()` + `consume()`). A buffer that is
//! fully consumed resets both offsets, so the flip between fill and drain
//! that a cursor-based buffer would need is implicit here.

/// A fixed-capacity sliding byte buffer with zero-allocation fill and drain.
pub struct SessionBuffer {
    /// Pre-allocated storage, never grown.
    data: Box<[u8]>,
    /// Start offset of unconsumed data (inclusive).
    start: usize,
    /// End offset of unconsumed data (exclusive).
    end: usize,
}

impl SessionBuffer {
    /// Create an empty buffer with the specified capacity.
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Number of unconsumed bytes currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Space available for writing at the end. Space consumed from the
    /// front is only reclaimed by `compact()`.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.data.len() - self.end
    }

    /// The unconsumed bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Writable region at the end. After filling it, call
    /// `advance_write(n)` to publish the bytes.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Mark n bytes written into `write_slice()`.
    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(
            self.end + n <= self.data.len(),
            "SessionBuffer advance_write overflow: end={}, n={}, capacity={}",
            self.end,
            n,
            self.data.len()
        );
        self.end += n;
    }

    /// Append from a slice.
    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        debug_assert!(
            self.remaining_capacity() >= data.len(),
            "SessionBuffer overflow: need {} bytes, have {}",
            data.len(),
            self.remaining_capacity()
        );
        let end = self.end;
        self.data[end..end + data.len()].copy_from_slice(data);
        self.end += data.len();
    }

    /// Consume n bytes from the front.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(
            n <= self.len(),
            "SessionBuffer consume underflow: n={}, len={}",
            n,
            self.len()
        );
        self.start += n;
        if self.start >= self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Copy up to `dst.len()` unconsumed bytes out, consuming them.
    /// Returns the number of bytes copied.
    #[inline]
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        if n > 0 {
            dst[..n].copy_from_slice(&self.data[self.start..self.start + n]);
            self.consume(n);
        }
        n
    }

    /// Move residual bytes to the front, reclaiming consumed space.
    #[inline]
    pub fn compact(&mut self) {
        if self.start > 0 && self.start < self.end {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        } else if self.start >= self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Drop all unconsumed bytes. Used to suppress further flush attempts
    /// once the socket has failed.
    #[inline]
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}
