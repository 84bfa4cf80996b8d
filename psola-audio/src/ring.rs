//! Circular buffer addressing
//!
//! [`RingIndex`] keeps every position normalized into `[0, len)` so callers
//! can offset by negative amounts without fixing up the modulo themselves.

use std::ops::{Index, IndexMut};

/// Position inside a ring of fixed length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingIndex {
    pos: usize,
    len: usize,
}

impl RingIndex {
    /// Create an index at `pos`, wrapped into the ring
    pub fn new(pos: i64, len: usize) -> Self {
        debug_assert!(len > 0);
        Self {
            pos: Self::wrap(pos, len),
            len,
        }
    }

    /// Wrap any integer position into `[0, len)`
    #[inline]
    pub fn wrap(value: i64, len: usize) -> usize {
        value.rem_euclid(len as i64) as usize
    }

    #[inline]
    pub fn get(self) -> usize {
        self.pos
    }

    /// Ring length this index wraps at
    #[inline]
    pub fn ring_len(self) -> usize {
        self.len
    }

    /// Move forward by `n` samples
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n % self.len) % self.len;
    }

    /// Index `delta` samples away (negative moves backwards)
    #[inline]
    pub fn offset(self, delta: i64) -> Self {
        Self {
            pos: Self::wrap(self.pos as i64 + delta, self.len),
            len: self.len,
        }
    }

    /// Forward distance from `self` to `other`, in `[0, len)`
    #[inline]
    pub fn distance_to(self, other: RingIndex) -> usize {
        debug_assert_eq!(self.len, other.len);
        Self::wrap(other.pos as i64 - self.pos as i64, self.len)
    }

    /// True if `self` lies in the half ring starting at `origin`.
    ///
    /// The ring is split at `origin + len / 2`: positions in
    /// `[origin, origin + len / 2)` are ahead of `origin`, everything else
    /// trails it.
    #[inline]
    pub fn is_ahead_within_half(self, origin: RingIndex) -> bool {
        origin.distance_to(self) < self.len / 2
    }
}

/// Fixed-capacity sample ring addressed by [`RingIndex`]
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<f32>,
}

impl RingBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Index at `pos` wrapped to this ring's length
    pub fn at(&self, pos: i64) -> RingIndex {
        RingIndex::new(pos, self.data.len())
    }

    /// Add `value` into the cell at `at`
    #[inline]
    pub fn accumulate(&mut self, at: RingIndex, value: f32) {
        self[at] += value;
    }

    /// Read the cell at `at` and zero it
    #[inline]
    pub fn take(&mut self, at: RingIndex) -> f32 {
        std::mem::take(&mut self[at])
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }
}

impl Index<RingIndex> for RingBuffer {
    type Output = f32;

    #[inline]
    fn index(&self, at: RingIndex) -> &f32 {
        debug_assert_eq!(at.len, self.data.len());
        &self.data[at.pos]
    }
}

impl IndexMut<RingIndex> for RingBuffer {
    #[inline]
    fn index_mut(&mut self, at: RingIndex) -> &mut f32 {
        debug_assert_eq!(at.len, self.data.len());
        &mut self.data[at.pos]
    }
}
