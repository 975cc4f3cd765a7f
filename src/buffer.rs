//! Fixed-capacity connection buffer with explicit length bookkeeping.
//!
//! Every connection owns one `Buffer`. Transport pulls land in the free
//! tail, parsers read the filled prefix, and consumed bytes are removed
//! with an in-place compaction. Capacity never grows: a header block that
//! does not fit is an overflow condition handled by the frame detector,
//! not by reallocation.

/// Owned byte buffer with a fixed capacity and an explicit fill level.
///
/// Invariant: `len <= capacity` at all times. All region arguments are
/// bounds-checked.
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
}

impl Buffer {
    /// Creates a buffer with the given capacity, initially empty.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes, starting at offset 0.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no valid bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if there is no free tail left.
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Free space remaining after the valid bytes.
    pub fn free(&self) -> usize {
        self.data.len() - self.len
    }

    /// The valid bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The writable tail after the valid bytes. Bytes written here become
    /// valid only after a matching `advance`.
    pub fn free_tail(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[len..]
    }

    /// Marks `n` bytes of the free tail as valid.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.free(), "advance past buffer capacity");
        self.len += n;
    }

    /// Appends as many of `src`'s bytes as fit, returning how many were
    /// copied.
    pub fn extend(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        let len = self.len;
        self.data[len..len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Removes the first `n` valid bytes, shifting the remainder to
    /// offset 0.
    pub fn consume(&mut self, n: usize) {
        self.consume_at(0, n);
    }

    /// Removes `n` valid bytes starting at `start`, shifting the bytes
    /// after the removed region down in place.
    ///
    /// This is the single compaction primitive: `mg_read`-style body
    /// consumption removes from the middle, everything else removes from
    /// the front.
    pub fn consume_at(&mut self, start: usize, n: usize) {
        assert!(start <= self.len, "consume_at start out of range");
        assert!(n <= self.len - start, "consume_at length out of range");
        self.data.copy_within(start + n..self.len, start);
        self.len -= n;
    }

    /// Discards all valid bytes.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}
