//! Size-bucketed buffer pool. `acquire(n)` returns a
//! slab of length at least `n`; `release(slab)` returns it to the pool. The
//! pool's correctness requirement is ownership-transfer: once a slab is
//! released, the caller must not touch it again.
//!
//! Used on both the input path (`Write` copies the incoming frame into a
//! pooled slab before handing it to the stack engine) and the output path
//! (the engine copies an outbound chain into a pooled slab before releasing
//! the stack lock, so the egress adapter never touches stack-owned memory).

use parking_lot::Mutex;

const BUCKET_SIZES: &[usize] = &[256, 1500, 4096, 16384, 65536];
const MAX_SLABS_PER_BUCKET: usize = 64;

/// An owned, reusable byte slab. Dropping it without calling
/// [`BufferPool::release`] simply frees the backing allocation; it does not
/// corrupt the pool.
pub struct Slab {
    buf: Vec<u8>,
    bucket: usize,
}

impl Slab {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

struct Bucket {
    size: usize,
    free: Vec<Vec<u8>>,
}

pub struct BufferPool {
    buckets: Mutex<Vec<Bucket>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        let buckets = BUCKET_SIZES
            .iter()
            .map(|&size| Bucket { size, free: Vec::new() })
            .collect();
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    fn bucket_for(&self, n: usize) -> usize {
        BUCKET_SIZES
            .iter()
            .position(|&size| size >= n)
            .unwrap_or(BUCKET_SIZES.len() - 1)
    }

    /// Returns a slab of length exactly `n` (capacity at least that of its
    /// bucket). Frames larger than the largest bucket get a one-off
    /// allocation that is never pooled.
    pub fn acquire(&self, n: usize) -> Slab {
        let bucket_idx = self.bucket_for(n);
        let bucket_size = BUCKET_SIZES[bucket_idx];
        if n > bucket_size {
            return Slab {
                buf: vec![0u8; n],
                bucket: BUCKET_SIZES.len(),
            };
        }
        let mut buckets = self.buckets.lock();
        let mut buf = buckets[bucket_idx].free.pop().unwrap_or_else(|| vec![0u8; bucket_size]);
        buf.resize(n, 0);
        Slab { buf, bucket: bucket_idx }
    }

    /// Returns `slab` to the pool. The caller must not retain any reference
    /// to it after this call.
    pub fn release(&self, mut slab: Slab) {
        if slab.bucket >= BUCKET_SIZES.len() {
            return;
        }
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[slab.bucket];
        if bucket.free.len() < MAX_SLABS_PER_BUCKET {
            slab.buf.resize(bucket.size, 0);
            bucket.free.push(std::mem::take(&mut slab.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_slab_of_requested_length() {
        let pool = BufferPool::new();
        let slab = pool.acquire(100);
        assert_eq!(slab.len(), 100);
    }

    #[test]
    fn released_slab_is_reused() {
        let pool = BufferPool::new();
        let slab = pool.acquire(200);
        pool.release(slab);
        let reused = pool.acquire(200);
        assert_eq!(reused.len(), 200);
    }

    #[test]
    fn oversized_request_bypasses_pooling() {
        let pool = BufferPool::new();
        let slab = pool.acquire(1_000_000);
        assert_eq!(slab.len(), 1_000_000);
        pool.release(slab);
    }
}
