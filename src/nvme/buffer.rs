use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Mutex;

use crate::nvme::types::LOG_PAGE_BYTES;

/// Free-list of 4 KiB log page buffers. Slabs are allocated on demand,
/// single-owner while leased, and zero-filled when they come back so no bytes
/// from one device are ever visible through another device's read.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Leases a buffer for one ioctl + parse. The lease returns the buffer to
    /// the pool on drop, on every exit path.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let slab = {
            let mut free = match self.free.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            free.pop()
        };

        let slab = slab.unwrap_or_else(|| vec![0_u8; LOG_PAGE_BYTES].into_boxed_slice());
        PooledBuffer {
            pool: self,
            slab: Some(slab),
        }
    }

    fn release(&self, mut slab: Box<[u8]>) {
        slab.fill(0);
        let mut free = match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        free.push(slab);
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        match self.free.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    slab: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.slab.as_ref().expect("buffer leased until drop")
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.slab.as_mut().expect("buffer leased until drop")
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.pool.release(slab);
        }
    }
}
