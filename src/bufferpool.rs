use std::sync::Arc;

use parking_lot::Mutex;

const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

struct Inner {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// A shared pool of reusable byte buffers for the CONNECT splice. A fresh
/// allocation per tunnel would be correct but wasteful under sustained
/// concurrent tunnels; this hands out pre-sized `Vec<u8>`s and reclaims them
/// on release.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Acquire a buffer of the pool's configured size. The returned guard
    /// releases the buffer back to the pool when dropped, on every code
    /// path (including early return or panic-unwind).
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.size]);
        PooledBuffer {
            pool: Arc::clone(&self.inner),
            buf: Some(buf),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

pub struct PooledBuffer {
    pool: Arc<Inner>,
    buf: Option<Vec<u8>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquired_buffer_has_configured_size() {
        let pool = BufferPool::new(4096);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn released_buffer_is_reused() {
        let pool = BufferPool::new(1024);
        {
            let _buf = pool.acquire();
        }
        assert_eq!(pool.inner.free.lock().len(), 1);
        let _buf = pool.acquire();
        assert_eq!(pool.inner.free.lock().len(), 0);
    }
}
