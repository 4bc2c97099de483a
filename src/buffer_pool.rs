use bytes::BytesMut;
use std::sync::Mutex;

/// A bounded pool of receive buffers for the dispatcher's well-known socket.
/// Getting falls back to a fresh allocation when the pool is empty; returning
/// a buffer beyond the bound drops it, so the working set never grows past
/// `max_pool_size` buffers.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
    max_pool_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            max_pool_size,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(mut buffer) = buffers.pop() {
                log::trace!("returning buffer from pool");
                buffer.resize(self.buf_size, 0);
                return buffer;
            }
        }

        log::debug!("no buffer in pool: creating new buffer");
        BytesMut::zeroed(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pool_size {
            buffers.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_sized_buffer() {
        let pool = BufferPool::new(2048, 4);
        let buf = pool.get_from_pool();
        assert_eq!(buf.len(), 2048);
    }

    #[test]
    fn test_buffers_are_recycled() {
        let pool = BufferPool::new(64, 4);
        let buf = pool.get_from_pool();
        pool.return_to_pool(buf);
        assert_eq!(pool.buffers.lock().unwrap().len(), 1);

        let again = pool.get_from_pool();
        assert_eq!(again.len(), 64);
        assert!(pool.buffers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(64, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get_from_pool()).collect();
        for buf in bufs {
            pool.return_to_pool(buf);
        }
        assert_eq!(pool.buffers.lock().unwrap().len(), 2);
    }
}
