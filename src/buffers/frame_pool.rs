use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Pool of encode buffers for outbound frames. A buffer is taken before encoding and
///  returned once the bytes are on the wire, which keeps the send hot path free of
///  per-frame allocations.
pub struct FrameBufferPool {
    buf_capacity: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl FrameBufferPool {
    pub fn new(buf_capacity: usize, max_pool_size: usize) -> FrameBufferPool {
        FrameBufferPool {
            buf_capacity,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_capacity)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() != self.buf_capacity {
            // an oversized frame grew the buffer; keeping it would bloat the pool
            debug!("discarding buffer with irregular capacity {}", buffer.capacity());
            return;
        }

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = FrameBufferPool::new(16, 4);

        let mut buf = pool.get_from_pool();
        buf.put_u8(1);
        buf.put_u8(2);
        pool.return_to_pool(buf);

        assert!(pool.get_from_pool().is_empty());
    }

    #[test]
    fn test_grown_buffer_is_discarded() {
        let pool = FrameBufferPool::new(16, 4);

        let mut buf = pool.get_from_pool();
        buf.put_slice(&[0u8; 64]);
        pool.return_to_pool(buf);

        assert_eq!(0, pool.buffers.lock().unwrap().len());
    }

    #[test]
    fn test_full_pool_discards() {
        let pool = FrameBufferPool::new(16, 1);
        let a = pool.get_from_pool();
        let b = pool.get_from_pool();
        pool.return_to_pool(a);
        pool.return_to_pool(b);

        assert_eq!(1, pool.buffers.lock().unwrap().len());
    }
}
