use std::sync::{Arc, Mutex, PoisonError};
use bytes::BufMut;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;
use crate::conn::ConnId;

/// Bounded pool of outbound chunk buffers. All buffers are allocated up front, and the pool never
///  grows: when it is empty, `try_get` fails instead of allocating, which is what bounds the
///  memory held by queued sends.
pub struct SendBufferPool {
    buf_size: usize,
    pool_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl SendBufferPool {
    pub fn new(buf_size: usize, pool_size: usize) -> SendBufferPool {
        SendBufferPool {
            buf_size,
            pool_size,
            buffers: Mutex::new((0..pool_size).map(|_| FixedBuf::new(buf_size)).collect()),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// number of buffers currently available
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn try_get(&self) -> Option<FixedBuf> {
        let result = self.buffers.lock().unwrap_or_else(PoisonError::into_inner).pop();
        if result.is_none() {
            debug!("send buffer pool is exhausted");
        }
        result
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        if buffer.capacity() != self.buf_size {
            debug!("discarding returned buffer with irregular capacity {}", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// One chunk of outbound data for a connection, queued for the network thread. The request owns
///  a pool buffer, and dropping the request (written, discarded, or never executed because the
///  server went away) returns the buffer to the pool.
pub struct SendRequest {
    conn_id: ConnId,
    buf: Option<FixedBuf>,
    pool: Arc<SendBufferPool>,
}

impl SendRequest {
    /// Takes a buffer from the pool and copies `chunk` into it. Returns `None` if the pool is
    ///  exhausted. `chunk` must not exceed the pool's buffer size.
    pub fn try_new(pool: &Arc<SendBufferPool>, conn_id: ConnId, chunk: &[u8]) -> Option<SendRequest> {
        if chunk.len() > pool.buf_size() {
            debug!("chunk of {} bytes exceeds send buffer size {}", chunk.len(), pool.buf_size());
            return None;
        }

        let mut buf = pool.try_get()?;
        buf.put_slice(chunk);
        Some(SendRequest {
            conn_id,
            buf: Some(buf),
            pool: pool.clone(),
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => buf.as_ref(),
            None => &[],
        }
    }
}

impl Drop for SendRequest {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_to_pool(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preallocated() {
        let pool = SendBufferPool::new(8, 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.buf_size(), 8);

        let buf = pool.try_get().unwrap();
        assert_eq!(buf.capacity(), 8);
        assert!(buf.is_empty());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let pool = SendBufferPool::new(8, 2);
        let a = pool.try_get().unwrap();
        let _b = pool.try_get().unwrap();
        assert!(pool.try_get().is_none());

        pool.return_to_pool(a);
        assert!(pool.try_get().is_some());
    }

    #[test]
    fn test_return_clears() {
        let pool = SendBufferPool::new(8, 1);
        let mut buf = pool.try_get().unwrap();
        buf.put_slice(b"abc");
        pool.return_to_pool(buf);

        assert!(pool.try_get().unwrap().is_empty());
    }

    #[test]
    fn test_return_never_grows_pool() {
        let pool = SendBufferPool::new(8, 1);
        pool.return_to_pool(FixedBuf::new(8));
        assert_eq!(pool.available(), 1);

        pool.return_to_pool(FixedBuf::new(16));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_request_returns_buffer_on_drop() {
        let pool = Arc::new(SendBufferPool::new(4, 2));

        let request = SendRequest::try_new(&pool, ConnId::from_raw(7), b"abcd").unwrap();
        assert_eq!(request.conn_id(), ConnId::from_raw(7));
        assert_eq!(request.payload(), b"abcd");
        assert_eq!(request.len(), 4);
        assert_eq!(pool.available(), 1);

        drop(request);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_request_pool_exhausted() {
        let pool = Arc::new(SendBufferPool::new(4, 1));
        let _held = SendRequest::try_new(&pool, ConnId::from_raw(1), b"a").unwrap();
        assert!(SendRequest::try_new(&pool, ConnId::from_raw(1), b"b").is_none());
    }

    #[test]
    fn test_request_oversized_chunk() {
        let pool = Arc::new(SendBufferPool::new(4, 1));
        assert!(SendRequest::try_new(&pool, ConnId::from_raw(1), b"abcde").is_none());
        assert_eq!(pool.available(), 1);
    }
}
