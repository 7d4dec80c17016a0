//! Fixed-length buffers for reuse. They back the outbound send requests: allocated once, filled
//!  with one chunk of payload, handed to the transport and returned to the pool.
//!
//! They implement `BufMut` to fit into the `bytes` ecosystem.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-capacity dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers live in a pool for the server's entire lifetime, so there is nothing to
            //  gain from lazy initialization
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_new() {
        let buf = FixedBuf::new(16);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.as_ref(), b"");
    }

    #[rstest]
    #[case::empty(4, vec![], vec![])]
    #[case::partial(4, vec![1, 2], vec![1, 2])]
    #[case::full(4, vec![1, 2, 3, 4], vec![1, 2, 3, 4])]
    fn test_put_slice(#[case] capacity: usize, #[case] data: Vec<u8>, #[case] expected: Vec<u8>) {
        let mut buf = FixedBuf::new(capacity);
        buf.put_slice(&data);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.remaining_mut(), capacity - expected.len());
    }

    #[test]
    #[should_panic]
    fn test_put_beyond_capacity() {
        let mut buf = FixedBuf::new(2);
        buf.put_slice(&[1, 2, 3]);
    }

    #[test]
    fn test_clear() {
        let mut buf = FixedBuf::from_slice(8, b"abc");
        assert_eq!(buf.len(), 3);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_eq_ignores_capacity() {
        assert_eq!(FixedBuf::from_slice(4, b"ab"), FixedBuf::from_slice(8, b"ab"));
        assert_ne!(FixedBuf::from_slice(4, b"ab"), FixedBuf::from_slice(4, b"ac"));
    }
}
