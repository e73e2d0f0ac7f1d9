//! Bounded byte pipe between the muxer read loop and a stream consumer
//!
//! Single producer (the read loop), single consumer (the stream holder).
//! Writes are non-blocking and fail on overflow; reads suspend until data
//! arrives or the pipe closes. After close, reads drain remaining data and
//! then return [`StreamError::EndOfStream`].

use crate::StreamError;
use bytes::{Buf, BytesMut};
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct SharedBuffer {
    inner: Mutex<BufferInner>,
    readable: Notify,
    capacity: usize,
}

struct BufferInner {
    data: BytesMut,
    closed: bool,
}

impl SharedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                data: BytesMut::new(),
                closed: false,
            }),
            readable: Notify::new(),
            capacity,
        }
    }

    /// Append bytes for the consumer. Never blocks.
    ///
    /// Fails with [`StreamError::BufferOverflow`] when the pipe is full
    /// (the peer ignored flow control) and [`StreamError::EndOfStream`]
    /// after close.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(StreamError::EndOfStream);
            }
            if inner.data.len() + data.len() > self.capacity {
                return Err(StreamError::BufferOverflow);
            }
            inner.data.extend_from_slice(data);
        }
        self.readable.notify_one();
        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes, suspending while the pipe is empty and
    /// open. Returns [`StreamError::EndOfStream`] once closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        loop {
            let notified = self.readable.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.data.is_empty() {
                    let n = inner.data.len().min(buf.len());
                    inner.data.copy_to_slice(&mut buf[..n]);
                    return Ok(n);
                }
                if inner.closed {
                    return Err(StreamError::EndOfStream);
                }
            }
            notified.await;
        }
    }

    /// Close the pipe from either end. Idempotent. Pending and future reads
    /// observe end-of-stream once the buffered data drains.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.readable.notify_one();
    }

    /// Bytes currently buffered and unread.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_then_read() {
        let buffer = SharedBuffer::new(1024);
        buffer.write(b"hello").unwrap();

        let mut out = [0u8; 16];
        let n = buffer.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_blocks_until_write() {
        let buffer = Arc::new(SharedBuffer::new(1024));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 4];
                let n = buffer.read(&mut out).await.unwrap();
                out[..n].to_vec()
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        buffer.write(b"ping").unwrap();
        assert_eq!(reader.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_eof_after_drain() {
        let buffer = SharedBuffer::new(1024);
        buffer.write(b"tail").unwrap();
        buffer.close();

        let mut out = [0u8; 16];
        let n = buffer.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"tail");

        assert_eq!(buffer.read(&mut out).await, Err(StreamError::EndOfStream));
        // EOF is sticky
        assert_eq!(buffer.read(&mut out).await, Err(StreamError::EndOfStream));
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let buffer = SharedBuffer::new(1024);
        buffer.close();
        assert_eq!(buffer.write(b"x"), Err(StreamError::EndOfStream));
    }

    #[tokio::test]
    async fn test_overflow() {
        let buffer = SharedBuffer::new(4);
        buffer.write(b"1234").unwrap();
        assert_eq!(buffer.write(b"5"), Err(StreamError::BufferOverflow));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let buffer = Arc::new(SharedBuffer::new(16));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut out = [0u8; 1];
                buffer.read(&mut out).await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        buffer.close();
        assert_eq!(reader.await.unwrap(), Err(StreamError::EndOfStream));
    }
}
