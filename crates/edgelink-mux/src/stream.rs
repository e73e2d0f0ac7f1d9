//! One logical bidirectional stream on a muxer
//!
//! Reads come out of a bounded shared buffer filled by the muxer's read
//! loop; writes queue into an unbounded accumulator drained by the write
//! scheduler, at most one DATA frame per ready-list turn. Each stream
//! carries an adaptive receive window: consuming past half of the current
//! maximum doubles it (up to an absolute ceiling) and stages a credit that
//! the next chunk returns to the peer.

use crate::shared_buffer::SharedBuffer;
use crate::{ReadyList, StreamError};
use bytes::{Bytes, BytesMut};
use edgelink_proto::{Header, StreamId};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, no HEADERS exchanged yet
    Idle,
    /// HEADERS sent or received
    Open,
    /// We sent END_STREAM; the peer may still send
    HalfClosedLocal,
    /// The peer sent END_STREAM; we may still send
    HalfClosedRemote,
    /// Both halves closed, or the stream was reset
    Closed,
}

/// Outbound snapshot produced for the write scheduler.
pub(crate) struct StreamChunk {
    pub stream_id: StreamId,
    /// Headers to emit, taken exactly once per stream lifetime
    pub headers: Option<Vec<Header>>,
    /// At most `min(send_window, frame_cap)` bytes of queued data
    pub data: Bytes,
    /// Receive credit to return to the peer
    pub window_update: u32,
    /// Emit END_STREAM with this chunk
    pub eos: bool,
    /// The stream still has emittable output and must be re-enqueued
    pub has_more: bool,
}

struct StreamInner {
    state: StreamState,
    send_window: u32,
    receive_window: u32,
    receive_window_current_max: u32,
    receive_window_max: u32,
    window_update: u32,
    write_buffer: BytesMut,
    headers_to_send: Option<Vec<Header>>,
    headers_sent: bool,
    received_headers: Option<Vec<Header>>,
    local_closed: bool,
    eos_sent: bool,
    remote_closed: bool,
    reset: Option<u32>,
}

pub struct MuxedStream {
    id: StreamId,
    read_buffer: SharedBuffer,
    inner: Mutex<StreamInner>,
    ready: Arc<ReadyList>,
    headers_tx: watch::Sender<bool>,
    headers_rx: watch::Receiver<bool>,
}

impl MuxedStream {
    pub(crate) fn new(
        id: StreamId,
        ready: Arc<ReadyList>,
        receive_window: u32,
        receive_window_max: u32,
        send_window: u32,
    ) -> Arc<Self> {
        let (headers_tx, headers_rx) = watch::channel(false);
        Arc::new(Self {
            id,
            // Twice the window ceiling: buffered-but-unread bytes plus the
            // full outstanding credit always fit, so a compliant peer can
            // never overflow the pipe.
            read_buffer: SharedBuffer::new(2 * receive_window_max as usize),
            inner: Mutex::new(StreamInner {
                state: StreamState::Idle,
                send_window,
                receive_window,
                receive_window_current_max: receive_window,
                receive_window_max,
                window_update: 0,
                write_buffer: BytesMut::new(),
                headers_to_send: None,
                headers_sent: false,
                received_headers: None,
                local_closed: false,
                eos_sent: false,
                remote_closed: false,
                reset: None,
            }),
            ready,
            headers_tx,
            headers_rx,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    /// Read bytes the peer sent, suspending while none are buffered.
    ///
    /// After [`close`](Self::close) or a peer END_STREAM the buffered data
    /// drains first, then every read returns [`StreamError::EndOfStream`]
    /// (or [`StreamError::Reset`] if the stream was reset).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self.read_buffer.read(buf).await {
            Ok(n) => {
                // Reading frees pipe capacity; release any credit that was
                // held back while the consumer lagged.
                let pending = {
                    let inner = self.inner.lock().unwrap();
                    inner.window_update > 0
                };
                if pending {
                    self.ready.enqueue(self.id);
                }
                Ok(n)
            }
            Err(StreamError::EndOfStream) => {
                let inner = self.inner.lock().unwrap();
                match inner.reset {
                    Some(code) => Err(StreamError::Reset(code)),
                    None => Err(StreamError::EndOfStream),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Queue bytes for the peer. Never blocks: data accumulates until the
    /// write scheduler drains it within the send window.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(code) = inner.reset {
                return Err(StreamError::Reset(code));
            }
            if inner.local_closed {
                return Err(StreamError::EndOfStream);
            }
            inner.write_buffer.extend_from_slice(data);
        }
        self.ready.enqueue(self.id);
        Ok(data.len())
    }

    /// Stage this side's headers. Headers are sent exactly once per
    /// direction; a second call fails.
    pub fn send_headers(&self, headers: Vec<Header>) -> Result<(), StreamError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(code) = inner.reset {
                return Err(StreamError::Reset(code));
            }
            if inner.local_closed || inner.headers_sent || inner.headers_to_send.is_some() {
                return Err(StreamError::EndOfStream);
            }
            inner.headers_to_send = Some(headers);
        }
        self.ready.enqueue(self.id);
        Ok(())
    }

    /// Wait for the peer's headers. One-shot: resolved headers are returned
    /// to every caller; closing the stream first surfaces the terminal error.
    pub async fn recv_headers(&self) -> Result<Vec<Header>, StreamError> {
        let mut rx = self.headers_rx.clone();
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if let Some(headers) = &inner.received_headers {
                    return Ok(headers.clone());
                }
                if let Some(code) = inner.reset {
                    return Err(StreamError::Reset(code));
                }
                if inner.remote_closed || inner.local_closed {
                    return Err(StreamError::EndOfStream);
                }
            }
            if rx.changed().await.is_err() {
                return Err(StreamError::EndOfStream);
            }
        }
    }

    /// Close the stream. Idempotent. Wakes any blocked reader with
    /// end-of-stream once the buffer drains; subsequent writes fail. The
    /// write scheduler still drains queued output and then emits END_STREAM.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.reset.is_some() || inner.local_closed {
                return;
            }
            inner.local_closed = true;
        }
        self.read_buffer.close();
        let _ = self.headers_tx.send(true);
        self.ready.enqueue(self.id);
    }

    // --- muxer-facing internals -------------------------------------------

    /// Account `n` bytes delivered from the peer against the receive window.
    ///
    /// Returns false, with no state change, when the peer overran its
    /// window (`n` exceeds the remaining credit). On success, dropping
    /// under half of the current maximum doubles it (capped at the
    /// absolute ceiling) and stages a credit restoring the peer's view to
    /// the full current maximum.
    pub(crate) fn consume_receive_window(&self, n: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if n > inner.receive_window {
            return false;
        }
        inner.receive_window -= n;
        if inner.receive_window < (inner.receive_window_current_max + 1) / 2 {
            if inner.receive_window_current_max < inner.receive_window_max {
                inner.receive_window_current_max = (inner.receive_window_current_max << 1)
                    .min(inner.receive_window_max);
            }
            inner.window_update = inner.receive_window_current_max - inner.receive_window;
        }
        true
    }

    /// Deliver peer DATA into the read buffer.
    pub(crate) fn deliver_data(&self, payload: &[u8]) -> Result<(), StreamError> {
        if !self.consume_receive_window(payload.len() as u32) {
            return Err(StreamError::BufferOverflow);
        }
        self.read_buffer.write(payload)?;
        Ok(())
    }

    /// Deliver peer HEADERS.
    pub(crate) fn deliver_headers(&self, headers: Vec<Header>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.received_headers.is_some() {
                return;
            }
            inner.received_headers = Some(headers);
            if inner.state == StreamState::Idle {
                inner.state = StreamState::Open;
            }
        }
        let _ = self.headers_tx.send(true);
    }

    /// Record a peer END_STREAM.
    pub(crate) fn recv_end_stream(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remote_closed = true;
            inner.state = match inner.state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                StreamState::Closed => StreamState::Closed,
                _ => StreamState::HalfClosedRemote,
            };
        }
        self.read_buffer.close();
        let _ = self.headers_tx.send(true);
    }

    /// Grow the send window from a peer WINDOW_UPDATE and wake the
    /// scheduler if output was waiting on credit.
    pub(crate) fn grow_send_window(&self, credit: u32) {
        let has_pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.send_window = inner.send_window.saturating_add(credit);
            !inner.write_buffer.is_empty() || inner.local_closed && !inner.eos_sent
        };
        if has_pending {
            self.ready.enqueue(self.id);
        }
    }

    /// Terminate the stream with an error code (RST_STREAM sent or
    /// received).
    pub(crate) fn reset(&self, code: u32) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.reset.is_some() {
                return;
            }
            inner.reset = Some(code);
            inner.state = StreamState::Closed;
        }
        self.read_buffer.close();
        let _ = self.headers_tx.send(true);
    }

    /// Produce the next outbound snapshot for the write scheduler and
    /// atomically settle the staged window credit.
    pub(crate) fn get_chunk(&self, frame_cap: u32) -> StreamChunk {
        let mut inner = self.inner.lock().unwrap();

        let headers = if !inner.headers_sent && inner.headers_to_send.is_some() {
            inner.headers_sent = true;
            if inner.state == StreamState::Idle {
                inner.state = StreamState::Open;
            }
            inner.headers_to_send.take()
        } else {
            None
        };

        let take = (inner.write_buffer.len() as u32)
            .min(inner.send_window)
            .min(frame_cap) as usize;
        let data = inner.write_buffer.split_to(take).freeze();
        inner.send_window -= take as u32;

        // Hold credit back while the consumer lags far enough that granting
        // the full window could overflow the pipe; a consumer read re-arms
        // the scheduler.
        let mut window_update = 0;
        if inner.window_update > 0 {
            let buffered = self.read_buffer.len();
            let granted = inner.receive_window + inner.window_update;
            if buffered + granted as usize <= self.read_buffer.capacity() {
                window_update = inner.window_update;
                inner.receive_window += window_update;
                inner.window_update = 0;
            }
        }

        let drained = inner.write_buffer.is_empty();
        let eos = inner.local_closed && drained && !inner.eos_sent && inner.reset.is_none();
        if eos {
            inner.eos_sent = true;
            inner.state = match inner.state {
                StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
                _ => StreamState::HalfClosedLocal,
            };
        }

        StreamChunk {
            stream_id: self.id,
            headers,
            data,
            window_update,
            eos,
            has_more: !inner.write_buffer.is_empty() && inner.send_window > 0,
        }
    }

    /// True once both halves are closed and the scheduler has drained the
    /// stream; the muxer then drops it from the table.
    pub(crate) fn is_fully_closed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.reset.is_some()
            || (inner.eos_sent && inner.remote_closed && inner.write_buffer.is_empty())
    }

    #[cfg(test)]
    fn window_snapshot(&self) -> (u32, u32, u32, u32, u32) {
        let inner = self.inner.lock().unwrap();
        (
            inner.receive_window,
            inner.receive_window_current_max,
            inner.receive_window_max,
            inner.window_update,
            inner.send_window,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_MAX_WINDOW_SIZE, DEFAULT_WINDOW_SIZE};

    fn test_stream() -> Arc<MuxedStream> {
        let ready = Arc::new(ReadyList::new(16));
        MuxedStream::new(
            1,
            ready,
            DEFAULT_WINDOW_SIZE,
            DEFAULT_MAX_WINDOW_SIZE,
            DEFAULT_WINDOW_SIZE,
        )
    }

    #[test]
    fn test_window_doubles_at_half_consumed() {
        // Seed scenario: 65535 window, 262140 ceiling
        let stream = MuxedStream::new(1, Arc::new(ReadyList::new(16)), 65_535, 262_140, 65_535);

        assert!(stream.consume_receive_window(32_768));
        let (rw, cmax, _, wu, sw) = stream.window_snapshot();
        assert_eq!(rw, 32_767);
        assert_eq!(cmax, 131_070);
        assert_eq!(wu, 98_303);
        assert_eq!(sw, 65_535);

        let chunk = stream.get_chunk(16_384);
        assert_eq!(chunk.window_update, 98_303);
        let (rw, cmax, _, wu, sw) = stream.window_snapshot();
        assert_eq!(rw, 131_070);
        assert_eq!(cmax, 131_070);
        assert_eq!(wu, 0);
        assert_eq!(sw, 65_535);
    }

    #[test]
    fn test_window_no_growth_above_half() {
        let stream = test_stream();

        // Exactly half remaining does not trigger growth
        assert!(stream.consume_receive_window(DEFAULT_WINDOW_SIZE / 2));
        let (rw, cmax, _, wu, _) = stream.window_snapshot();
        assert_eq!(rw, DEFAULT_WINDOW_SIZE - DEFAULT_WINDOW_SIZE / 2);
        assert_eq!(cmax, DEFAULT_WINDOW_SIZE);
        assert_eq!(wu, 0);

        // Two more bytes cross the threshold
        assert!(stream.consume_receive_window(2));
        let (rw, cmax, _, wu, _) = stream.window_snapshot();
        assert_eq!(rw, DEFAULT_WINDOW_SIZE - DEFAULT_WINDOW_SIZE / 2 - 2);
        assert_eq!(cmax, DEFAULT_WINDOW_SIZE << 1);
        assert_eq!(wu, cmax - rw);
    }

    #[test]
    fn test_window_caps_at_absolute_max() {
        let stream = test_stream();

        assert!(stream.consume_receive_window(DEFAULT_WINDOW_SIZE / 2));
        assert!(stream.consume_receive_window(2));
        let _ = stream.get_chunk(16_384);

        assert!(stream.consume_receive_window(DEFAULT_WINDOW_SIZE + 10));
        let (_, cmax, _, _, _) = stream.window_snapshot();
        assert_eq!(cmax, DEFAULT_WINDOW_SIZE << 2);
        let _ = stream.get_chunk(16_384);

        let (rw, cmax, _, _, _) = stream.window_snapshot();
        assert_eq!(rw, DEFAULT_MAX_WINDOW_SIZE);
        assert_eq!(cmax, DEFAULT_MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_consume_beyond_max_rejected_without_side_effects() {
        let stream = test_stream();
        let before = stream.window_snapshot();

        assert!(!stream.consume_receive_window(DEFAULT_MAX_WINDOW_SIZE + 1));
        assert_eq!(stream.window_snapshot(), before);
    }

    #[test]
    fn test_chunk_respects_send_window_and_frame_cap() {
        let stream = MuxedStream::new(1, Arc::new(ReadyList::new(16)), 65_535, 262_140, 10);
        stream.write(&[0xaa; 64]).unwrap();

        let chunk = stream.get_chunk(16_384);
        assert_eq!(chunk.data.len(), 10);
        // Remaining data but no credit: scheduler must wait for the peer
        assert!(!chunk.has_more);

        stream.grow_send_window(1_000);
        let chunk = stream.get_chunk(4);
        assert_eq!(chunk.data.len(), 4);
        assert!(chunk.has_more);
    }

    #[tokio::test]
    async fn test_eof_race() {
        // Close and read race freely; read must observe end-of-stream and a
        // following write must fail the same way.
        for _ in 0..4096 {
            let stream = test_stream();
            let closer = {
                let stream = stream.clone();
                tokio::spawn(async move { stream.close() })
            };

            let mut buf = [0u8; 1];
            let err = stream.read(&mut buf).await.unwrap_err();
            assert_eq!(err, StreamError::EndOfStream);

            let err = stream.write(&[1]).unwrap_err();
            assert_eq!(err, StreamError::EndOfStream);

            closer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_drains_before_eof() {
        let stream = test_stream();
        stream.deliver_data(b"leftover").unwrap();
        stream.recv_end_stream();

        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"leftover");
        assert_eq!(stream.read(&mut buf).await, Err(StreamError::EndOfStream));
    }

    #[tokio::test]
    async fn test_reset_surfaces_code() {
        let stream = test_stream();
        stream.reset(5);

        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await, Err(StreamError::Reset(5)));
        assert_eq!(stream.write(&[1]), Err(StreamError::Reset(5)));
    }

    #[tokio::test]
    async fn test_headers_one_shot() {
        let stream = test_stream();
        stream.send_headers(vec![Header::new("a", "1")]).unwrap();
        assert!(stream.send_headers(vec![Header::new("b", "2")]).is_err());

        stream.deliver_headers(vec![Header::new("x", "y")]);
        let headers = stream.recv_headers().await.unwrap();
        assert_eq!(headers, vec![Header::new("x", "y")]);
    }

    #[test]
    fn test_state_machine_send_then_recv_close() {
        let stream = test_stream();
        stream.send_headers(vec![]).unwrap();
        let _ = stream.get_chunk(16_384);
        assert_eq!(stream.state(), StreamState::Open);

        stream.close();
        let chunk = stream.get_chunk(16_384);
        assert!(chunk.eos);
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);

        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_fully_closed());
    }

    #[test]
    fn test_state_machine_recv_then_send_close() {
        let stream = test_stream();
        stream.deliver_headers(vec![]);
        assert_eq!(stream.state(), StreamState::Open);

        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        stream.close();
        let chunk = stream.get_chunk(16_384);
        assert!(chunk.eos);
        assert_eq!(stream.state(), StreamState::Closed);
    }
}
