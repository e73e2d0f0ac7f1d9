//! Frame multiplexer over a single byte transport
//!
//! Owns the transport exclusively: the read loop holds the read half and
//! dispatches frames into per-stream buffers; the write loop holds the
//! write half and emits frames for streams woken through the ready list.
//! Connection-level frames (PING, GOAWAY, SETTINGS) ride stream ID 0 via a
//! control channel checked ahead of stream output. The muxer never retries
//! transport failures; reconnecting is the supervisor's job.

use crate::stream::MuxedStream;
use crate::{error_codes, MuxError, ReadyList};
use crate::{DEFAULT_MAX_STREAMS, DEFAULT_MAX_WINDOW_SIZE, DEFAULT_WINDOW_SIZE};
use bytes::BytesMut;
use edgelink_proto::{
    decode_headers, encode_headers, Frame, FrameFlags, FrameType, Header, StreamId,
    CONNECTION_STREAM_ID, FRAME_DATA_CAP,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Muxer configuration
#[derive(Debug, Clone)]
pub struct MuxerConfig {
    /// Name used in log fields
    pub name: String,
    /// Clients originate odd stream IDs, servers even
    pub is_client: bool,
    /// Initial per-stream receive window
    pub receive_window: u32,
    /// Ceiling for the adaptive receive window
    pub receive_window_max: u32,
    /// Initial per-stream send window (the peer's advertised receive window)
    pub send_window: u32,
    /// Maximum concurrently open streams
    pub max_streams: usize,
    /// Backlog of remotely-opened streams awaiting `accept_stream`
    pub accept_backlog: usize,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            name: "muxer".to_string(),
            is_client: true,
            receive_window: DEFAULT_WINDOW_SIZE,
            receive_window_max: DEFAULT_MAX_WINDOW_SIZE,
            send_window: DEFAULT_WINDOW_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            accept_backlog: 64,
        }
    }
}

struct StreamTable {
    map: HashMap<StreamId, Arc<MuxedStream>>,
    next_local: StreamId,
    highest_remote: StreamId,
    goaway_received: bool,
    closed: bool,
}

struct MuxShared {
    config: MuxerConfig,
    streams: Mutex<StreamTable>,
    ready: Arc<ReadyList>,
    control_tx: mpsc::UnboundedSender<Frame>,
    incoming_tx: mpsc::Sender<Arc<MuxedStream>>,
}

/// A running multiplexer. The loops run until the transport closes or
/// [`shutdown`](Muxer::shutdown) emits a graceful GOAWAY; dropping the
/// handle detaches them.
pub struct Muxer {
    shared: Arc<MuxShared>,
    read_handle: JoinHandle<Result<(), MuxError>>,
    write_handle: JoinHandle<Result<(), MuxError>>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<MuxedStream>>>,
}

impl Muxer {
    /// Wrap a connected transport and spawn the read and write loops.
    pub fn start<T>(transport: T, config: MuxerConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog);
        let ready = Arc::new(ReadyList::new(config.max_streams));

        let next_local = if config.is_client { 1 } else { 2 };
        let shared = Arc::new(MuxShared {
            streams: Mutex::new(StreamTable {
                map: HashMap::new(),
                next_local,
                highest_remote: 0,
                goaway_received: false,
                closed: false,
            }),
            ready,
            control_tx,
            incoming_tx,
            config,
        });

        // Fixed settings: announce once, peer acknowledges.
        let _ = shared
            .control_tx
            .send(Frame::new(CONNECTION_STREAM_ID, FrameType::Settings, bytes::Bytes::new()));

        let read_handle = tokio::spawn(read_loop(shared.clone(), read_half));
        let write_handle = tokio::spawn(write_loop(shared.clone(), write_half, control_rx));

        Self {
            shared,
            read_handle,
            write_handle,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        }
    }

    /// Open a locally-originated stream with this side's headers staged.
    pub fn open_stream(&self, headers: Vec<Header>) -> Result<Arc<MuxedStream>, MuxError> {
        // Reject oversized headers here rather than in the write loop.
        encode_headers(&headers)?;
        let stream = {
            let mut table = self.shared.streams.lock().unwrap();
            if table.closed {
                return Err(MuxError::Closed);
            }
            if table.goaway_received {
                return Err(MuxError::GoAwayReceived);
            }
            if table.map.len() >= self.shared.config.max_streams {
                return Err(MuxError::TooManyStreams(table.map.len()));
            }
            let id = table.next_local;
            table.next_local += 2;
            let stream = self.shared.new_stream(id);
            table.map.insert(id, stream.clone());
            stream
        };
        stream
            .send_headers(headers)
            .map_err(|_| MuxError::Closed)?;
        Ok(stream)
    }

    /// Accept the next remotely-opened stream. Returns `None` once the
    /// muxer has terminated.
    pub async fn accept_stream(&self) -> Option<Arc<MuxedStream>> {
        self.incoming_rx.lock().await.recv().await
    }

    /// Look up a live stream by ID. Handles are weak in effect: an evicted
    /// stream simply no longer resolves.
    pub fn stream(&self, id: StreamId) -> Option<Arc<MuxedStream>> {
        self.shared.streams.lock().unwrap().map.get(&id).cloned()
    }

    pub fn active_streams(&self) -> usize {
        self.shared.streams.lock().unwrap().map.len()
    }

    /// Send a connection-level PING.
    pub fn ping(&self) {
        let _ = self.shared.control_tx.send(Frame::ping(rand_opaque()));
    }

    /// Graceful shutdown: emit GOAWAY, close every stream, stop both loops.
    pub fn shutdown(&self) {
        let last = {
            let table = self.shared.streams.lock().unwrap();
            table.highest_remote
        };
        let _ = self
            .shared
            .control_tx
            .send(Frame::go_away(last, error_codes::NO_ERROR));
        self.shared.terminate();
    }

    /// Wait for the muxer to finish, surfacing the first loop error.
    pub async fn join(self) -> Result<(), MuxError> {
        let write_result = match self.write_handle.await {
            Ok(result) => result,
            Err(_) => Err(MuxError::Closed),
        };
        self.read_handle.abort();
        let _ = self.read_handle.await;
        write_result
    }
}

impl MuxShared {
    fn new_stream(&self, id: StreamId) -> Arc<MuxedStream> {
        MuxedStream::new(
            id,
            self.ready.clone(),
            self.config.receive_window,
            self.config.receive_window_max,
            self.config.send_window,
        )
    }

    /// Close every stream and both loops. Readers observe end-of-stream
    /// once their buffers drain.
    fn terminate(&self) {
        let streams: Vec<Arc<MuxedStream>> = {
            let mut table = self.streams.lock().unwrap();
            table.closed = true;
            table.map.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            stream.close();
        }
        self.ready.close();
    }

    fn send_control(&self, frame: Frame) {
        let _ = self.control_tx.send(frame);
    }

    fn handle_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if frame.stream_id == CONNECTION_STREAM_ID {
            return self.handle_connection_frame(frame);
        }
        match frame.frame_type {
            FrameType::Headers => self.handle_headers(frame),
            FrameType::Data => {
                self.handle_data(frame);
                Ok(())
            }
            FrameType::WindowUpdate => {
                let credit = frame.window_credit()?;
                if let Some(stream) = self.lookup(frame.stream_id) {
                    stream.grow_send_window(credit);
                }
                Ok(())
            }
            FrameType::RstStream => {
                let code = frame.rst_error_code()?;
                if let Some(stream) = self.remove(frame.stream_id) {
                    debug!(stream_id = frame.stream_id, code, "stream reset by peer");
                    stream.reset(code);
                }
                Ok(())
            }
            FrameType::Ping | FrameType::GoAway | FrameType::Settings => Err(MuxError::Protocol(
                format!("{:?} frame on stream {}", frame.frame_type, frame.stream_id),
            )),
        }
    }

    fn handle_connection_frame(&self, frame: Frame) -> Result<(), MuxError> {
        match frame.frame_type {
            FrameType::Ping => {
                if frame.flags.has_ack() {
                    trace!("pong received");
                } else {
                    self.send_control(Frame::ping_ack(frame.payload));
                }
                Ok(())
            }
            FrameType::Settings => {
                if !frame.flags.has_ack() {
                    self.send_control(Frame::settings_ack());
                }
                Ok(())
            }
            FrameType::GoAway => {
                debug!("peer sent GOAWAY; refusing new streams");
                self.streams.lock().unwrap().goaway_received = true;
                Ok(())
            }
            FrameType::WindowUpdate => {
                // The connection-level window is fixed at startup.
                trace!("ignoring connection-level window update");
                Ok(())
            }
            FrameType::Data | FrameType::Headers | FrameType::RstStream => Err(MuxError::Protocol(
                format!("{:?} frame on stream 0", frame.frame_type),
            )),
        }
    }

    fn handle_headers(&self, frame: Frame) -> Result<(), MuxError> {
        let end_stream = frame.flags.has_end_stream();
        let headers = decode_headers(frame.payload)?;

        if let Some(stream) = self.lookup(frame.stream_id) {
            stream.deliver_headers(headers);
            if end_stream {
                stream.recv_end_stream();
            }
            return Ok(());
        }

        // Unknown stream: only a fresh remote-originated ID opens one.
        let remote_originated = (frame.stream_id % 2 == 1) != self.config.is_client;
        if !remote_originated {
            trace!(stream_id = frame.stream_id, "headers for stale local stream");
            return Ok(());
        }

        let stream = {
            let mut table = self.streams.lock().unwrap();
            if table.closed {
                return Ok(());
            }
            if frame.stream_id <= table.highest_remote {
                trace!(stream_id = frame.stream_id, "stale remote stream, ignoring");
                return Ok(());
            }
            if table.map.len() >= self.config.max_streams {
                self.send_control(Frame::rst_stream(
                    frame.stream_id,
                    error_codes::REFUSED_STREAM,
                ));
                return Ok(());
            }
            table.highest_remote = frame.stream_id;
            let stream = self.new_stream(frame.stream_id);
            table.map.insert(frame.stream_id, stream.clone());
            stream
        };

        stream.deliver_headers(headers);
        if end_stream {
            stream.recv_end_stream();
        }
        if self.incoming_tx.try_send(stream.clone()).is_err() {
            warn!(stream_id = frame.stream_id, "accept backlog full, refusing stream");
            self.send_control(Frame::rst_stream(
                frame.stream_id,
                error_codes::REFUSED_STREAM,
            ));
            self.remove(frame.stream_id);
            stream.reset(error_codes::REFUSED_STREAM);
        }
        Ok(())
    }

    fn handle_data(&self, frame: Frame) {
        let Some(stream) = self.lookup(frame.stream_id) else {
            // Data on a closed or never-opened stream
            self.send_control(Frame::rst_stream(
                frame.stream_id,
                error_codes::STREAM_CLOSED,
            ));
            return;
        };
        match stream.deliver_data(&frame.payload) {
            Ok(()) => {
                if frame.flags.has_end_stream() {
                    stream.recv_end_stream();
                }
            }
            Err(crate::StreamError::BufferOverflow) => {
                warn!(stream_id = frame.stream_id, "peer overran flow-control window");
                self.send_control(Frame::rst_stream(
                    frame.stream_id,
                    error_codes::FLOW_CONTROL_ERROR,
                ));
                self.remove(frame.stream_id);
                stream.reset(error_codes::FLOW_CONTROL_ERROR);
            }
            Err(_) => {
                self.send_control(Frame::rst_stream(
                    frame.stream_id,
                    error_codes::STREAM_CLOSED,
                ));
                self.remove(frame.stream_id);
            }
        }
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<MuxedStream>> {
        self.streams.lock().unwrap().map.get(&id).cloned()
    }

    fn remove(&self, id: StreamId) -> Option<Arc<MuxedStream>> {
        self.streams.lock().unwrap().map.remove(&id)
    }
}

async fn read_loop<R>(shared: Arc<MuxShared>, mut read_half: R) -> Result<(), MuxError>
where
    R: AsyncRead + Send + Unpin,
{
    let result = read_frames(&shared, &mut read_half).await;
    if let Err(err) = &result {
        if matches!(err, MuxError::Protocol(_) | MuxError::Frame(_) | MuxError::Header(_)) {
            shared.send_control(Frame::go_away(
                shared.streams.lock().unwrap().highest_remote,
                error_codes::PROTOCOL_ERROR,
            ));
        }
        debug!(name = %shared.config.name, error = %err, "read loop terminating");
    }
    shared.terminate();
    result
}

async fn read_frames<R>(shared: &Arc<MuxShared>, read_half: &mut R) -> Result<(), MuxError>
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(2 * FRAME_DATA_CAP as usize);
    loop {
        while let Some(frame) = Frame::decode(&mut buf)? {
            trace!(
                name = %shared.config.name,
                stream_id = frame.stream_id,
                frame_type = ?frame.frame_type,
                len = frame.payload.len(),
                "frame received"
            );
            shared.handle_frame(frame)?;
        }
        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            debug!(name = %shared.config.name, "transport closed by peer");
            return Ok(());
        }
    }
}

async fn write_loop<W>(
    shared: Arc<MuxShared>,
    mut write_half: W,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Send + Unpin,
{
    let result = write_frames(&shared, &mut write_half, &mut control_rx).await;
    if result.is_err() {
        shared.terminate();
    }
    let _ = write_half.shutdown().await;
    result
}

async fn write_frames<W>(
    shared: &Arc<MuxShared>,
    write_half: &mut W,
    control_rx: &mut mpsc::UnboundedReceiver<Frame>,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            biased;
            maybe_frame = control_rx.recv() => {
                match maybe_frame {
                    Some(frame) => write_frame(write_half, frame).await?,
                    None => return Ok(()),
                }
            }
            maybe_id = shared.ready.dequeue() => {
                match maybe_id {
                    Some(id) => emit_stream_frames(shared, write_half, id).await?,
                    None => {
                        // Drain pending control frames (GOAWAY) before exiting.
                        while let Ok(frame) = control_rx.try_recv() {
                            write_frame(write_half, frame).await?;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Emit this turn's output for one woken stream: headers if staged, a
/// window-update credit, and at most one DATA frame. A stream with more
/// queued data goes back onto the ready list, giving round-robin fairness.
async fn emit_stream_frames<W>(
    shared: &Arc<MuxShared>,
    write_half: &mut W,
    id: StreamId,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Send + Unpin,
{
    let Some(stream) = shared.lookup(id) else {
        // Evicted while queued; output for a closed stream is dropped.
        return Ok(());
    };

    let chunk = stream.get_chunk(FRAME_DATA_CAP);
    let id = chunk.stream_id;
    let mut eos_pending = chunk.eos;

    if let Some(headers) = chunk.headers {
        match encode_headers(&headers) {
            Ok(payload) => {
                let mut flags = FrameFlags::new().with_end_headers();
                if eos_pending && chunk.data.is_empty() {
                    flags = flags.with_end_stream();
                    eos_pending = false;
                }
                write_frame(write_half, Frame::headers(id, payload).with_flags(flags)).await?;
            }
            Err(err) => {
                // The stream's headers are unsendable; reset it rather than
                // tearing down the whole muxer.
                warn!(stream_id = id, error = %err, "dropping stream with unencodable headers");
                write_frame(write_half, Frame::rst_stream(id, error_codes::INTERNAL_ERROR)).await?;
                shared.remove(id);
                stream.reset(error_codes::INTERNAL_ERROR);
                return Ok(());
            }
        }
    }

    if chunk.window_update > 0 {
        write_frame(write_half, Frame::window_update(id, chunk.window_update)).await?;
    }

    if !chunk.data.is_empty() {
        let mut frame = Frame::data(id, chunk.data);
        if eos_pending {
            frame = frame.with_flags(FrameFlags::new().with_end_stream());
            eos_pending = false;
        }
        write_frame(write_half, frame).await?;
    } else if eos_pending {
        write_frame(
            write_half,
            Frame::data(id, bytes::Bytes::new())
                .with_flags(FrameFlags::new().with_end_stream()),
        )
        .await?;
    }

    if chunk.has_more {
        shared.ready.enqueue(id);
    }
    if stream.is_fully_closed() {
        shared.remove(id);
    }
    Ok(())
}

async fn write_frame<W>(write_half: &mut W, frame: Frame) -> Result<(), MuxError>
where
    W: AsyncWrite + Send + Unpin,
{
    let encoded = frame.encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}

/// Opaque PING payload; sub-millisecond uniqueness is not required.
fn rand_opaque() -> [u8; 8] {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
        .to_be_bytes()
}
