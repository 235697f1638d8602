//! Mux session: the read/write loops driving one transport connection.

use bytes::Bytes;
use passage_proto::{Frame, FrameDecoder, FrameFlags, FrameType, StreamId, CONTROL_STREAM_ID};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::stream::SendWindow;
use crate::{MuxConfig, MuxError, MuxStream, INITIAL_WINDOW};

/// Unanswered keepalive pings tolerated before the transport is
/// declared dead.
const KEEPALIVE_MISS_LIMIT: u32 = 3;

/// Grace window for draining streams after a local go-away.
const GOAWAY_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct StreamEntry {
    /// Delivery channel into the stream's reader; `None` once the peer
    /// sent `Fin`.
    pub inbound_tx: Option<mpsc::UnboundedSender<Bytes>>,
    pub send_window: Arc<SendWindow>,
    /// Bytes delivered to the stream but not yet re-credited to the
    /// peer. Exceeding the receive window is a protocol violation.
    pub recv_outstanding: u64,
    pub local_fin: bool,
    pub remote_fin: bool,
    pub local_origin: bool,
}

#[derive(Default)]
pub(crate) struct StreamMap {
    pub entries: HashMap<StreamId, StreamEntry>,
    pub local_open: u32,
    pub remote_open: u32,
}

impl StreamMap {
    fn remove(&mut self, id: StreamId) -> Option<StreamEntry> {
        let entry = self.entries.remove(&id)?;
        if entry.local_origin {
            self.local_open = self.local_open.saturating_sub(1);
        } else {
            self.remote_open = self.remote_open.saturating_sub(1);
        }
        Some(entry)
    }
}

/// State shared between the session handle, its streams, and the I/O
/// loops.
pub(crate) struct Shared {
    pub config: MuxConfig,
    pub data_tx: mpsc::Sender<Frame>,
    pub ctrl_tx: mpsc::UnboundedSender<Frame>,
    pub streams: Mutex<StreamMap>,
    next_stream_id: AtomicU32,
    pub local_goaway: AtomicBool,
    pub remote_goaway: AtomicBool,
    pub closed: AtomicBool,
    /// Keepalive pings sent without a reply.
    missed_pings: AtomicU32,
    ping_seq: AtomicU64,
    server: bool,
}

impl Shared {
    /// Re-credit the peer for consumed stream bytes.
    pub(crate) fn replenish(&self, id: StreamId, delta: u32) {
        {
            let mut map = self.streams.lock().unwrap();
            if let Some(entry) = map.entries.get_mut(&id) {
                entry.recv_outstanding = entry.recv_outstanding.saturating_sub(u64::from(delta));
            }
        }
        let _ = self.ctrl_tx.send(Frame::window_update(id, delta));
    }

    pub(crate) fn note_local_fin(&self, id: StreamId) {
        let mut map = self.streams.lock().unwrap();
        let fully_closed = match map.entries.get_mut(&id) {
            Some(entry) => {
                entry.local_fin = true;
                entry.remote_fin
            }
            None => return,
        };
        if fully_closed {
            map.remove(id);
        }
    }

    /// Called when a stream object is dropped; the entry has no reader
    /// anymore and can go away entirely.
    pub(crate) fn note_stream_gone(&self, id: StreamId) {
        let mut map = self.streams.lock().unwrap();
        map.remove(id);
    }

    fn abort_stream(&self, id: StreamId) {
        let mut map = self.streams.lock().unwrap();
        if let Some(entry) = map.remove(id) {
            entry.send_window.close();
        }
    }

    /// Fail every stream and mark the session dead.
    fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut map = self.streams.lock().unwrap();
        for entry in map.entries.values_mut() {
            entry.send_window.close();
            entry.inbound_tx = None;
        }
        map.entries.clear();
        map.local_open = 0;
        map.remote_open = 0;
    }
}

/// A multiplexing session over one byte duplex.
///
/// The server half accepts peer-opened streams; the client half opens
/// them. Both operations are available on both halves (stream IDs are
/// split odd/even so they never collide), matching how the engine uses
/// one session per accepted transport connection.
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    shutdown: CancellationToken,
}

impl MuxSession {
    /// Server end: accepts streams, allocates even IDs for its own opens.
    pub fn server<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config, true)
    }

    /// Client end: opens streams with odd IDs.
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config, false)
    }

    fn new<T>(io: T, config: MuxConfig, server: bool) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (data_tx, data_rx) = mpsc::channel::<Frame>(64);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Frame>();
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(64);

        let shared = Arc::new(Shared {
            config,
            data_tx,
            ctrl_tx,
            streams: Mutex::new(StreamMap::default()),
            next_stream_id: AtomicU32::new(if server { 2 } else { 1 }),
            local_goaway: AtomicBool::new(false),
            remote_goaway: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            missed_pings: AtomicU32::new(0),
            ping_seq: AtomicU64::new(0),
            server,
        });

        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            accept_tx,
            shutdown.clone(),
        ));
        tokio::spawn(write_loop(
            write_half,
            data_rx,
            ctrl_rx,
            shared.clone(),
            shutdown.clone(),
        ));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown,
        }
    }

    /// Open a new outbound stream.
    ///
    /// Fails with [`MuxError::StreamLimit`] when the configured number
    /// of concurrent locally-opened streams is reached (transient) and
    /// [`MuxError::Closed`] after go-away or transport loss.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let sh = &self.shared;
        if sh.closed.load(Ordering::SeqCst)
            || sh.local_goaway.load(Ordering::SeqCst)
            || sh.remote_goaway.load(Ordering::SeqCst)
        {
            return Err(MuxError::Closed);
        }

        let (id, in_rx, window) = {
            let mut map = sh.streams.lock().unwrap();
            if map.local_open >= sh.config.max_streams {
                return Err(MuxError::StreamLimit(sh.config.max_streams));
            }
            let id = sh.next_stream_id.fetch_add(2, Ordering::SeqCst);
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let window = Arc::new(SendWindow::new(u64::from(INITIAL_WINDOW)));
            map.entries.insert(
                id,
                StreamEntry {
                    inbound_tx: Some(in_tx),
                    send_window: window.clone(),
                    recv_outstanding: 0,
                    local_fin: false,
                    remote_fin: false,
                    local_origin: true,
                },
            );
            map.local_open += 1;
            (id, in_rx, window)
        };

        let extra = sh.config.receive_window.saturating_sub(INITIAL_WINDOW);
        let syn = Frame::window_update(id, extra).with_flags(FrameFlags::new().with_syn());
        if sh.ctrl_tx.send(syn).is_err() {
            sh.note_stream_gone(id);
            return Err(MuxError::Closed);
        }

        trace!(stream_id = id, "opened mux stream");
        Ok(MuxStream::new(id, in_rx, window, sh.clone()))
    }

    /// Accept the next peer-opened stream.
    ///
    /// Returns `None` once the session is draining (go-away) or the
    /// transport is gone.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Announce shutdown to the peer, wait for streams to drain (up to
    /// a 5-second grace window), then close the transport.
    pub async fn go_away(&self) {
        self.shared.local_goaway.store(true, Ordering::SeqCst);
        let _ = self.shared.ctrl_tx.send(Frame::go_away());

        let deadline = tokio::time::Instant::now() + GOAWAY_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.active_streams() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.close();
    }

    /// Hard-close the session: cancels both I/O loops and fails every
    /// stream.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn active_streams(&self) -> usize {
        self.shared.streams.lock().unwrap().entries.len()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("server", &self.shared.server)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<T>(
    mut read_half: ReadHalf<T>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut accept_tx = Some(accept_tx);

    'outer: loop {
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => {
                    if let Err(e) = handle_frame(&shared, &mut accept_tx, frame) {
                        warn!("mux protocol error: {e}");
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("mux frame decode error: {e}");
                    break 'outer;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = read_half.read_buf(decoder.buffer()) => match res {
                Ok(0) => {
                    debug!("mux transport EOF");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("mux transport read error: {e}");
                    break;
                }
            },
        }
    }

    shared.close_all();
    shutdown.cancel();
}

fn handle_frame(
    shared: &Arc<Shared>,
    accept_tx: &mut Option<mpsc::Sender<MuxStream>>,
    frame: Frame,
) -> Result<(), MuxError> {
    match frame.frame_type {
        FrameType::Data => {
            if frame.flags.has_rst() {
                shared.abort_stream(frame.stream_id);
                return Ok(());
            }
            let mut map = shared.streams.lock().unwrap();
            let Some(entry) = map.entries.get_mut(&frame.stream_id) else {
                // In-flight data for a stream we already dropped.
                trace!(stream_id = frame.stream_id, "data for unknown stream");
                return Ok(());
            };
            entry.recv_outstanding += frame.payload.len() as u64;
            if entry.recv_outstanding > u64::from(shared.config.receive_window) {
                drop(map);
                shared.abort_stream(frame.stream_id);
                let reset =
                    Frame::fin(frame.stream_id).with_flags(FrameFlags::new().with_rst());
                let _ = shared.ctrl_tx.send(reset);
                return Err(MuxError::Protocol(format!(
                    "stream {} overran its receive window",
                    frame.stream_id
                )));
            }
            if let Some(tx) = &entry.inbound_tx {
                if tx.send(frame.payload).is_err() {
                    entry.inbound_tx = None;
                }
            }
        }

        FrameType::WindowUpdate => {
            if frame.flags.has_rst() {
                shared.abort_stream(frame.stream_id);
                return Ok(());
            }
            let delta = frame.window_delta().map_err(|e| MuxError::Protocol(e.to_string()))?;
            if frame.flags.has_syn() {
                handle_open(shared, accept_tx, frame.stream_id, delta)?;
            } else {
                let map = shared.streams.lock().unwrap();
                if let Some(entry) = map.entries.get(&frame.stream_id) {
                    entry.send_window.credit(delta);
                }
            }
        }

        FrameType::Ping => {
            if frame.flags.has_ack() {
                shared.missed_pings.store(0, Ordering::SeqCst);
            } else {
                let reply = Frame::new(CONTROL_STREAM_ID, FrameType::Ping, frame.payload)
                    .with_flags(FrameFlags::new().with_ack());
                let _ = shared.ctrl_tx.send(reply);
            }
        }

        FrameType::GoAway => {
            debug!("peer sent go-away, draining");
            shared.remote_goaway.store(true, Ordering::SeqCst);
            // Dropping the accept sender makes accept_stream() return
            // the fail-closed sentinel once queued streams drain.
            *accept_tx = None;
        }

        FrameType::Fin => {
            if frame.flags.has_rst() {
                shared.abort_stream(frame.stream_id);
                return Ok(());
            }
            let mut map = shared.streams.lock().unwrap();
            let fully_closed = match map.entries.get_mut(&frame.stream_id) {
                Some(entry) => {
                    entry.remote_fin = true;
                    entry.inbound_tx = None;
                    entry.local_fin
                }
                None => return Ok(()),
            };
            if fully_closed {
                map.remove(frame.stream_id);
            }
        }
    }
    Ok(())
}

fn handle_open(
    shared: &Arc<Shared>,
    accept_tx: &mut Option<mpsc::Sender<MuxStream>>,
    id: StreamId,
    extra_window: u32,
) -> Result<(), MuxError> {
    let expected_parity = if shared.server { 1 } else { 0 };
    if id % 2 != expected_parity || id == CONTROL_STREAM_ID {
        return Err(MuxError::Protocol(format!(
            "peer opened stream {id} with wrong parity"
        )));
    }

    let reject = |reason: &str| {
        debug!(stream_id = id, "rejecting stream: {reason}");
        let reset = Frame::fin(id).with_flags(FrameFlags::new().with_rst());
        let _ = shared.ctrl_tx.send(reset);
    };

    if shared.local_goaway.load(Ordering::SeqCst) {
        reject("draining after go-away");
        return Ok(());
    }

    let stream = {
        let mut map = shared.streams.lock().unwrap();
        if map.entries.contains_key(&id) {
            return Err(MuxError::Protocol(format!("stream {id} opened twice")));
        }
        if map.remote_open >= shared.config.max_streams {
            drop(map);
            reject("stream limit");
            return Ok(());
        }
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let window = Arc::new(SendWindow::new(
            u64::from(INITIAL_WINDOW) + u64::from(extra_window),
        ));
        map.entries.insert(
            id,
            StreamEntry {
                inbound_tx: Some(in_tx),
                send_window: window.clone(),
                recv_outstanding: 0,
                local_fin: false,
                remote_fin: false,
                local_origin: false,
            },
        );
        map.remote_open += 1;
        MuxStream::new(id, in_rx, window, shared.clone())
    };

    // Advertise our receive window beyond the implicit initial credit.
    let extra = shared.config.receive_window.saturating_sub(INITIAL_WINDOW);
    if extra > 0 {
        let _ = shared.ctrl_tx.send(Frame::window_update(id, extra));
    }

    match accept_tx {
        Some(tx) => {
            if let Err(e) = tx.try_send(stream) {
                // Stream drop sends the reset for us.
                debug!(stream_id = id, "accept queue unavailable: {e}");
            }
        }
        None => {
            // Stream drop sends the reset and removes the entry.
            drop(stream);
        }
    }
    Ok(())
}

async fn write_loop<T>(
    mut write_half: WriteHalf<T>,
    mut data_rx: mpsc::Receiver<Frame>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut keepalive = tokio::time::interval(shared.config.keepalive);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately; skip it so an idle
    // period is a full keepalive period.
    keepalive.tick().await;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(frame) = ctrl_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            _ = keepalive.tick() => {
                if shared.missed_pings.load(Ordering::SeqCst) >= KEEPALIVE_MISS_LIMIT {
                    warn!("keepalive: {KEEPALIVE_MISS_LIMIT} pings unanswered, closing transport");
                    break;
                }
                shared.missed_pings.fetch_add(1, Ordering::SeqCst);
                let seq = shared.ping_seq.fetch_add(1, Ordering::SeqCst);
                Frame::ping(seq)
            }
        };

        let encoded = match frame.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!("mux frame encode error: {e}");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&encoded).await {
            debug!("mux transport write error: {e}");
            break;
        }
        if let Err(e) = write_half.flush().await {
            debug!("mux transport flush error: {e}");
            break;
        }
    }

    shared.close_all();
    shutdown.cancel();
    let _ = write_half.shutdown().await;
}
