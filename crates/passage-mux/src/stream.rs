//! A logical stream over a mux session.

use bytes::Bytes;
use passage_proto::{Frame, FrameFlags, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::session::Shared;

/// Per-stream send budget. The writer may not have more bytes in flight
/// than the peer's advertised receive window; `WindowUpdate` frames
/// replenish it.
pub(crate) struct SendWindow {
    inner: Mutex<WindowInner>,
}

struct WindowInner {
    available: u64,
    closed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    pub(crate) fn new(initial: u64) -> Self {
        Self {
            inner: Mutex::new(WindowInner {
                available: initial,
                closed: false,
                waker: None,
            }),
        }
    }

    pub(crate) fn credit(&self, delta: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.available += u64::from(delta);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Take up to `want` bytes of budget, or park the task until credit
    /// arrives.
    fn poll_acquire(&self, cx: &mut Context<'_>, want: usize) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if inner.available == 0 {
            inner.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let granted = (want as u64).min(inner.available) as usize;
        inner.available -= granted as u64;
        Poll::Ready(Ok(granted))
    }
}

/// One logical stream of a [`crate::MuxSession`].
///
/// Reads deliver the peer's bytes in order; EOF is the peer's `Fin`.
/// Writes are chunked into `Data` frames, bounded by the peer's receive
/// window and by the session's outbound queue. `shutdown()` sends `Fin`
/// after all written data; dropping the stream without a shutdown sends
/// an abortive reset instead.
pub struct MuxStream {
    id: StreamId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    read_eof: bool,
    consumed: u32,
    data_tx: PollSender<Frame>,
    send_window: Arc<SendWindow>,
    max_frame: usize,
    fin_sent: bool,
    shared: Arc<Shared>,
}

impl MuxStream {
    pub(crate) fn new(
        id: StreamId,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        send_window: Arc<SendWindow>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            inbound,
            pending: Bytes::new(),
            read_eof: false,
            consumed: 0,
            data_tx: PollSender::new(shared.data_tx.clone()),
            send_window,
            max_frame: shared.config.frame_size as usize,
            fin_sent: false,
            shared,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Record consumed bytes and replenish the peer once half the
    /// receive window has been drained.
    fn note_consumed(&mut self, n: u32) {
        self.consumed += n;
        if self.consumed >= self.shared.config.receive_window / 2 {
            self.shared.replenish(self.id, self.consumed);
            self.consumed = 0;
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                this.note_consumed(n as u32);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => {
                    this.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        // Reserve an outbound queue slot first; the reservation sticks
        // across polls, so a window stall cannot lose it.
        match this.data_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => return Poll::Pending,
        }
        let want = buf.len().min(this.max_frame);
        let granted = match this.send_window.poll_acquire(cx, want) {
            Poll::Ready(Ok(n)) => n,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..granted]));
        if this.data_tx.send_item(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(granted))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        // Fin travels through the data queue so it cannot overtake
        // buffered data frames of this stream.
        match this.data_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this.data_tx.send_item(Frame::fin(this.id));
                this.fin_sent = true;
                this.shared.note_local_fin(this.id);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let reset = Frame::fin(self.id).with_flags(FrameFlags::new().with_rst());
            let _ = self.shared.ctrl_tx.send(reset);
        }
        self.shared.note_stream_gone(self.id);
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("fin_sent", &self.fin_sent)
            .finish()
    }
}
