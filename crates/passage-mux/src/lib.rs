//! Stream multiplexing over a single byte duplex.
//!
//! A [`MuxSession`] layers many logical streams over one reliable,
//! ordered transport connection. The server half accepts streams the
//! peer opens; the client half opens streams. Both halves exchange the
//! frames defined in `passage_proto::frame`:
//!
//! - `Data` carries stream bytes, chunked to the configured frame size.
//! - `WindowUpdate` credits the sender; a `SYN`-flagged update opens a
//!   stream and advertises the opener's receive window beyond the
//!   implicit [`INITIAL_WINDOW`].
//! - `Ping` keeps the transport alive; a reply carries the `ACK` flag.
//! - `GoAway` stops new streams and lets existing ones drain.
//! - `Fin` half-closes a stream; with the `RST` flag it aborts it.
//!
//! Within a stream bytes are delivered in order. Across streams there is
//! no ordering guarantee.

mod session;
mod stream;

pub use session::MuxSession;
pub use stream::MuxStream;

use std::time::Duration;
use thiserror::Error;

/// Window credit both sides assume for a freshly opened stream. The
/// `SYN` frame advertises anything beyond this.
pub const INITIAL_WINDOW: u32 = 64 * 1024;

/// Multiplexer tuning parameters.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum concurrent locally-opened streams. Further opens fail
    /// with [`MuxError::StreamLimit`].
    pub max_streams: u32,
    /// Largest `Data` frame payload.
    pub frame_size: u32,
    /// Per-stream receive window advertised to the peer.
    pub receive_window: u32,
    /// Keepalive ping period. Three unanswered pings close the
    /// transport.
    pub keepalive: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 8,
            frame_size: 32 * 1024,
            receive_window: 4 * 1024 * 1024,
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Too many concurrent streams; retry after one closes.
    #[error("stream limit reached ({0} concurrent streams)")]
    StreamLimit(u32),

    /// The session is shut down: go-away exchanged or transport lost.
    #[error("mux session closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
