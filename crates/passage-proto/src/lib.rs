//! Wire protocol definitions for the passage tunnel system.
//!
//! This crate defines the multiplexer frame format, the push-bus message
//! envelope, and the identifiers shared between the data plane and the
//! control plane.

pub mod frame;
pub mod ids;
pub mod messages;

pub use frame::{Frame, FrameDecoder, FrameError, FrameFlags, FrameType, StreamId};
pub use ids::{OwnerId, TunnelId};
pub use messages::{ClientMessage, PushMessage};

/// Reserved stream ID for connection-level frames (ping, go-away).
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Hard upper bound on a frame payload. The per-tunnel frame size is
/// configurable but never exceeds this.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024;
