//! Core of an RSocket protocol implementation: the binary framing layer, the
//!  transport frame dispatcher, and the interaction-model state machines with their
//!  flow-control, keepalive, lease and resumption semantics.
//!
//! RSocket is a symmetric, multiplexed, bidirectional message protocol over a
//!  reliable byte stream. Peers exchange length-prefixed frames carrying typed
//!  operations over numbered logical streams; either peer may be requester or
//!  responder on any given stream.
//!
//! ## Design goals
//!
//! * Five interaction models over one connection: request-response, request-stream,
//!   request-channel, fire-and-forget and metadata-push
//!   * each interaction is a numbered stream; clients allocate odd ids, servers even
//!   * streams are independent: stream-scoped failures never affect their neighbours
//! * Reactive-streams-style flow control on the wire
//!   * a producer may only emit what the consumer authorized via `initialRequestN`
//!     and subsequent REQUEST_N frames; credit is additive and saturates at the
//!     unbounded sentinel `0x7FFF_FFFF`
//!   * producers suspend at zero credit rather than buffering unboundedly
//! * Liveness through keepalives
//!   * one side schedules KEEPALIVE frames, the other echoes them; a connection
//!     without inbound frames for `maxLifetime` is dead
//!   * keepalives carry the received-bytes position, which doubles as the
//!     acknowledgement stream for resumption
//! * Optional session resumption
//!   * sent stream frames are retained, keyed by byte position, until acknowledged
//!   * a reconnecting client presents its resume token and both sides replay what the
//!     other missed
//! * Optional lease-based admission control: requests beyond the server-issued lease
//!   fail locally, without putting a frame on the wire
//!
//! ## Wire format
//!
//! Frames ride a 24-bit big-endian length prefix on stream transports. The frame
//!  itself starts with a 6-byte header:
//!
//! ```ascii
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |R|                   Stream ID (31 bits)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Frame Type (6)   |       Flags (10 bits)                     |
//! +-+-+-+-+-+-+-+-+---+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `R` is reserved and must be 0. Stream id 0 addresses the connection itself
//!  (SETUP, KEEPALIVE, LEASE, RESUME, METADATA_PUSH, connection errors). When the
//!  METADATA flag is set, the frame body starts with a 24-bit big-endian metadata
//!  length followed by the metadata bytes; the remainder is data.
//!
//! See `frame` for the full set of frame types and their bodies.
//!
//! ## Layering
//!
//! ```ascii
//! application        Responder / SessionHandle / PayloadStream / PayloadSink
//! session            handler wiring, keepalive, lease, resume      (session)
//! streams            per-stream state machines, credit             (stream, flow_control)
//! routing            stream registry, id allocation                (registry)
//! dispatch           read loop, handler table, deadline            (transport)
//! framing            frame codec                                   (frame, payload)
//! bytes              length-prefixed connection                    (connection)
//! ```
//!
//! Exactly one task reads from a connection (the transport's read loop); any number
//!  of tasks write through the connection's internal write lock. Frames for one
//!  stream reach its state machine in wire order.

pub mod buf_ext;
pub mod buffers;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame;
mod keepalive;
pub mod lease;
pub mod payload;
pub mod registry;
pub mod resume;
pub mod session;
pub mod spi;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::SessionConfig;
pub use connection::{Conn, TcpConn};
pub use error::{ErrorCode, FrameError, ProtocolError};
pub use payload::Payload;
pub use session::{Responder, Session, SessionHandle};
pub use spi::{PayloadStream, Subscriber, Subscription};
pub use stream::PayloadSink;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
