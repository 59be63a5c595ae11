//! Stream id allocation and routing of inbound frames to live streams.

use crate::buffers::atomic_map::AtomicMap;
use crate::error::ProtocolError;
use crate::stream::StreamEvent;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Which side of the connection this endpoint is. Clients allocate odd stream ids
///  starting at 1, servers even ids starting at 2.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

/// Allocates outbound stream ids: monotonic per side, correct parity, skipping ids
///  still live in the registry. An id is never reissued while its stream exists, so
///  the reuse window required by the protocol holds trivially.
pub struct StreamIdSupply {
    next: AtomicU32,
}

impl StreamIdSupply {
    pub fn new(side: Side) -> StreamIdSupply {
        StreamIdSupply {
            next: AtomicU32::new(match side {
                Side::Client => 1,
                Side::Server => 2,
            }),
        }
    }

    pub fn next(&self, registry: &StreamRegistry) -> u32 {
        loop {
            let raw = self.next.fetch_add(2, Ordering::Relaxed);
            // ids are 31 bits; the counter wraps through the reserved high bit
            let id = raw & 0x7fff_ffff;
            if id == 0 {
                continue;
            }
            if registry.contains(id) {
                debug!("stream id {} still in use, skipping", id);
                continue;
            }
            return id;
        }
    }
}

/// Maps live stream ids to the event channel of their state machine.
///
/// Lookups work on a detached snapshot, so routing never holds a lock while the
///  receiving state machine runs.
pub struct StreamRegistry {
    streams: AtomicMap<u32, mpsc::UnboundedSender<StreamEvent>>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> StreamRegistry {
        StreamRegistry {
            streams: AtomicMap::new(),
        }
    }

    /// Creates the event channel for a new stream. `None` if the id is already live -
    ///  at most one entry per id may exist.
    pub fn register(&self, stream_id: u32) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.streams.try_insert(stream_id, tx) {
            debug!("registered stream {}", stream_id);
            Some(rx)
        } else {
            None
        }
    }

    pub fn deregister(&self, stream_id: u32) -> bool {
        let removed = self.streams.remove(&stream_id).is_some();
        if removed {
            debug!("deregistered stream {}", stream_id);
        }
        removed
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Delivers an event to the stream's state machine, in wire order. `false` if the
    ///  stream is unknown (the caller decides whether that is worth more than a debug
    ///  log - late frames racing our own termination are normal).
    pub fn route(&self, stream_id: u32, event: StreamEvent) -> bool {
        match self.streams.get(&stream_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Connection teardown: every live stream receives a synthetic connection-closed
    ///  error, then the registry is emptied.
    pub fn close_all(&self) {
        let drained = self.streams.drain();
        for (stream_id, tx) in drained.iter() {
            debug!("delivering connection-closed to stream {}", stream_id);
            let _ = tx.send(StreamEvent::Error(ProtocolError::ConnectionClosed));
        }
    }
}
