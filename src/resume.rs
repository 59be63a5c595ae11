//! Resumption support: the position-indexed buffer of sent stream frames, and the
//!  store a server consults when a client presents a resume token.
//!
//! Positions count the encoded bytes of stream frames (stream id > 0) in send order;
//!  connection-level frames are neither counted nor replayed. Both sides advance their
//!  `position_received` the same way, so a peer's acknowledged position always falls
//!  on a frame boundary of our buffer.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Retains sent stream frames, keyed by the byte position of their first wire byte,
///  until the peer acknowledges them (keepalive positions) or the configured window
///  evicts them.
pub struct ResumeBuffer {
    window: usize,
    inner: Mutex<ResumeBufferInner>,
}

struct ResumeBufferInner {
    frames: BTreeMap<u64, Frame>,
    buffered_bytes: usize,
    /// Position of the oldest frame still available for replay.
    first_available: u64,
    /// Position the next recorded frame will start at.
    next_position: u64,
}

impl ResumeBuffer {
    pub fn new(window: usize) -> ResumeBuffer {
        ResumeBuffer {
            window,
            inner: Mutex::new(ResumeBufferInner {
                frames: BTreeMap::new(),
                buffered_bytes: 0,
                first_available: 0,
                next_position: 0,
            }),
        }
    }

    /// Records one outbound frame. Connection-level frames (stream id 0) are not part
    ///  of the resumable universe and are skipped.
    pub fn record(&self, frame: &Frame) {
        if frame.stream_id() == 0 {
            return;
        }
        let len = frame.encoded_len();
        let mut inner = self.inner.lock().unwrap();
        let position = inner.next_position;
        inner.frames.insert(position, frame.clone());
        inner.next_position += len as u64;
        inner.buffered_bytes += len;

        // evict the oldest frames once the window overflows; resumption from before
        //  the new first-available position becomes impossible
        while inner.buffered_bytes > self.window {
            let Some((&oldest, _)) = inner.frames.first_key_value() else {
                break;
            };
            let evicted = inner
                .frames
                .remove(&oldest)
                .expect("we just read this key from the map");
            let evicted_len = evicted.encoded_len();
            inner.buffered_bytes -= evicted_len;
            inner.first_available = oldest + evicted_len as u64;
            debug!("resume window overflow: evicted frame at position {}", oldest);
        }
    }

    /// Drops all frames the peer has acknowledged receiving.
    pub fn trim(&self, acknowledged: u64) {
        let mut inner = self.inner.lock().unwrap();
        while let Some((&position, frame)) = inner.frames.first_key_value() {
            let end = position + frame.encoded_len() as u64;
            if end > acknowledged {
                break;
            }
            let frame = inner
                .frames
                .remove(&position)
                .expect("we just read this key from the map");
            inner.buffered_bytes -= frame.encoded_len();
        }
        if acknowledged > inner.first_available {
            inner.first_available = acknowledged;
        }
    }

    /// The frames to put back on the wire for a peer that has received everything up
    ///  to `position`. Fails with `REJECTED_RESUME` when the window no longer reaches
    ///  back that far.
    pub fn replay_from(&self, position: u64) -> Result<Vec<Frame>, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        if position < inner.first_available {
            return Err(ProtocolError::remote(
                ErrorCode::RejectedResume,
                format!(
                    "resume position {} is below the first available position {}",
                    position, inner.first_available
                ),
            ));
        }
        if position > inner.next_position {
            return Err(ProtocolError::remote(
                ErrorCode::RejectedResume,
                format!(
                    "resume position {} is beyond the implied position {}",
                    position, inner.next_position
                ),
            ));
        }
        Ok(inner
            .frames
            .range(position..)
            .map(|(_, frame)| frame.clone())
            .collect())
    }

    pub fn first_available_position(&self) -> u64 {
        self.inner.lock().unwrap().first_available
    }

    /// Position after the last recorded frame.
    pub fn implied_position(&self) -> u64 {
        self.inner.lock().unwrap().next_position
    }
}

/// Everything needed to continue a session on a fresh connection.
#[derive(Clone)]
pub struct ResumeState {
    pub token: Bytes,
    pub buffer: Arc<ResumeBuffer>,
    /// Live counter of stream-frame bytes received; shared with the (possibly dead)
    ///  transport that produced it.
    pub position_received: Arc<AtomicU64>,
    /// Whether lease admission was negotiated for the original session.
    pub lease: bool,
}

/// Server-side lookup of resumable sessions by token. The persistent variant is an
///  external collaborator; `InMemoryResumeStore` covers single-process servers and
///  tests.
#[async_trait]
pub trait ResumeStore: Send + Sync + 'static {
    async fn save(&self, state: ResumeState);
    async fn take(&self, token: &[u8]) -> Option<ResumeState>;
}

#[derive(Default)]
pub struct InMemoryResumeStore {
    sessions: Mutex<FxHashMap<Vec<u8>, ResumeState>>,
}

impl InMemoryResumeStore {
    pub fn new() -> InMemoryResumeStore {
        InMemoryResumeStore::default()
    }
}

#[async_trait]
impl ResumeStore for InMemoryResumeStore {
    async fn save(&self, state: ResumeState) {
        self.sessions
            .lock()
            .unwrap()
            .insert(state.token.to_vec(), state);
    }

    async fn take(&self, token: &[u8]) -> Option<ResumeState> {
        self.sessions.lock().unwrap().remove(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PayloadFrame, RequestNFrame};
    use crate::payload::Payload;

    fn payload_frame(stream_id: u32, data: &'static str) -> Frame {
        Frame::Payload(PayloadFrame::next(stream_id, Payload::from_data(data)))
    }

    #[test]
    fn test_connection_frames_are_not_recorded() {
        let buffer = ResumeBuffer::new(1024);
        buffer.record(&Frame::Keepalive(crate::frame::KeepaliveFrame {
            respond: true,
            last_received_position: 0,
            data: Bytes::new(),
        }));
        assert_eq!(0, buffer.implied_position());
    }

    #[test]
    fn test_positions_advance_by_encoded_len() {
        let buffer = ResumeBuffer::new(1024);
        let first = payload_frame(1, "aa");
        let second = payload_frame(1, "bbb");

        buffer.record(&first);
        assert_eq!(first.encoded_len() as u64, buffer.implied_position());
        buffer.record(&second);
        assert_eq!(
            (first.encoded_len() + second.encoded_len()) as u64,
            buffer.implied_position()
        );
    }

    #[test]
    fn test_replay_from_positions() {
        let buffer = ResumeBuffer::new(1024);
        let first = payload_frame(1, "aa");
        let second = payload_frame(1, "bbb");
        buffer.record(&first);
        buffer.record(&second);

        assert_eq!(vec![first.clone(), second.clone()], buffer.replay_from(0).unwrap());
        assert_eq!(
            vec![second.clone()],
            buffer.replay_from(first.encoded_len() as u64).unwrap()
        );
        assert!(buffer.replay_from(buffer.implied_position()).unwrap().is_empty());
    }

    #[test]
    fn test_replay_beyond_implied_position_is_rejected() {
        let buffer = ResumeBuffer::new(1024);
        buffer.record(&payload_frame(1, "aa"));
        let result = buffer.replay_from(buffer.implied_position() + 1);
        assert_eq!(
            Some(ErrorCode::RejectedResume),
            result.unwrap_err().error_code()
        );
    }

    #[test]
    fn test_trim_releases_acknowledged_frames() {
        let buffer = ResumeBuffer::new(1024);
        let first = payload_frame(1, "aa");
        let second = payload_frame(1, "bbb");
        buffer.record(&first);
        buffer.record(&second);

        buffer.trim(first.encoded_len() as u64);
        assert_eq!(first.encoded_len() as u64, buffer.first_available_position());
        assert_eq!(vec![second], buffer.replay_from(first.encoded_len() as u64).unwrap());

        assert_eq!(
            Some(ErrorCode::RejectedResume),
            buffer.replay_from(0).unwrap_err().error_code()
        );
    }

    #[test]
    fn test_window_overflow_evicts_oldest() {
        let frame = payload_frame(1, "0123456789");
        let window = frame.encoded_len() * 2;
        let buffer = ResumeBuffer::new(window);

        buffer.record(&frame);
        buffer.record(&frame);
        buffer.record(&frame);

        assert_eq!(frame.encoded_len() as u64, buffer.first_available_position());
        assert_eq!(2, buffer.replay_from(frame.encoded_len() as u64).unwrap().len());
        assert!(buffer.replay_from(0).is_err());
    }

    #[test]
    fn test_requestn_frames_are_resumable() {
        let buffer = ResumeBuffer::new(1024);
        let frame = Frame::RequestN(RequestNFrame { stream_id: 3, n: 2 });
        buffer.record(&frame);
        assert_eq!(vec![frame], buffer.replay_from(0).unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryResumeStore::new();
        let state = ResumeState {
            token: Bytes::from_static(b"tok"),
            buffer: Arc::new(ResumeBuffer::new(64)),
            position_received: Arc::new(AtomicU64::new(7)),
            lease: false,
        };
        store.save(state).await;

        let loaded = store.take(b"tok").await.unwrap();
        assert_eq!(Bytes::from_static(b"tok"), loaded.token);
        assert!(store.take(b"tok").await.is_none(), "take removes the entry");
    }
}
