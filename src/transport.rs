//! The transport owns one connection, runs its read loop and dispatches decoded frames
//!  to the handlers registered per event type. It also keeps the connection-level
//!  bookkeeping that must happen before dispatch: the read deadline, the byte position
//!  of received stream frames, and the positions the peer acknowledges in KEEPALIVE
//!  and RESUME_OK frames.

use crate::connection::Conn;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::resume::ResumeBuffer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

/// Read deadline before a SETUP frame adjusts it.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// The events a transport dispatches on, one per frame type plus the connection-error
///  special case.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventType {
    Setup = 0,
    Resume,
    ResumeOk,
    Lease,
    FireAndForget,
    MetadataPush,
    RequestResponse,
    RequestStream,
    RequestChannel,
    Payload,
    RequestN,
    Error,
    ErrorZeroStreamId,
    Cancel,
    Keepalive,
}

const HANDLER_COUNT: usize = EventType::Keepalive as usize + 1;

pub type FrameHandler = Box<dyn Fn(Frame) -> Result<(), ProtocolError> + Send + Sync>;

pub struct Transport {
    conn: Arc<dyn Conn>,
    max_lifetime_millis: AtomicU64,
    /// Byte position of stream frames received on this connection; reported to the
    ///  peer in outbound keepalives and the basis for resumption. Shared so resume
    ///  state can outlive the transport.
    position_received: Arc<AtomicU64>,
    /// The latest position the peer has acknowledged receiving from us.
    peer_ack_position: AtomicU64,
    handlers: RwLock<[Option<FrameHandler>; HANDLER_COUNT]>,
    closed: AtomicBool,
}

impl Transport {
    pub fn new(conn: Arc<dyn Conn>) -> Transport {
        Transport {
            conn,
            max_lifetime_millis: AtomicU64::new(DEFAULT_MAX_LIFETIME.as_millis() as u64),
            position_received: Arc::new(AtomicU64::new(0)),
            peer_ack_position: AtomicU64::new(0),
            handlers: RwLock::new(std::array::from_fn(|_| None)),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers the handler for one event type, replacing any previous one.
    pub fn handle(
        &self,
        event: EventType,
        handler: impl Fn(Frame) -> Result<(), ProtocolError> + Send + Sync + 'static,
    ) {
        let mut handlers = self.handlers.write().unwrap();
        handlers[event as usize] = Some(Box::new(handler));
    }

    /// Adjusts the read deadline. Lifetimes below 1ms are ignored.
    pub fn set_lifetime(&self, lifetime: Duration) {
        if lifetime < Duration::from_millis(1) {
            return;
        }
        self.max_lifetime_millis
            .store(lifetime.as_millis() as u64, Ordering::Release);
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_millis.load(Ordering::Acquire))
    }

    pub fn position_received(&self) -> u64 {
        self.position_received.load(Ordering::Acquire)
    }

    /// Shared handle on the received-bytes counter, kept by resume state so a later
    ///  session can tell the peer how far this one got.
    pub fn position_received_handle(&self) -> Arc<AtomicU64> {
        self.position_received.clone()
    }

    /// Restores the received-bytes position when a session resumes on this transport.
    pub fn restore_position_received(&self, position: u64) {
        self.position_received.store(position, Ordering::Release);
    }

    pub fn peer_ack_position(&self) -> u64 {
        self.peer_ack_position.load(Ordering::Acquire)
    }

    /// Reads a single frame outside the dispatch loop, for the SETUP / RESUME
    ///  handshake. Any failure closes the transport.
    pub async fn read_first(&self) -> Result<Frame, ProtocolError> {
        match self.conn.read().await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                self.close().await;
                Err(ProtocolError::ConnectionClosed)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    /// Runs the read loop until the peer closes cleanly (`Ok`), the deadline expires,
    ///  or a read/dispatch failure occurs. The transport is closed on all exits.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let result = self.read_loop().await;
        self.close().await;
        result
    }

    async fn read_loop(&self) -> Result<(), ProtocolError> {
        loop {
            let lifetime = self.max_lifetime();
            let frame = match time::timeout(lifetime, self.conn.read()).await {
                Err(_elapsed) => return Err(ProtocolError::DeadlineExceeded(lifetime)),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(frame))) => frame,
                Ok(Err(e)) => return Err(e),
            };
            self.dispatch(frame)?;
        }
    }

    /// Delivers one inbound frame to its registered handler, after the pre-dispatch
    ///  bookkeeping. A zero-stream-id ERROR frame is decoded into an error value and
    ///  terminates the connection after the `ErrorZeroStreamId` handler saw it.
    pub fn dispatch(&self, frame: Frame) -> Result<(), ProtocolError> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "frame_received", ?correlation_id);
        let _entered = span.enter();

        trace!("dispatching {:?} frame for stream {}", frame.frame_type(), frame.stream_id());

        // connection-level frames do not count toward the resume position
        if frame.stream_id() != 0 {
            self.position_received
                .fetch_add(frame.encoded_len() as u64, Ordering::AcqRel);
        }

        let event = match &frame {
            Frame::Setup(setup) => {
                self.set_lifetime(setup.max_lifetime);
                EventType::Setup
            }
            Frame::Resume(_) => EventType::Resume,
            Frame::ResumeOk(ok) => {
                self.peer_ack_position
                    .store(ok.last_received_client_position, Ordering::Release);
                EventType::ResumeOk
            }
            Frame::Lease(_) => EventType::Lease,
            Frame::RequestFnf(_) => EventType::FireAndForget,
            Frame::MetadataPush(push) => {
                if push.stream_id != 0 {
                    warn!("omitting METADATA_PUSH with non-zero stream id {}", push.stream_id);
                    return Ok(());
                }
                EventType::MetadataPush
            }
            Frame::RequestResponse(_) => EventType::RequestResponse,
            Frame::RequestStream(_) => EventType::RequestStream,
            Frame::RequestChannel(_) => EventType::RequestChannel,
            Frame::Payload(_) => EventType::Payload,
            Frame::RequestN(_) => EventType::RequestN,
            Frame::Error(error) => {
                if error.stream_id == 0 {
                    let err = ProtocolError::Remote {
                        code: error.code,
                        message: error.message(),
                    };
                    let handlers = self.handlers.read().unwrap();
                    if let Some(handler) = &handlers[EventType::ErrorZeroStreamId as usize] {
                        let _ = handler(frame.clone());
                    }
                    return Err(err);
                }
                EventType::Error
            }
            Frame::Cancel(_) => EventType::Cancel,
            Frame::Keepalive(keepalive) => {
                self.peer_ack_position
                    .store(keepalive.last_received_position, Ordering::Release);
                EventType::Keepalive
            }
        };

        let handlers = self.handlers.read().unwrap();
        match &handlers[event as usize] {
            Some(handler) => handler(frame),
            // a missing handler means the transport was wired incorrectly, which is a
            //  bug in the caller and fatal
            None => Err(ProtocolError::NoHandler(event)),
        }
    }

    /// Sends one frame, optionally flushing the connection afterwards.
    pub async fn send(&self, frame: &Frame, flush: bool) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::TransportClosed);
        }
        self.conn.write(frame).await?;
        if flush {
            self.conn.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::TransportClosed);
        }
        self.conn.flush().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing transport");
            let _ = self.conn.close().await;
        }
    }
}

/// The outbound path shared by all stream state machines: frames pass through the
///  resume buffer (when resumption is on) and then the transport.
pub struct SendPipeline {
    transport: Arc<Transport>,
    resume: Option<Arc<ResumeBuffer>>,
}

impl SendPipeline {
    pub fn new(transport: Arc<Transport>, resume: Option<Arc<ResumeBuffer>>) -> SendPipeline {
        SendPipeline { transport, resume }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub async fn send(&self, frame: Frame, flush: bool) -> Result<(), ProtocolError> {
        if let Some(resume) = &self.resume {
            // recording happens even if the write then fails: the peer will not have
            //  acknowledged the frame, so a later resume replays it
            resume.record(&frame);
        }
        self.transport.send(&frame, flush).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{pipe, MockConn};
    use crate::error::ErrorCode;
    use crate::frame::{
        ErrorFrame, KeepaliveFrame, MetadataPushFrame, PayloadFrame, RequestNFrame, SetupFrame,
    };
    use crate::payload::Payload;
    use bytes::Bytes;
    use mockall::Sequence;
    use std::sync::Mutex;

    fn keepalive(position: u64) -> Frame {
        Frame::Keepalive(KeepaliveFrame {
            respond: false,
            last_received_position: position,
            data: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_registered_handler() {
        let mut conn = MockConn::new();
        let mut sequence = Sequence::new();
        conn.expect_read()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(Some(Frame::RequestN(RequestNFrame { stream_id: 1, n: 2 }))));
        conn.expect_read()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(None));
        conn.expect_close().returning(|| Ok(()));

        let transport = Transport::new(Arc::new(conn));
        let seen: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            transport.handle(EventType::RequestN, move |frame| {
                seen.lock().unwrap().push(frame);
                Ok(())
            });
        }

        transport.start().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(1, seen.len());
        assert!(matches!(&seen[0], Frame::RequestN(f) if f.n == 2));
    }

    #[tokio::test]
    async fn test_missing_handler_is_fatal() {
        let mut conn = MockConn::new();
        conn.expect_read()
            .returning(|| Ok(Some(Frame::RequestN(RequestNFrame { stream_id: 1, n: 2 }))));
        conn.expect_close().returning(|| Ok(()));

        let transport = Transport::new(Arc::new(conn));
        assert_eq!(
            Err(ProtocolError::NoHandler(EventType::RequestN)),
            transport.start().await
        );
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_keepalive_updates_peer_ack_position() {
        let conn = MockConn::new();
        let transport = Transport::new(Arc::new(conn));
        transport.handle(EventType::Keepalive, |_| Ok(()));

        transport.dispatch(keepalive(4711)).unwrap();
        assert_eq!(4711, transport.peer_ack_position());
    }

    #[tokio::test]
    async fn test_position_received_counts_stream_frames_only() {
        let conn = MockConn::new();
        let transport = Transport::new(Arc::new(conn));
        transport.handle(EventType::Keepalive, |_| Ok(()));
        transport.handle(EventType::Payload, |_| Ok(()));

        transport.dispatch(keepalive(0)).unwrap();
        assert_eq!(0, transport.position_received(), "connection frames do not count");

        let payload = Frame::Payload(PayloadFrame::next(1, Payload::from_data("abc")));
        let expected = payload.encoded_len() as u64;
        transport.dispatch(payload).unwrap();
        assert_eq!(expected, transport.position_received());
    }

    #[tokio::test]
    async fn test_setup_overrides_lifetime() {
        let conn = MockConn::new();
        let transport = Transport::new(Arc::new(conn));
        transport.handle(EventType::Setup, |_| Ok(()));

        transport
            .dispatch(Frame::Setup(SetupFrame {
                major_version: 1,
                minor_version: 0,
                keepalive_interval: Duration::from_secs(5),
                max_lifetime: Duration::from_secs(15),
                resume_token: None,
                lease: false,
                metadata_mime_type: "application/binary".to_string(),
                data_mime_type: "application/binary".to_string(),
                payload: Payload::empty(),
            }))
            .unwrap();
        assert_eq!(Duration::from_secs(15), transport.max_lifetime());
    }

    #[tokio::test]
    async fn test_sub_millisecond_lifetime_is_ignored() {
        let conn = MockConn::new();
        let transport = Transport::new(Arc::new(conn));
        transport.set_lifetime(Duration::from_micros(10));
        assert_eq!(DEFAULT_MAX_LIFETIME, transport.max_lifetime());
    }

    #[tokio::test]
    async fn test_misaddressed_metadata_push_is_dropped() {
        let conn = MockConn::new();
        let transport = Transport::new(Arc::new(conn));
        // deliberately no MetadataPush handler: the frame must not reach dispatch

        let frame = Frame::MetadataPush(MetadataPushFrame {
            stream_id: 7,
            metadata: Bytes::from_static(b"m"),
        });
        assert_eq!(Ok(()), transport.dispatch(frame));
    }

    #[tokio::test]
    async fn test_zero_stream_id_error_terminates_the_connection() {
        let conn = MockConn::new();
        let transport = Transport::new(Arc::new(conn));

        let seen: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            transport.handle(EventType::ErrorZeroStreamId, move |frame| {
                seen.lock().unwrap().push(frame);
                Ok(())
            });
        }

        let result = transport.dispatch(Frame::Error(ErrorFrame::new(
            0,
            ErrorCode::ConnectionError,
            "bad peer",
        )));
        assert_eq!(
            Err(ProtocolError::Remote {
                code: ErrorCode::ConnectionError.into(),
                message: "bad peer".to_string()
            }),
            result
        );
        assert_eq!(1, seen.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_periodic_keepalives_keep_the_deadline_at_bay() {
        let (a, b) = pipe(1024);
        let transport = Arc::new(Transport::new(Arc::new(a)));
        // three times the peer's send interval, per the usual deployment advice
        transport.set_lifetime(Duration::from_millis(150));
        transport.handle(EventType::Keepalive, |_| Ok(()));

        let sender = tokio::spawn(async move {
            for _ in 0..10 {
                b.write(&Frame::Keepalive(KeepaliveFrame {
                    respond: false,
                    last_received_position: 0,
                    data: bytes::Bytes::new(),
                }))
                .await
                .unwrap();
                b.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            b.close().await.unwrap();
        });

        // the read loop must survive all 500ms of the trace and end with clean EOF
        let run = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.start().await })
        };
        assert_eq!(Ok(()), run.await.unwrap());
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_expiry_closes_the_transport() {
        let (a, _b) = pipe(1024);
        let transport = Transport::new(Arc::new(a));
        transport.set_lifetime(Duration::from_millis(50));

        let result = transport.start().await;
        assert_eq!(
            Err(ProtocolError::DeadlineExceeded(Duration::from_millis(50))),
            result
        );
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_is_refused() {
        let mut conn = MockConn::new();
        conn.expect_close().returning(|| Ok(()));
        let transport = Transport::new(Arc::new(conn));
        transport.close().await;

        assert_eq!(
            Err(ProtocolError::TransportClosed),
            transport
                .send(&Frame::RequestN(RequestNFrame { stream_id: 1, n: 1 }), true)
                .await
        );
    }
}
