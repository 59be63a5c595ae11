//! Per-stream state machines: lifecycle tracking, the producer sink, the wire-backed
//!  subscription and the event loop that drives a stream from inbound frames.
//!
//! The transport's read loop feeds each live stream through an unbounded channel, so
//!  events reach a stream's state machine in wire order without the registry holding
//!  any lock across dispatch.

use crate::error::{ErrorCode, ProtocolError};
use crate::flow_control::CreditWindow;
use crate::frame::{
    CancelFrame, ErrorFrame, Frame, PayloadFrame, RequestNFrame, REQUEST_N_UNBOUNDED,
};
use crate::payload::{split, Payload, Reassembler};
use crate::registry::StreamRegistry;
use crate::spi::Subscriber;
use crate::spi::Subscription;
use crate::transport::SendPipeline;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A frame addressed to one live stream, as seen by its state machine.
#[derive(Debug)]
pub enum StreamEvent {
    Payload {
        payload: Payload,
        next: bool,
        complete: bool,
        follows: bool,
    },
    RequestN(u32),
    Cancel,
    Error(ProtocolError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Init,
    Active,
    /// The peer-to-us direction has terminated; we may still produce.
    HalfClosedInbound,
    /// The us-to-peer direction has terminated; we may still consume.
    HalfClosedOutbound,
    Closed,
}

/// Tracks the two directions of a stream. A stream leaves the registry exactly when it
///  reaches `Closed`.
pub(crate) struct StreamLifecycle {
    state: Mutex<StreamState>,
}

impl StreamLifecycle {
    pub fn new(initial: StreamState) -> Arc<StreamLifecycle> {
        Arc::new(StreamLifecycle {
            state: Mutex::new(initial),
        })
    }

    /// Both directions open: request-response in flight, channels.
    pub fn active() -> Arc<StreamLifecycle> {
        Self::new(StreamState::Active)
    }

    /// Producer-only stream (responder side of request-stream): the inbound direction
    ///  never carries payloads, only control frames.
    pub fn producer_only() -> Arc<StreamLifecycle> {
        Self::new(StreamState::HalfClosedInbound)
    }

    /// Consumer-only stream (requester side of request-stream).
    pub fn consumer_only() -> Arc<StreamLifecycle> {
        Self::new(StreamState::HalfClosedOutbound)
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Marks the peer-to-us direction terminated; true if the stream is now fully
    ///  closed.
    pub fn close_inbound(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            StreamState::Init | StreamState::Active => StreamState::HalfClosedInbound,
            StreamState::HalfClosedOutbound | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedInbound => StreamState::HalfClosedInbound,
        };
        *state == StreamState::Closed
    }

    /// Marks the us-to-peer direction terminated; true if the stream is now fully
    ///  closed.
    pub fn close_outbound(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            StreamState::Init | StreamState::Active => StreamState::HalfClosedOutbound,
            StreamState::HalfClosedInbound | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedOutbound => StreamState::HalfClosedOutbound,
        };
        *state == StreamState::Closed
    }

    /// Terminates the stream in both directions; true if this call performed the
    ///  transition (for one-shot terminal actions like sending CANCEL).
    pub fn close_both(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let was_closed = *state == StreamState::Closed;
        *state = StreamState::Closed;
        !was_closed
    }
}

/// Adds `n` to a consumer-side credit counter, saturating at the unbounded sentinel.
pub(crate) fn add_credit(outstanding: &AtomicU64, n: u32) {
    if n == REQUEST_N_UNBOUNDED {
        outstanding.store(u64::MAX, Ordering::Release);
        return;
    }
    let _ = outstanding.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        if v == u64::MAX {
            None
        } else {
            Some(v.saturating_add(n as u64))
        }
    });
}

/// Takes one credit; false means the producer overran its grant.
pub(crate) fn consume_credit(outstanding: &AtomicU64) -> bool {
    outstanding
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| match v {
            u64::MAX => Some(u64::MAX),
            0 => None,
            n => Some(n - 1),
        })
        .is_ok()
}

/// Spawns fire-and-forget work from sync contexts (Drop impls, `Subscription`
///  callbacks). Outside a runtime the work is silently skipped - that only happens
///  during teardown.
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
    }
}

/// Everything a stream state machine needs to talk back to the connection.
#[derive(Clone)]
pub(crate) struct StreamCtx {
    pub stream_id: u32,
    pub pipeline: Arc<SendPipeline>,
    pub registry: Arc<StreamRegistry>,
    pub lifecycle: Arc<StreamLifecycle>,
}

/// Producer handle for one stream direction, handed to application code.
///
/// `next` suspends while the remote consumer has granted no credit; peer cancellation
///  resolves such waits with `Canceled`.
#[derive(Clone)]
pub struct PayloadSink {
    ctx: StreamCtx,
    credits: Arc<CreditWindow>,
    finished: Arc<AtomicBool>,
    mtu: usize,
}

impl PayloadSink {
    pub(crate) fn new(ctx: StreamCtx, credits: Arc<CreditWindow>, mtu: usize) -> PayloadSink {
        PayloadSink {
            ctx,
            credits,
            finished: Arc::new(AtomicBool::new(false)),
            mtu,
        }
    }

    pub(crate) fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    /// True once the sink completed, errored or was canceled by the peer.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Credits currently granted by the remote consumer; `u64::MAX` means unbounded.
    pub fn available(&self) -> u64 {
        self.credits.available()
    }

    /// Emits one payload once the consumer has granted credit for it.
    pub async fn next(&self, payload: Payload) -> Result<(), ProtocolError> {
        if self.is_finished() {
            return Err(ProtocolError::Canceled);
        }
        self.credits.acquire().await?;
        if self.is_finished() {
            // cancellation raced the credit grant
            return Err(ProtocolError::Canceled);
        }
        send_payload_fragments(&self.ctx.pipeline, self.ctx.stream_id, self.mtu, payload, false)
            .await
    }

    /// Terminates this direction normally. Idempotent; a no-op after cancel or error.
    pub async fn complete(&self) -> Result<(), ProtocolError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ctx
            .pipeline
            .send(Frame::Payload(PayloadFrame::complete(self.ctx.stream_id)), true)
            .await?;
        if self.ctx.lifecycle.close_outbound() {
            self.ctx.registry.deregister(self.ctx.stream_id);
        }
        Ok(())
    }

    /// Terminates the whole stream with an error frame.
    pub async fn error(&self, error: &ProtocolError) -> Result<(), ProtocolError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = Frame::Error(ErrorFrame::new(
            self.ctx.stream_id,
            error.outbound_code(),
            error.to_string(),
        ));
        self.ctx.pipeline.send(frame, true).await?;
        self.credits.cancel();
        self.ctx.lifecycle.close_both();
        self.ctx.registry.deregister(self.ctx.stream_id);
        Ok(())
    }
}

/// `Subscription` whose demand signals go out on the wire: `request` as REQUEST_N,
///  `cancel` as CANCEL.
pub(crate) struct WireSubscription {
    pub ctx: StreamCtx,
    pub outstanding: Arc<AtomicU64>,
}

impl Subscription for WireSubscription {
    fn request(&self, n: u32) {
        if n == 0 {
            warn!("ignoring requestN(0) on stream {}", self.ctx.stream_id);
            return;
        }
        if self.ctx.lifecycle.is_closed() {
            return;
        }
        add_credit(&self.outstanding, n);
        let pipeline = self.ctx.pipeline.clone();
        let frame = Frame::RequestN(RequestNFrame {
            stream_id: self.ctx.stream_id,
            n,
        });
        spawn_detached(async move {
            if let Err(e) = pipeline.send(frame, true).await {
                debug!("failed to send REQUEST_N: {}", e);
            }
        });
    }

    fn cancel(&self) {
        if !self.ctx.lifecycle.close_both() {
            return;
        }
        self.ctx.registry.deregister(self.ctx.stream_id);
        let pipeline = self.ctx.pipeline.clone();
        let frame = Frame::Cancel(CancelFrame {
            stream_id: self.ctx.stream_id,
        });
        spawn_detached(async move {
            if let Err(e) = pipeline.send(frame, true).await {
                debug!("failed to send CANCEL: {}", e);
            }
        });
    }
}

/// Sends one logical payload, split across FOLLOWS fragments when it exceeds the MTU.
///  All fragments carry NEXT; COMPLETE (if requested) rides the final fragment only.
pub(crate) async fn send_payload_fragments(
    pipeline: &SendPipeline,
    stream_id: u32,
    mtu: usize,
    payload: Payload,
    complete: bool,
) -> Result<(), ProtocolError> {
    let mut fragments = split(mtu, payload);
    let last = fragments.pop().expect("split yields at least one fragment");
    for fragment in fragments {
        pipeline
            .send(
                Frame::Payload(PayloadFrame {
                    stream_id,
                    follows: true,
                    complete: false,
                    next: true,
                    payload: fragment,
                }),
                false,
            )
            .await?;
    }
    pipeline
        .send(
            Frame::Payload(PayloadFrame {
                stream_id,
                follows: false,
                complete,
                next: true,
                payload: last,
            }),
            true,
        )
        .await
}

/// Requester side of request-response: awaits the single response (or completion, or
///  error) on the stream's event channel. Reassembles fragmented responses.
pub(crate) async fn run_request_response(
    stream_id: u32,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) -> Result<Option<Payload>, ProtocolError> {
    let mut reassembler = Reassembler::new();
    let mut saw_next = false;
    loop {
        let Some(event) = events.recv().await else {
            return Err(ProtocolError::ConnectionClosed);
        };
        match event {
            StreamEvent::Payload {
                payload,
                next,
                complete,
                follows,
            } => {
                saw_next |= next;
                if follows {
                    reassembler.push(payload);
                    continue;
                }
                let value = if reassembler.is_empty() {
                    payload
                } else {
                    reassembler.finish(payload)
                };
                if saw_next {
                    return Ok(Some(value));
                }
                if complete {
                    return Ok(None);
                }
            }
            StreamEvent::Error(error) => return Err(error),
            other => {
                debug!("dropping {:?} on request-response stream {}", other, stream_id);
            }
        }
    }
}

/// Consumer half of a stream's event loop.
pub(crate) struct InboundHalf {
    pub subscriber: Arc<dyn Subscriber>,
    /// Credit we granted the peer and have not yet consumed; `u64::MAX` = unbounded.
    pub outstanding: Arc<AtomicU64>,
}

/// Producer half of a stream's event loop.
pub(crate) struct OutboundHalf {
    pub credits: Arc<CreditWindow>,
    /// Shared with the `PayloadSink` so peer cancellation stops the producer.
    pub sink_finished: Arc<AtomicBool>,
}

/// Drives one stream from its inbound events until it is fully closed.
///
/// The same loop serves all stream shapes: a requester-stream passes only `inbound`, a
///  responder-stream only `outbound`, a channel (either role) both. Events addressed
///  to an absent half are dropped with a debug log.
pub(crate) async fn run_stream_events(
    ctx: StreamCtx,
    inbound: Option<InboundHalf>,
    outbound: Option<OutboundHalf>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    let mut reassembler = Reassembler::new();
    let mut saw_next = false;

    loop {
        let Some(event) = events.recv().await else {
            if !ctx.lifecycle.is_closed() {
                // the registry entry vanished underneath us: connection teardown
                if let Some(inbound) = &inbound {
                    inbound.subscriber.on_error(ProtocolError::ConnectionClosed);
                }
                if let Some(outbound) = &outbound {
                    outbound.credits.cancel();
                    outbound.sink_finished.store(true, Ordering::Release);
                }
                ctx.lifecycle.close_both();
            }
            return;
        };

        match event {
            StreamEvent::Payload {
                payload,
                next,
                complete,
                follows,
            } => {
                let Some(inbound_half) = &inbound else {
                    debug!("dropping PAYLOAD on producer-only stream {}", ctx.stream_id);
                    continue;
                };
                saw_next |= next;
                if follows {
                    reassembler.push(payload);
                    continue;
                }
                if saw_next {
                    let value = if reassembler.is_empty() {
                        payload
                    } else {
                        reassembler.finish(payload)
                    };
                    saw_next = false;
                    if !consume_credit(&inbound_half.outstanding) {
                        warn!("peer exceeded granted credit on stream {}", ctx.stream_id);
                        let frame = Frame::Error(ErrorFrame::new(
                            ctx.stream_id,
                            ErrorCode::Invalid,
                            "payload exceeds granted requestN",
                        ));
                        if let Err(e) = ctx.pipeline.send(frame, true).await {
                            debug!("failed to report credit violation: {}", e);
                        }
                        inbound_half.subscriber.on_error(ProtocolError::remote(
                            ErrorCode::Invalid,
                            "peer exceeded granted credit",
                        ));
                        if let Some(outbound_half) = &outbound {
                            outbound_half.credits.cancel();
                            outbound_half.sink_finished.store(true, Ordering::Release);
                        }
                        ctx.lifecycle.close_both();
                        ctx.registry.deregister(ctx.stream_id);
                        return;
                    }
                    inbound_half.subscriber.on_next(value);
                }
                if complete {
                    inbound_half.subscriber.on_complete();
                    if ctx.lifecycle.close_inbound() {
                        ctx.registry.deregister(ctx.stream_id);
                        return;
                    }
                }
            }
            StreamEvent::RequestN(n) => match &outbound {
                Some(outbound_half) => outbound_half.credits.grant(n),
                None => debug!("dropping REQUEST_N on consumer-only stream {}", ctx.stream_id),
            },
            StreamEvent::Cancel => {
                let Some(outbound_half) = &outbound else {
                    debug!("dropping CANCEL on consumer-only stream {}", ctx.stream_id);
                    continue;
                };
                outbound_half.credits.cancel();
                outbound_half.sink_finished.store(true, Ordering::Release);
                if ctx.lifecycle.close_outbound() {
                    ctx.registry.deregister(ctx.stream_id);
                    return;
                }
            }
            StreamEvent::Error(error) => {
                match &inbound {
                    Some(inbound_half) => inbound_half.subscriber.on_error(error),
                    None => debug!("stream {} failed: {}", ctx.stream_id, error),
                }
                if let Some(outbound_half) = &outbound {
                    outbound_half.credits.cancel();
                    outbound_half.sink_finished.store(true, Ordering::Release);
                }
                ctx.lifecycle.close_both();
                ctx.registry.deregister(ctx.stream_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::channel_pair;
    use crate::test_util::RecordingConn;
    use rstest::rstest;

    fn test_ctx(
        conn: &Arc<RecordingConn>,
        registry: &Arc<StreamRegistry>,
        lifecycle: Arc<StreamLifecycle>,
        stream_id: u32,
    ) -> StreamCtx {
        StreamCtx {
            stream_id,
            pipeline: RecordingConn::pipeline(conn),
            registry: registry.clone(),
            lifecycle,
        }
    }

    #[rstest]
    #[case::inbound_then_outbound(true)]
    #[case::outbound_then_inbound(false)]
    fn test_lifecycle_half_close_order(#[case] inbound_first: bool) {
        let lifecycle = StreamLifecycle::active();
        if inbound_first {
            assert!(!lifecycle.close_inbound());
            assert_eq!(StreamState::HalfClosedInbound, lifecycle.state());
            assert!(lifecycle.close_outbound());
        } else {
            assert!(!lifecycle.close_outbound());
            assert_eq!(StreamState::HalfClosedOutbound, lifecycle.state());
            assert!(lifecycle.close_inbound());
        }
        assert!(lifecycle.is_closed());
    }

    #[test]
    fn test_close_both_is_one_shot() {
        let lifecycle = StreamLifecycle::active();
        assert!(lifecycle.close_both());
        assert!(!lifecycle.close_both());
        assert!(lifecycle.is_closed());
    }

    #[test]
    fn test_credit_counters() {
        let outstanding = AtomicU64::new(1);
        assert!(consume_credit(&outstanding));
        assert!(!consume_credit(&outstanding));

        add_credit(&outstanding, 2);
        assert!(consume_credit(&outstanding));
        assert!(consume_credit(&outstanding));
        assert!(!consume_credit(&outstanding));

        add_credit(&outstanding, REQUEST_N_UNBOUNDED);
        for _ in 0..100 {
            assert!(consume_credit(&outstanding));
        }
    }

    #[tokio::test]
    async fn test_sink_waits_for_credit_and_emits() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let lifecycle = StreamLifecycle::producer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle, 2);

        let credits = Arc::new(CreditWindow::new(1));
        let sink = PayloadSink::new(ctx, credits.clone(), 0);

        sink.next(Payload::from_data("a")).await.unwrap();

        let pending = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.next(Payload::from_data("b")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished(), "producer must suspend at zero credit");

        credits.grant(1);
        pending.await.unwrap().unwrap();

        let sent = conn.sent();
        assert_eq!(2, sent.len());
        assert!(matches!(&sent[0], Frame::Payload(f) if f.next && f.payload.data_utf8() == "a"));
        assert!(matches!(&sent[1], Frame::Payload(f) if f.next && f.payload.data_utf8() == "b"));
        assert!(conn.flushes() >= 2, "every emitted payload is flushed");
    }

    #[tokio::test]
    async fn test_sink_complete_closes_and_is_idempotent() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let _events = registry.register(2).unwrap();
        let lifecycle = StreamLifecycle::producer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle.clone(), 2);

        let sink = PayloadSink::new(ctx, Arc::new(CreditWindow::new(1)), 0);
        sink.complete().await.unwrap();
        sink.complete().await.unwrap();

        assert!(lifecycle.is_closed());
        assert!(!registry.contains(2));
        let sent = conn.sent();
        assert_eq!(1, sent.len(), "COMPLETE must go out exactly once");
        assert!(matches!(&sent[0], Frame::Payload(f) if f.complete && !f.next));
    }

    #[tokio::test]
    async fn test_sink_error_reports_outbound_code() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let lifecycle = StreamLifecycle::producer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle, 4);

        let sink = PayloadSink::new(ctx, Arc::new(CreditWindow::new(1)), 0);
        sink.error(&ProtocolError::remote(ErrorCode::ApplicationError, "boom"))
            .await
            .unwrap();

        let sent = conn.sent();
        assert_eq!(1, sent.len());
        match &sent[0] {
            Frame::Error(e) => {
                assert_eq!(Some(ErrorCode::ApplicationError), e.error_code());
                assert_eq!(4, e.stream_id);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(sink.next(Payload::from_data("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_event_loop_delivers_in_order_and_completes() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let events = registry.register(3).unwrap();
        let lifecycle = StreamLifecycle::consumer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle.clone(), 3);

        let outstanding = Arc::new(AtomicU64::new(4));
        let (subscriber, mut stream) = channel_pair(Arc::new(WireSubscription {
            ctx: ctx.clone(),
            outstanding: outstanding.clone(),
        }));

        let driver = tokio::spawn(run_stream_events(
            ctx.clone(),
            Some(InboundHalf {
                subscriber,
                outstanding,
            }),
            None,
            events,
        ));

        for value in ["A", "B"] {
            registry.route(
                3,
                StreamEvent::Payload {
                    payload: Payload::from_data(value),
                    next: true,
                    complete: false,
                    follows: false,
                },
            );
        }
        registry.route(
            3,
            StreamEvent::Payload {
                payload: Payload::empty(),
                next: false,
                complete: true,
                follows: false,
            },
        );

        assert_eq!("A", stream.recv().await.unwrap().unwrap().data_utf8());
        assert_eq!("B", stream.recv().await.unwrap().unwrap().data_utf8());
        assert!(stream.recv().await.is_none());

        driver.await.unwrap();
        assert!(lifecycle.is_closed());
        assert!(!registry.contains(3));
    }

    #[tokio::test]
    async fn test_event_loop_reassembles_fragments() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let events = registry.register(3).unwrap();
        let lifecycle = StreamLifecycle::consumer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle, 3);

        let outstanding = Arc::new(AtomicU64::new(1));
        let (subscriber, mut stream) = channel_pair(Arc::new(WireSubscription {
            ctx: ctx.clone(),
            outstanding: outstanding.clone(),
        }));
        tokio::spawn(run_stream_events(
            ctx,
            Some(InboundHalf {
                subscriber,
                outstanding,
            }),
            None,
            events,
        ));

        registry.route(
            3,
            StreamEvent::Payload {
                payload: Payload::from_data("hel"),
                next: true,
                complete: false,
                follows: true,
            },
        );
        registry.route(
            3,
            StreamEvent::Payload {
                payload: Payload::from_data("lo"),
                next: true,
                complete: false,
                follows: false,
            },
        );

        assert_eq!("hello", stream.recv().await.unwrap().unwrap().data_utf8());
    }

    #[tokio::test]
    async fn test_event_loop_enforces_credit_conservation() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let events = registry.register(3).unwrap();
        let lifecycle = StreamLifecycle::consumer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle, 3);

        let outstanding = Arc::new(AtomicU64::new(1));
        let (subscriber, mut stream) = channel_pair(Arc::new(WireSubscription {
            ctx: ctx.clone(),
            outstanding: outstanding.clone(),
        }));
        let driver = tokio::spawn(run_stream_events(
            ctx,
            Some(InboundHalf {
                subscriber,
                outstanding,
            }),
            None,
            events,
        ));

        for _ in 0..2 {
            registry.route(
                3,
                StreamEvent::Payload {
                    payload: Payload::from_data("x"),
                    next: true,
                    complete: false,
                    follows: false,
                },
            );
        }

        assert!(stream.recv().await.unwrap().is_ok());
        // the second payload violates the grant of 1
        assert!(stream.recv().await.unwrap().is_err());
        driver.await.unwrap();

        let sent = conn.sent();
        assert!(
            matches!(&sent[..], [Frame::Error(e)] if e.error_code() == Some(ErrorCode::Invalid)),
            "violation must be reported with INVALID, got {:?}",
            sent
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_producer_side() {
        let conn = RecordingConn::new();
        let registry = Arc::new(StreamRegistry::new());
        let events = registry.register(2).unwrap();
        let lifecycle = StreamLifecycle::producer_only();
        let ctx = test_ctx(&conn, &registry, lifecycle.clone(), 2);

        let credits = Arc::new(CreditWindow::new(0));
        let sink = PayloadSink::new(ctx.clone(), credits.clone(), 0);

        let driver = tokio::spawn(run_stream_events(
            ctx,
            None,
            Some(OutboundHalf {
                credits,
                sink_finished: sink.finished_flag(),
            }),
            events,
        ));

        let blocked = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.next(Payload::from_data("never")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        registry.route(2, StreamEvent::Cancel);
        assert_eq!(Err(ProtocolError::Canceled), blocked.await.unwrap());

        driver.await.unwrap();
        assert!(lifecycle.is_closed());
        assert!(!registry.contains(2));
        assert!(conn.sent().is_empty(), "no frame goes out after peer cancellation");
    }

    #[tokio::test]
    async fn test_request_response_requester_value() {
        let registry = StreamRegistry::new();
        let events = registry.register(1).unwrap();

        registry.route(
            1,
            StreamEvent::Payload {
                payload: Payload::from_data("pong"),
                next: true,
                complete: true,
                follows: false,
            },
        );

        let result = run_request_response(1, events).await.unwrap();
        assert_eq!(Some(Payload::from_data("pong")), result);
    }

    #[tokio::test]
    async fn test_request_response_requester_empty_completion() {
        let registry = StreamRegistry::new();
        let events = registry.register(1).unwrap();

        registry.route(
            1,
            StreamEvent::Payload {
                payload: Payload::empty(),
                next: false,
                complete: true,
                follows: false,
            },
        );

        assert_eq!(None, run_request_response(1, events).await.unwrap());
    }

    #[tokio::test]
    async fn test_request_response_requester_error() {
        let registry = StreamRegistry::new();
        let events = registry.register(1).unwrap();

        registry.route(
            1,
            StreamEvent::Error(ProtocolError::remote(ErrorCode::ApplicationError, "boom")),
        );

        let result = run_request_response(1, events).await;
        assert_eq!(
            Err(ProtocolError::remote(ErrorCode::ApplicationError, "boom")),
            result
        );
    }
}
