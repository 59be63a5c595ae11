//! The session is where all other parts of the protocol come together: it owns the
//!  transport, wires the frame handlers to the stream registry and the per-stream
//!  state machines, schedules keepalives, and exposes the symmetric requester API.
//!
//! Ownership: the session owns the transport, the transport owns the connection.
//!  Stream state machines hold the registry and send pipeline strongly but reach the
//!  session itself only through the weak handles captured in the frame handlers, so
//!  dropping the last `Session`/`SessionHandle` tears everything down.

use crate::config::SessionConfig;
use crate::connection::Conn;
use crate::error::{ErrorCode, ProtocolError};
use crate::flow_control::CreditWindow;
use crate::frame::{
    CancelFrame, ErrorFrame, Frame, KeepaliveFrame, LeaseFrame, MetadataPushFrame, PayloadFrame,
    RequestChannelFrame, RequestFnfFrame, RequestResponseFrame, RequestStreamFrame, ResumeFrame,
    ResumeOkFrame, SetupFrame, VERSION_MAJOR, VERSION_MINOR,
};
use crate::keepalive::run_keepalive;
use crate::lease::LeaseGate;
use crate::payload::{split, Payload, Reassembler};
use crate::registry::{Side, StreamIdSupply, StreamRegistry};
use crate::resume::{ResumeBuffer, ResumeState, ResumeStore};
use crate::spi::{channel_pair, PayloadStream, Subscriber, Subscription};
use crate::stream::{
    self, run_request_response, run_stream_events, InboundHalf, OutboundHalf, PayloadSink,
    StreamCtx, StreamEvent, StreamLifecycle, WireSubscription,
};
use crate::transport::{EventType, SendPipeline, Transport};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, trace, warn};

/// The application's side of the contract: one handler per interaction model. Default
///  implementations reject with `REJECTED`, so a responder only implements what it
///  serves.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// At most one value; `Ok(None)` completes the request without a payload.
    async fn request_response(&self, payload: Payload) -> Result<Option<Payload>, ProtocolError> {
        let _ = payload;
        Err(not_implemented("request-response"))
    }

    /// No response stream exists; errors are logged, never reported to the peer.
    async fn fire_and_forget(&self, payload: Payload) -> Result<(), ProtocolError> {
        let _ = payload;
        Err(not_implemented("fire-and-forget"))
    }

    /// Produce into `producer`, which suspends while the requester has granted no
    ///  credit. Returning `Ok` completes the stream unless the handler already did.
    async fn request_stream(
        &self,
        payload: Payload,
        producer: PayloadSink,
    ) -> Result<(), ProtocolError> {
        let _ = (payload, producer);
        Err(not_implemented("request-stream"))
    }

    /// Bidirectional: `first` is the payload that rode the request frame, `inbound`
    ///  the requester's further payloads, `producer` this side's outbound direction.
    async fn request_channel(
        &self,
        first: Payload,
        inbound: PayloadStream,
        producer: PayloadSink,
    ) -> Result<(), ProtocolError> {
        let _ = (first, inbound, producer);
        Err(not_implemented("request-channel"))
    }

    async fn metadata_push(&self, metadata: Bytes) {
        let _ = metadata;
    }
}

fn not_implemented(kind: &str) -> ProtocolError {
    ProtocolError::remote(
        ErrorCode::Rejected,
        format!("{} is not implemented by this responder", kind),
    )
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RequestKind {
    Response,
    FireAndForget,
    Stream,
    Channel,
}

/// A fragmented request whose continuation frames are still arriving. The responder
///  is invoked only once the final fragment lands.
struct PendingRequest {
    kind: RequestKind,
    initial_request_n: u32,
    complete: bool,
    reassembler: Reassembler,
}

/// One RSocket session over one connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Cloneable requester handle; all request methods are safe to call from any task.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    side: Side,
    config: SessionConfig,
    transport: Arc<Transport>,
    pipeline: Arc<SendPipeline>,
    registry: Arc<StreamRegistry>,
    ids: StreamIdSupply,
    responder: Arc<dyn Responder>,
    lease: LeaseGate,
    resume: Option<Arc<ResumeBuffer>>,
    resume_token: Option<Bytes>,
    pending_requests: Mutex<FxHashMap<u32, PendingRequest>>,
    close_requested: Notify,
    closed_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Session {
    /// Establishes the client side: sends SETUP and returns the live session. `run`
    ///  must be driven for any frames to be processed.
    pub async fn client(
        conn: Arc<dyn Conn>,
        config: SessionConfig,
        responder: Arc<dyn Responder>,
    ) -> anyhow::Result<Session> {
        config.validate()?;
        let transport = Arc::new(Transport::new(conn));
        transport.set_lifetime(config.max_lifetime);

        let resume_buffer = config
            .resume_token
            .as_ref()
            .map(|_| Arc::new(ResumeBuffer::new(config.resume_window)));
        let resume_token = config.resume_token.clone();
        let lease_enabled = config.lease;

        let inner = SessionInner::create(
            Side::Client,
            transport,
            config,
            responder,
            lease_enabled,
            resume_buffer,
            resume_token,
        );
        SessionInner::wire_handlers(&inner);

        let setup = Frame::Setup(SetupFrame {
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
            keepalive_interval: inner.config.keepalive_interval,
            max_lifetime: inner.config.max_lifetime,
            resume_token: inner.resume_token.clone(),
            lease: inner.config.lease,
            metadata_mime_type: inner.config.metadata_mime_type.clone(),
            data_mime_type: inner.config.data_mime_type.clone(),
            payload: Payload::empty(),
        });
        inner.pipeline.send(setup, true).await?;

        Ok(Session { inner })
    }

    /// Accepts the server side of a fresh connection: reads the first frame, which
    ///  must be SETUP. RESUME is rejected - use `server_with_resume` to support it.
    pub async fn server(
        conn: Arc<dyn Conn>,
        config: SessionConfig,
        responder: Arc<dyn Responder>,
    ) -> anyhow::Result<Session> {
        Session::server_with_resume(conn, config, responder, None).await
    }

    /// Accepts the server side, consulting `store` when the client presents a resume
    ///  token instead of SETUP.
    pub async fn server_with_resume(
        conn: Arc<dyn Conn>,
        config: SessionConfig,
        responder: Arc<dyn Responder>,
        store: Option<Arc<dyn ResumeStore>>,
    ) -> anyhow::Result<Session> {
        config.validate()?;
        let transport = Arc::new(Transport::new(conn));
        transport.set_lifetime(config.max_lifetime);

        match transport.read_first().await? {
            Frame::Setup(setup) => {
                if setup.major_version != VERSION_MAJOR {
                    let message = format!(
                        "unsupported protocol version {}.{}",
                        setup.major_version, setup.minor_version
                    );
                    let frame = Frame::Error(ErrorFrame::new(
                        0,
                        ErrorCode::UnsupportedSetup,
                        message.clone(),
                    ));
                    let _ = transport.send(&frame, true).await;
                    transport.close().await;
                    anyhow::bail!(message);
                }
                // the client's SETUP dictates how long we wait for frames
                transport.set_lifetime(setup.max_lifetime);

                let lease_enabled = setup.lease && config.lease;
                let resume_buffer = setup
                    .resume_token
                    .as_ref()
                    .map(|_| Arc::new(ResumeBuffer::new(config.resume_window)));
                let inner = SessionInner::create(
                    Side::Server,
                    transport,
                    config,
                    responder,
                    lease_enabled,
                    resume_buffer,
                    setup.resume_token,
                );
                SessionInner::wire_handlers(&inner);

                if let Some(store) = &store {
                    if let Some(state) = inner.resume_state() {
                        store.save(state).await;
                    }
                }
                Ok(Session { inner })
            }
            Frame::Resume(resume) => {
                let Some(store) = store else {
                    return Err(reject_resume(&transport, "resumption is not enabled").await);
                };
                let Some(state) = store.take(&resume.token).await else {
                    return Err(reject_resume(&transport, "unknown resume token").await);
                };
                let replay = match state.buffer.replay_from(resume.last_received_server_position) {
                    Ok(frames) => frames,
                    Err(e) => {
                        return Err(reject_resume(&transport, &e.to_string()).await);
                    }
                };

                // the client must still hold every frame beyond what we received,
                //  otherwise the gap can never be replayed
                let position_received = state.position_received.load(Ordering::Acquire);
                if resume.first_available_client_position > position_received {
                    return Err(reject_resume(
                        &transport,
                        &format!(
                            "client's first available position {} is beyond the server's received position {}",
                            resume.first_available_client_position, position_received
                        ),
                    )
                    .await);
                }
                transport.restore_position_received(position_received);
                transport
                    .send(
                        &Frame::ResumeOk(ResumeOkFrame {
                            last_received_client_position: position_received,
                        }),
                        true,
                    )
                    .await?;

                let inner = SessionInner::create(
                    Side::Server,
                    transport,
                    config,
                    responder,
                    state.lease,
                    Some(state.buffer.clone()),
                    Some(state.token.clone()),
                );
                SessionInner::wire_handlers(&inner);

                // replay bypasses the pipeline so frames are not re-recorded
                for frame in &replay {
                    inner.transport.send(frame, false).await?;
                }
                inner.transport.flush().await?;
                debug!("resumed session, replayed {} frames", replay.len());

                if let Some(state) = inner.resume_state() {
                    store.save(state).await;
                }
                Ok(Session { inner })
            }
            other => {
                let frame = Frame::Error(ErrorFrame::new(
                    0,
                    ErrorCode::InvalidSetup,
                    "expected SETUP as the first frame",
                ));
                let _ = transport.send(&frame, true).await;
                transport.close().await;
                anyhow::bail!(
                    "expected SETUP or RESUME as the first frame, got {:?}",
                    other.frame_type()
                );
            }
        }
    }

    /// Reconnects a dead client session: presents the resume token and the position
    ///  bookkeeping of `state`, replays what the server missed, and continues with the
    ///  retained resume buffer.
    pub async fn client_resume(
        conn: Arc<dyn Conn>,
        config: SessionConfig,
        responder: Arc<dyn Responder>,
        state: ResumeState,
    ) -> anyhow::Result<Session> {
        config.validate()?;
        let transport = Arc::new(Transport::new(conn));
        transport.set_lifetime(config.max_lifetime);
        transport.restore_position_received(state.position_received.load(Ordering::Acquire));

        transport
            .send(
                &Frame::Resume(ResumeFrame {
                    major_version: VERSION_MAJOR,
                    minor_version: VERSION_MINOR,
                    token: state.token.clone(),
                    last_received_server_position: transport.position_received(),
                    first_available_client_position: state.buffer.first_available_position(),
                }),
                true,
            )
            .await?;

        match transport.read_first().await? {
            Frame::ResumeOk(ok) => {
                let replay = state.buffer.replay_from(ok.last_received_client_position)?;

                let inner = SessionInner::create(
                    Side::Client,
                    transport,
                    config,
                    responder,
                    state.lease,
                    Some(state.buffer.clone()),
                    Some(state.token.clone()),
                );
                SessionInner::wire_handlers(&inner);

                for frame in &replay {
                    inner.transport.send(frame, false).await?;
                }
                inner.transport.flush().await?;
                debug!("resume accepted, replayed {} frames", replay.len());
                Ok(Session { inner })
            }
            Frame::Error(e) => {
                transport.close().await;
                anyhow::bail!("resume rejected: [{:#06x}] {}", e.code, e.message());
            }
            other => {
                transport.close().await;
                anyhow::bail!("expected RESUME_OK, got {:?}", other.frame_type());
            }
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: self.inner.clone(),
        }
    }

    /// The state a later `client_resume` needs; `None` when resumption was not
    ///  negotiated.
    pub fn resume_state(&self) -> Option<ResumeState> {
        self.inner.resume_state()
    }

    /// Drives the read loop and (on the client side) the keepalive scheduler until
    ///  the connection terminates. All live streams observe `ConnectionClosed` when
    ///  this returns.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let transport = inner.transport.clone();

        // keepalives originate on the client; the server echoes and relies on the
        //  read deadline negotiated in SETUP
        let keepalive: Pin<Box<dyn Future<Output = Result<(), ProtocolError>> + Send>> =
            if inner.side == Side::Client {
                Box::pin(run_keepalive(
                    inner.pipeline.clone(),
                    transport.clone(),
                    inner.resume.clone(),
                    inner.config.keepalive_interval,
                ))
            } else {
                Box::pin(std::future::pending())
            };

        let result = tokio::select! {
            result = transport.start() => result,
            result = keepalive => result,
            _ = inner.close_requested.notified() => Ok(()),
        };
        inner.shutdown().await;
        result
    }

    pub async fn close(&self) {
        self.inner.close_requested.notify_waiters();
        self.inner.shutdown().await;
    }

    /// Resolves once the session has fully shut down.
    pub async fn closed(&self) {
        self.inner.closed().await;
    }
}

async fn reject_resume(transport: &Transport, message: &str) -> anyhow::Error {
    let frame = Frame::Error(ErrorFrame::new(0, ErrorCode::RejectedResume, message));
    let _ = transport.send(&frame, true).await;
    transport.close().await;
    anyhow::anyhow!("resume rejected: {}", message)
}

impl SessionHandle {
    /// One request, at most one response payload.
    pub async fn request_response(&self, payload: Payload) -> Result<Option<Payload>, ProtocolError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.lease.try_acquire()?;

        let stream_id = inner.ids.next(&inner.registry);
        let events = inner
            .registry
            .register(stream_id)
            .expect("this is a bug: the id supply never hands out live stream ids");
        let guard = StreamGuard::new(stream_id, inner.pipeline.clone(), inner.registry.clone());

        inner
            .send_request(stream_id, RequestKind::Response, 0, false, payload)
            .await?;
        let result = run_request_response(stream_id, events).await;
        guard.finish();
        result
    }

    /// Sends the payload and forgets it; resolution only confirms the frame was
    ///  handed to the connection.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.lease.try_acquire()?;

        let stream_id = inner.ids.next(&inner.registry);
        inner
            .send_request(stream_id, RequestKind::FireAndForget, 0, false, payload)
            .await
    }

    /// Pushes connection-scoped metadata; no stream, no response.
    pub async fn metadata_push(&self, metadata: Bytes) -> Result<(), ProtocolError> {
        self.inner.ensure_open()?;
        self.inner
            .pipeline
            .send(Frame::MetadataPush(MetadataPushFrame::new(metadata)), true)
            .await
    }

    /// Opens a stream with `initial_n` initial credit and a pull-style consumer.
    pub async fn request_stream(
        &self,
        payload: Payload,
        initial_n: u32,
    ) -> Result<PayloadStream, ProtocolError> {
        let (subscription, setup) = self.start_stream(payload, initial_n).await?;
        let (subscriber, stream) = channel_pair(subscription);
        setup.launch(subscriber);
        Ok(stream)
    }

    /// Opens a stream delivering into a caller-provided `Subscriber`; the returned
    ///  subscription posts REQUEST_N and CANCEL on the wire.
    pub async fn request_stream_with(
        &self,
        payload: Payload,
        initial_n: u32,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<Arc<dyn Subscription>, ProtocolError> {
        let (subscription, setup) = self.start_stream(payload, initial_n).await?;
        subscriber.on_subscribe(subscription.clone());
        setup.launch(subscriber);
        Ok(subscription)
    }

    async fn start_stream(
        &self,
        payload: Payload,
        initial_n: u32,
    ) -> Result<(Arc<WireSubscription>, StreamLaunch), ProtocolError> {
        if initial_n == 0 {
            return Err(ProtocolError::Invalid("initialRequestN must be positive".into()));
        }
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.lease.try_acquire()?;

        let stream_id = inner.ids.next(&inner.registry);
        let events = inner
            .registry
            .register(stream_id)
            .expect("this is a bug: the id supply never hands out live stream ids");
        let ctx = StreamCtx {
            stream_id,
            pipeline: inner.pipeline.clone(),
            registry: inner.registry.clone(),
            lifecycle: StreamLifecycle::consumer_only(),
        };

        let outstanding = Arc::new(AtomicU64::new(0));
        stream::add_credit(&outstanding, initial_n);
        let subscription = Arc::new(WireSubscription {
            ctx: ctx.clone(),
            outstanding: outstanding.clone(),
        });

        if let Err(e) = inner
            .send_request(stream_id, RequestKind::Stream, initial_n, false, payload)
            .await
        {
            inner.registry.deregister(stream_id);
            return Err(e);
        }

        Ok((
            subscription,
            StreamLaunch {
                ctx,
                outstanding,
                events,
            },
        ))
    }

    /// Opens a bidirectional channel. `first` rides the request frame; the returned
    ///  sink produces upstream (suspending on the peer's credit), the returned stream
    ///  consumes downstream with `initial_n` initial credit.
    pub async fn request_channel(
        &self,
        first: Payload,
        initial_n: u32,
    ) -> Result<(PayloadSink, PayloadStream), ProtocolError> {
        if initial_n == 0 {
            return Err(ProtocolError::Invalid("initialRequestN must be positive".into()));
        }
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.lease.try_acquire()?;

        let stream_id = inner.ids.next(&inner.registry);
        let events = inner
            .registry
            .register(stream_id)
            .expect("this is a bug: the id supply never hands out live stream ids");
        let ctx = StreamCtx {
            stream_id,
            pipeline: inner.pipeline.clone(),
            registry: inner.registry.clone(),
            lifecycle: StreamLifecycle::active(),
        };

        // upstream credit starts at zero; the first payload rides the request frame
        let credits = Arc::new(CreditWindow::new(0));
        let sink = PayloadSink::new(ctx.clone(), credits.clone(), inner.config.frame_mtu);

        let outstanding = Arc::new(AtomicU64::new(0));
        stream::add_credit(&outstanding, initial_n);
        let subscription = Arc::new(WireSubscription {
            ctx: ctx.clone(),
            outstanding: outstanding.clone(),
        });
        let (subscriber, stream) = channel_pair(subscription);

        if let Err(e) = inner
            .send_request(stream_id, RequestKind::Channel, initial_n, false, first)
            .await
        {
            inner.registry.deregister(stream_id);
            return Err(e);
        }

        tokio::spawn(run_stream_events(
            ctx,
            Some(InboundHalf {
                subscriber,
                outstanding,
            }),
            Some(OutboundHalf {
                credits,
                sink_finished: sink.finished_flag(),
            }),
            events,
        ));

        Ok((sink, stream))
    }

    /// Server side: issues a lease of `permits` requests valid for `ttl`.
    pub async fn issue_lease(
        &self,
        ttl: Duration,
        permits: u32,
        metadata: Option<Bytes>,
    ) -> Result<(), ProtocolError> {
        self.inner.ensure_open()?;
        self.inner
            .pipeline
            .send(
                Frame::Lease(LeaseFrame {
                    ttl,
                    number_of_requests: permits,
                    metadata,
                }),
                true,
            )
            .await
    }

    pub async fn close(&self) {
        self.inner.close_requested.notify_waiters();
        self.inner.shutdown().await;
    }

    pub async fn closed(&self) {
        self.inner.closed().await;
    }
}

/// Deferred spawn of a requester-stream event loop, so the caller can decide which
///  subscriber receives the signals.
struct StreamLaunch {
    ctx: StreamCtx,
    outstanding: Arc<AtomicU64>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamLaunch {
    fn launch(self, subscriber: Arc<dyn Subscriber>) {
        tokio::spawn(run_stream_events(
            self.ctx,
            Some(InboundHalf {
                subscriber,
                outstanding: self.outstanding,
            }),
            None,
            self.events,
        ));
    }
}

/// Cleans up a requester stream whose future is dropped before the response arrives:
///  the registry entry goes away and the peer gets a CANCEL.
struct StreamGuard {
    stream_id: u32,
    pipeline: Arc<SendPipeline>,
    registry: Arc<StreamRegistry>,
    done: bool,
}

impl StreamGuard {
    fn new(stream_id: u32, pipeline: Arc<SendPipeline>, registry: Arc<StreamRegistry>) -> StreamGuard {
        StreamGuard {
            stream_id,
            pipeline,
            registry,
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
        self.registry.deregister(self.stream_id);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.registry.deregister(self.stream_id);
        let pipeline = self.pipeline.clone();
        let frame = Frame::Cancel(CancelFrame {
            stream_id: self.stream_id,
        });
        stream::spawn_detached(async move {
            if let Err(e) = pipeline.send(frame, true).await {
                debug!("failed to send CANCEL: {}", e);
            }
        });
    }
}

impl SessionInner {
    #[allow(clippy::too_many_arguments)]
    fn create(
        side: Side,
        transport: Arc<Transport>,
        config: SessionConfig,
        responder: Arc<dyn Responder>,
        lease_enabled: bool,
        resume: Option<Arc<ResumeBuffer>>,
        resume_token: Option<Bytes>,
    ) -> Arc<SessionInner> {
        let pipeline = Arc::new(SendPipeline::new(transport.clone(), resume.clone()));
        Arc::new(SessionInner {
            side,
            config,
            transport,
            pipeline,
            registry: Arc::new(StreamRegistry::new()),
            ids: StreamIdSupply::new(side),
            responder,
            lease: LeaseGate::new(lease_enabled),
            resume,
            resume_token,
            pending_requests: Mutex::new(FxHashMap::default()),
            close_requested: Notify::new(),
            closed_tx: watch::channel(false).0,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ProtocolError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn resume_state(&self) -> Option<ResumeState> {
        let buffer = self.resume.clone()?;
        let token = self.resume_token.clone()?;
        Some(ResumeState {
            token,
            buffer,
            position_received: self.transport.position_received_handle(),
            lease: self.lease.is_enabled(),
        })
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down session");
        self.transport.close().await;
        self.registry.close_all();
        self.pending_requests.lock().unwrap().clear();
        let _ = self.closed_tx.send(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sends one request frame, splitting the payload across FOLLOWS fragments when
    ///  it exceeds the MTU. `complete` only applies to channels.
    async fn send_request(
        &self,
        stream_id: u32,
        kind: RequestKind,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) -> Result<(), ProtocolError> {
        let mut fragments = split(self.config.frame_mtu, payload).into_iter();
        let first = fragments.next().expect("split yields at least one fragment");
        let follows = fragments.len() > 0;

        let frame = match kind {
            RequestKind::Response => Frame::RequestResponse(RequestResponseFrame {
                stream_id,
                follows,
                payload: first,
            }),
            RequestKind::FireAndForget => Frame::RequestFnf(RequestFnfFrame {
                stream_id,
                follows,
                payload: first,
            }),
            RequestKind::Stream => Frame::RequestStream(RequestStreamFrame {
                stream_id,
                initial_request_n,
                follows,
                payload: first,
            }),
            RequestKind::Channel => Frame::RequestChannel(RequestChannelFrame {
                stream_id,
                initial_request_n,
                follows,
                complete: complete && !follows,
                payload: first,
            }),
        };
        self.pipeline.send(frame, !follows).await?;

        let mut remaining = fragments.len();
        for fragment in fragments {
            remaining -= 1;
            let is_last = remaining == 0;
            self.pipeline
                .send(
                    Frame::Payload(PayloadFrame {
                        stream_id,
                        follows: !is_last,
                        complete: complete && is_last,
                        next: true,
                        payload: fragment,
                    }),
                    is_last,
                )
                .await?;
        }
        Ok(())
    }

    fn wire_handlers(inner: &Arc<SessionInner>) {
        let transport = inner.transport.clone();

        transport.handle(EventType::Setup, |_| {
            Err(ProtocolError::Invalid(
                "unexpected SETUP after session establishment".into(),
            ))
        });
        transport.handle(EventType::Resume, |_| {
            Err(ProtocolError::Invalid(
                "unexpected RESUME after session establishment".into(),
            ))
        });
        transport.handle(EventType::ResumeOk, |_| {
            // position bookkeeping happened in the transport
            trace!("RESUME_OK acknowledged");
            Ok(())
        });
        transport.handle(EventType::ErrorZeroStreamId, |frame| {
            if let Frame::Error(e) = frame {
                error!("connection error from peer: [{:#06x}] {}", e.code, e.message());
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::Keepalive, move |frame| {
            if let (Some(inner), Frame::Keepalive(keepalive)) = (weak.upgrade(), frame) {
                inner.on_keepalive(keepalive);
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::Lease, move |frame| {
            if let (Some(inner), Frame::Lease(lease)) = (weak.upgrade(), frame) {
                inner.lease.on_lease(lease.ttl, lease.number_of_requests);
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::MetadataPush, move |frame| {
            if let (Some(inner), Frame::MetadataPush(push)) = (weak.upgrade(), frame) {
                let responder = inner.responder.clone();
                tokio::spawn(async move {
                    responder.metadata_push(push.metadata).await;
                });
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::FireAndForget, move |frame| {
            if let (Some(inner), Frame::RequestFnf(f)) = (weak.upgrade(), frame) {
                inner.on_request(
                    f.stream_id,
                    RequestKind::FireAndForget,
                    0,
                    false,
                    f.follows,
                    f.payload,
                );
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::RequestResponse, move |frame| {
            if let (Some(inner), Frame::RequestResponse(f)) = (weak.upgrade(), frame) {
                inner.on_request(f.stream_id, RequestKind::Response, 0, false, f.follows, f.payload);
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::RequestStream, move |frame| {
            if let (Some(inner), Frame::RequestStream(f)) = (weak.upgrade(), frame) {
                inner.on_request(
                    f.stream_id,
                    RequestKind::Stream,
                    f.initial_request_n,
                    false,
                    f.follows,
                    f.payload,
                );
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::RequestChannel, move |frame| {
            if let (Some(inner), Frame::RequestChannel(f)) = (weak.upgrade(), frame) {
                inner.on_request(
                    f.stream_id,
                    RequestKind::Channel,
                    f.initial_request_n,
                    f.complete,
                    f.follows,
                    f.payload,
                );
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::Payload, move |frame| {
            if let (Some(inner), Frame::Payload(f)) = (weak.upgrade(), frame) {
                inner.on_payload(f);
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::RequestN, move |frame| {
            if let (Some(inner), Frame::RequestN(f)) = (weak.upgrade(), frame) {
                inner.on_stream_event(f.stream_id, StreamEvent::RequestN(f.n));
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::Cancel, move |frame| {
            if let (Some(inner), Frame::Cancel(f)) = (weak.upgrade(), frame) {
                if inner.take_pending(f.stream_id).is_some() {
                    debug!("canceled partially assembled request on stream {}", f.stream_id);
                } else {
                    inner.on_stream_event(f.stream_id, StreamEvent::Cancel);
                }
            }
            Ok(())
        });

        let weak = Arc::downgrade(inner);
        transport.handle(EventType::Error, move |frame| {
            if let (Some(inner), Frame::Error(f)) = (weak.upgrade(), frame) {
                if inner.take_pending(f.stream_id).is_some() {
                    debug!("peer failed partially assembled request on stream {}", f.stream_id);
                } else {
                    let error = ProtocolError::Remote {
                        code: f.code,
                        message: f.message(),
                    };
                    inner.on_stream_event(f.stream_id, StreamEvent::Error(error));
                }
            }
            Ok(())
        });
    }

    fn on_keepalive(&self, keepalive: KeepaliveFrame) {
        if let Some(resume) = &self.resume {
            resume.trim(self.transport.peer_ack_position());
        }
        if keepalive.respond {
            let pipeline = self.pipeline.clone();
            let position = self.transport.position_received();
            stream::spawn_detached(async move {
                let frame = Frame::Keepalive(KeepaliveFrame {
                    respond: false,
                    last_received_position: position,
                    data: keepalive.data,
                });
                if let Err(e) = pipeline.send(frame, true).await {
                    debug!("failed to answer keepalive: {}", e);
                }
            });
        }
    }

    fn take_pending(&self, stream_id: u32) -> Option<PendingRequest> {
        self.pending_requests.lock().unwrap().remove(&stream_id)
    }

    /// Entry point for the four request frame types on the responder side.
    fn on_request(
        &self,
        stream_id: u32,
        kind: RequestKind,
        initial_request_n: u32,
        complete: bool,
        follows: bool,
        payload: Payload,
    ) {
        if follows {
            let mut pending = self.pending_requests.lock().unwrap();
            if pending.contains_key(&stream_id) || self.registry.contains(stream_id) {
                warn!("dropping duplicate request for live stream {}", stream_id);
                return;
            }
            let mut reassembler = Reassembler::new();
            reassembler.push(payload);
            pending.insert(
                stream_id,
                PendingRequest {
                    kind,
                    initial_request_n,
                    complete,
                    reassembler,
                },
            );
            return;
        }
        self.accept_request(stream_id, kind, initial_request_n, complete, payload);
    }

    /// Payload frames either continue a fragmented request or belong to a live stream.
    fn on_payload(&self, frame: PayloadFrame) {
        let stream_id = frame.stream_id;
        {
            let mut pending = self.pending_requests.lock().unwrap();
            if pending.contains_key(&stream_id) {
                if frame.follows {
                    pending
                        .get_mut(&stream_id)
                        .expect("checked above")
                        .reassembler
                        .push(frame.payload);
                    return;
                }
                let mut request = pending.remove(&stream_id).expect("checked above");
                drop(pending);
                let payload = request.reassembler.finish(frame.payload);
                self.accept_request(
                    stream_id,
                    request.kind,
                    request.initial_request_n,
                    request.complete || frame.complete,
                    payload,
                );
                return;
            }
        }
        self.on_stream_event(
            stream_id,
            StreamEvent::Payload {
                payload: frame.payload,
                next: frame.next,
                complete: frame.complete,
                follows: frame.follows,
            },
        );
    }

    fn on_stream_event(&self, stream_id: u32, event: StreamEvent) {
        if !self.registry.route(stream_id, event) {
            // late frames racing our own termination are expected; the peer may also
            //  have lost the race against a CANCEL
            debug!("dropping frame for unknown stream {}", stream_id);
        }
    }

    /// Creates the responder-side state machine for a fully assembled request.
    fn accept_request(
        &self,
        stream_id: u32,
        kind: RequestKind,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) {
        match kind {
            RequestKind::FireAndForget => {
                let responder = self.responder.clone();
                tokio::spawn(async move {
                    // no response stream exists, so failures are only logged
                    if let Err(error) = responder.fire_and_forget(payload).await {
                        warn!("fire-and-forget handler failed: {}", error);
                    }
                });
            }
            RequestKind::Response => {
                let Some(events) = self.registry.register(stream_id) else {
                    warn!("peer reused live stream id {}, dropping request", stream_id);
                    return;
                };
                let ctx = StreamCtx {
                    stream_id,
                    pipeline: self.pipeline.clone(),
                    registry: self.registry.clone(),
                    lifecycle: StreamLifecycle::active(),
                };
                self.spawn_request_response_responder(ctx, payload, events);
            }
            RequestKind::Stream => {
                let Some(events) = self.registry.register(stream_id) else {
                    warn!("peer reused live stream id {}, dropping request", stream_id);
                    return;
                };
                let ctx = StreamCtx {
                    stream_id,
                    pipeline: self.pipeline.clone(),
                    registry: self.registry.clone(),
                    lifecycle: StreamLifecycle::producer_only(),
                };
                let credits = Arc::new(CreditWindow::new(initial_request_n));
                let sink = PayloadSink::new(ctx.clone(), credits.clone(), self.config.frame_mtu);

                tokio::spawn(run_stream_events(
                    ctx,
                    None,
                    Some(OutboundHalf {
                        credits,
                        sink_finished: sink.finished_flag(),
                    }),
                    events,
                ));
                self.spawn_producer(sink, ProducerKind::Stream { payload });
            }
            RequestKind::Channel => {
                let Some(events) = self.registry.register(stream_id) else {
                    warn!("peer reused live stream id {}, dropping request", stream_id);
                    return;
                };
                let ctx = StreamCtx {
                    stream_id,
                    pipeline: self.pipeline.clone(),
                    registry: self.registry.clone(),
                    lifecycle: StreamLifecycle::active(),
                };
                let credits = Arc::new(CreditWindow::new(initial_request_n));
                let sink = PayloadSink::new(ctx.clone(), credits.clone(), self.config.frame_mtu);

                let outstanding = Arc::new(AtomicU64::new(0));
                let subscription = Arc::new(WireSubscription {
                    ctx: ctx.clone(),
                    outstanding: outstanding.clone(),
                });
                let (subscriber, inbound_stream) = channel_pair(subscription);

                if complete {
                    // the requester completed its side with the initial frame
                    subscriber.on_complete();
                    ctx.lifecycle.close_inbound();
                }

                tokio::spawn(run_stream_events(
                    ctx,
                    Some(InboundHalf {
                        subscriber,
                        outstanding,
                    }),
                    Some(OutboundHalf {
                        credits,
                        sink_finished: sink.finished_flag(),
                    }),
                    events,
                ));
                self.spawn_producer(
                    sink,
                    ProducerKind::Channel {
                        first: payload,
                        inbound: inbound_stream,
                    },
                );
            }
        }
    }

    fn spawn_request_response_responder(
        &self,
        ctx: StreamCtx,
        payload: Payload,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let responder = self.responder.clone();
        let mtu = self.config.frame_mtu;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = responder.request_response(payload) => Some(result),
                _ = wait_for_abort(&mut events) => None,
            };
            match outcome {
                None => {
                    debug!("request-response {} aborted before responding", ctx.stream_id);
                }
                Some(Ok(Some(value))) => {
                    if let Err(e) =
                        stream::send_payload_fragments(&ctx.pipeline, ctx.stream_id, mtu, value, true)
                            .await
                    {
                        debug!("failed to send response on stream {}: {}", ctx.stream_id, e);
                    }
                }
                Some(Ok(None)) => {
                    let frame = Frame::Payload(PayloadFrame::complete(ctx.stream_id));
                    if let Err(e) = ctx.pipeline.send(frame, true).await {
                        debug!("failed to complete stream {}: {}", ctx.stream_id, e);
                    }
                }
                Some(Err(error)) => {
                    let frame = Frame::Error(ErrorFrame::new(
                        ctx.stream_id,
                        error.outbound_code(),
                        error.to_string(),
                    ));
                    if let Err(e) = ctx.pipeline.send(frame, true).await {
                        debug!("failed to report error on stream {}: {}", ctx.stream_id, e);
                    }
                }
            }
            ctx.lifecycle.close_both();
            ctx.registry.deregister(ctx.stream_id);
        });
    }

    /// Runs the application's producer handler; a clean return auto-completes, an
    ///  error terminates the stream with an ERROR frame.
    fn spawn_producer(&self, sink: PayloadSink, kind: ProducerKind) {
        let responder = self.responder.clone();
        tokio::spawn(async move {
            let result = match kind {
                ProducerKind::Stream { payload } => {
                    responder.request_stream(payload, sink.clone()).await
                }
                ProducerKind::Channel { first, inbound } => {
                    responder.request_channel(first, inbound, sink.clone()).await
                }
            };
            match result {
                Ok(()) => {
                    if let Err(e) = sink.complete().await {
                        debug!("failed to complete producer: {}", e);
                    }
                }
                Err(error) => {
                    if let Err(e) = sink.error(&error).await {
                        debug!("failed to report producer error: {}", e);
                    }
                }
            }
        });
    }
}

enum ProducerKind {
    Stream { payload: Payload },
    Channel { first: Payload, inbound: PayloadStream },
}

/// Resolves when the requester aborts the request (CANCEL, stream error, teardown).
async fn wait_for_abort(events: &mut mpsc::UnboundedReceiver<StreamEvent>) {
    loop {
        match events.recv().await {
            None | Some(StreamEvent::Cancel) | Some(StreamEvent::Error(_)) => return,
            Some(other) => {
                debug!("dropping {:?} on request-response responder", other);
            }
        }
    }
}
