//! The reactive contract at the application boundary.
//!
//! The protocol core expresses stream consumption in terms of `Subscriber` and
//!  `Subscription` so it stays decoupled from any particular reactive library. The
//!  channel-backed `PayloadStream` is the convenience consumer used by the session's
//!  high-level API; integrations with other runtimes implement `Subscriber` directly.

use crate::error::ProtocolError;
use crate::payload::Payload;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receiver of stream signals. Implementations must be cheap and non-blocking: they
///  are invoked from the stream's event task.
pub trait Subscriber: Send + Sync + 'static {
    /// The stream is live; `subscription` requests credit and cancels.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let _ = subscription;
    }
    fn on_next(&self, payload: Payload);
    fn on_error(&self, error: ProtocolError);
    fn on_complete(&self);
}

/// Consumer's handle on a live stream: credit grants go out as REQUEST_N frames,
///  cancellation as a CANCEL frame.
pub trait Subscription: Send + Sync + 'static {
    /// Authorizes `n` further payloads. `n` of `0x7FFF_FFFF` means unbounded; 0 is
    ///  ignored with a warning (the wire format forbids it).
    fn request(&self, n: u32);
    /// Cancels the stream; the local consumer will see no further signals.
    fn cancel(&self);
}

pub(crate) enum StreamSignal {
    Next(Payload),
    Complete,
    Error(ProtocolError),
}

/// `Subscriber` that feeds a `PayloadStream`. The sender is dropped on the terminal
///  signal so late signals fall into the void.
pub(crate) struct ChannelSubscriber {
    tx: Mutex<Option<mpsc::UnboundedSender<StreamSignal>>>,
}

impl Subscriber for ChannelSubscriber {
    fn on_next(&self, payload: Payload) {
        if let Some(tx) = &*self.tx.lock().unwrap() {
            let _ = tx.send(StreamSignal::Next(payload));
        }
    }

    fn on_error(&self, error: ProtocolError) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(StreamSignal::Error(error));
        }
    }

    fn on_complete(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(StreamSignal::Complete);
        }
    }
}

/// Builds the channel-backed consumer pair for a stream: the `ChannelSubscriber` goes
///  to the stream's event task, the `PayloadStream` to the application.
pub(crate) fn channel_pair(
    subscription: Arc<dyn Subscription>,
) -> (Arc<ChannelSubscriber>, PayloadStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber = Arc::new(ChannelSubscriber {
        tx: Mutex::new(Some(tx)),
    });
    let stream = PayloadStream {
        rx,
        subscription,
        terminated: false,
    };
    (subscriber, stream)
}

/// Pull-style consumer over a stream of payloads.
///
/// Dropping an unterminated `PayloadStream` cancels the stream on the wire.
pub struct PayloadStream {
    rx: mpsc::UnboundedReceiver<StreamSignal>,
    subscription: Arc<dyn Subscription>,
    terminated: bool,
}

impl PayloadStream {
    /// Grants the producer `n` further payloads.
    pub fn request(&self, n: u32) {
        self.subscription.request(n);
    }

    pub fn cancel(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.subscription.cancel();
        }
    }

    /// Next payload; `None` once the stream completed. A terminal error is yielded
    ///  once as `Some(Err(_))`, after which the stream reports `None`.
    pub async fn recv(&mut self) -> Option<Result<Payload, ProtocolError>> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamSignal::Next(payload)) => Some(Ok(payload)),
            Some(StreamSignal::Complete) => {
                self.terminated = true;
                None
            }
            Some(StreamSignal::Error(error)) => {
                self.terminated = true;
                Some(Err(error))
            }
            None => {
                self.terminated = true;
                None
            }
        }
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        if !self.terminated {
            self.subscription.cancel();
        }
    }
}
