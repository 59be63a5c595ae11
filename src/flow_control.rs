use crate::error::ProtocolError;
use crate::frame::REQUEST_N_UNBOUNDED;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// Sentinel for "the consumer granted unbounded credit".
const UNBOUNDED: u64 = u64::MAX;

/// Producer-side credit window for one stream direction.
///
/// Tracks how many payloads the remote consumer has authorized via `initialRequestN`
///  and subsequent REQUEST_N frames. `acquire` suspends the producer while the window
///  is empty; a grant of `0x7FFF_FFFF` makes the window unbounded for good.
///
/// Grants are additive with saturation at unbounded. Cancellation wakes all waiting
///  producers with `Canceled`.
pub struct CreditWindow {
    available: AtomicU64,
    notify: Notify,
    canceled: AtomicBool,
}

impl CreditWindow {
    pub fn new(initial: u32) -> CreditWindow {
        let available = if initial == REQUEST_N_UNBOUNDED {
            UNBOUNDED
        } else {
            initial as u64
        };
        CreditWindow {
            available: AtomicU64::new(available),
            notify: Notify::new(),
            canceled: AtomicBool::new(false),
        }
    }

    /// Credits currently available; `u64::MAX` means unbounded.
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.available() == UNBOUNDED
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Adds `n` credits (from a REQUEST_N frame or the initial request).
    pub fn grant(&self, n: u32) {
        if n == REQUEST_N_UNBOUNDED {
            trace!("credit window granted unbounded");
            self.available.store(UNBOUNDED, Ordering::Release);
        } else {
            let _ = self
                .available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                    if available == UNBOUNDED {
                        None
                    } else {
                        Some(available.saturating_add(n as u64))
                    }
                });
        }
        self.notify.notify_waiters();
    }

    /// Wakes all waiting producers with `Canceled`; the window never opens again.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Takes one credit if available. A canceled window never hands out credit.
    pub fn try_acquire(&self) -> bool {
        if self.is_canceled() {
            return false;
        }
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| match available {
                UNBOUNDED => Some(UNBOUNDED),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    /// Takes one credit, suspending until the consumer grants more. This is the
    ///  producer's cooperative cancellation point: a concurrent `cancel` resolves the
    ///  wait with `Canceled`.
    pub async fn acquire(&self) -> Result<(), ProtocolError> {
        loop {
            if self.is_canceled() {
                return Err(ProtocolError::Canceled);
            }
            if self.try_acquire() {
                return Ok(());
            }
            let notified = self.notify.notified();
            // re-check after registering interest so a concurrent grant is not lost
            if self.is_canceled() {
                return Err(ProtocolError::Canceled);
            }
            if self.try_acquire() {
                return Ok(());
            }
            notified.await;
        }
    }
}
