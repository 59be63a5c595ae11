//! Lease admission: the server periodically issues `LEASE{ttl, permits}`, the client
//!  spends one permit per request and fails requests locally once the lease is
//!  exhausted or expired. No frame ever goes on the wire for a locally rejected
//!  request.

use crate::error::ProtocolError;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct LeaseGate {
    enabled: bool,
    grant: Mutex<Option<LeaseGrant>>,
}

#[derive(Debug)]
struct LeaseGrant {
    remaining: u32,
    expires_at: Instant,
}

impl LeaseGate {
    /// `enabled` is true only when both sides advertised LEASE during setup; a
    ///  disabled gate admits everything.
    pub fn new(enabled: bool) -> LeaseGate {
        LeaseGate {
            enabled,
            grant: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Installs a fresh lease, replacing whatever was left of the previous one.
    pub fn on_lease(&self, ttl: Duration, permits: u32) {
        if !self.enabled {
            debug!("ignoring LEASE on a session that did not negotiate leasing");
            return;
        }
        let mut grant = self.grant.lock().unwrap();
        *grant = Some(LeaseGrant {
            remaining: permits,
            expires_at: Instant::now() + ttl,
        });
    }

    /// Spends one permit. `Rejected` when leasing is on and no valid permit remains;
    ///  before the first lease arrives everything is rejected.
    pub fn try_acquire(&self) -> Result<(), ProtocolError> {
        if !self.enabled {
            return Ok(());
        }
        let mut grant = self.grant.lock().unwrap();
        match grant.as_mut() {
            None => Err(ProtocolError::Rejected),
            Some(lease) => {
                if lease.remaining == 0 || Instant::now() >= lease.expires_at {
                    Err(ProtocolError::Rejected)
                } else {
                    lease.remaining -= 1;
                    Ok(())
                }
            }
        }
    }
}
