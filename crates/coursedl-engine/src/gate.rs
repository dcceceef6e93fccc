//! # Rate Gate
//!
//! Process-wide admission control for every outbound request.
//!
//! A caller passes the gate once the token bucket admits it *and* no pause is
//! active. Pauses nest: each [`RateGate::pause`] must be balanced by a
//! [`RateGate::resume`], and waiters are released only when the count drops
//! back to zero. A released waiter takes a fresh token before proceeding, so
//! the callers queued behind a pause re-enter the limiter one by one instead
//! of reaching the service as a single burst.

use std::num::NonZeroU32;

use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RateConfig;
use crate::error::{FetchError, Result};

pub struct RateGate {
    limiter: DefaultDirectRateLimiter,
    /// Current pause count; receivers observe every change.
    pauses: watch::Sender<usize>,
}

impl RateGate {
    pub fn new(config: &RateConfig) -> Self {
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let quota = match Quota::with_period(config.period) {
            Some(quota) => quota.allow_burst(burst),
            None => Quota::per_second(NonZeroU32::MAX),
        };
        let (pauses, _) = watch::channel(0usize);

        Self {
            limiter: RateLimiter::direct(quota),
            pauses,
        }
    }

    /// Waits until a request may be issued.
    ///
    /// Fails only with [`FetchError::Cancelled`] when `cancel` fires; a
    /// cancelled waiter leaves the pause count and the other waiters untouched.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let mut pauses = self.pauses.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = self.limiter.until_ready() => {}
            }

            if *pauses.borrow_and_update() == 0 {
                return Ok(());
            }

            debug!("Rate gate is paused, waiting for resume");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                open = pauses.wait_for(|count| *count == 0).map(|r| r.is_ok()) => {
                    if !open {
                        return Err(FetchError::Cancelled);
                    }
                }
            }
            // Loop back: a resumed caller still needs a token of its own.
        }
    }

    /// Blocks every current and future `acquire` until the matching `resume`.
    pub fn pause(&self) {
        let mut count = 0;
        self.pauses.send_modify(|c| {
            *c += 1;
            count = *c;
        });
        warn!(pause_count = count, "[Stop the world] all requests paused");
    }

    /// Releases one pause; waiters proceed once no pause remains.
    pub fn resume(&self) {
        let mut count = 0;
        self.pauses.send_modify(|c| {
            *c = c.saturating_sub(1);
            count = *c;
        });
        info!(pause_count = count, "[Restart the world] pause released");
    }

    /// Pauses the gate until the returned guard is dropped.
    pub fn hold(&self) -> GateHold<'_> {
        self.pause();
        GateHold { gate: self }
    }

    pub fn pause_count(&self) -> usize {
        *self.pauses.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count() > 0
    }
}

/// Keeps a [`RateGate`] paused for as long as it is alive.
#[must_use = "the gate resumes as soon as the hold is dropped"]
pub struct GateHold<'a> {
    gate: &'a RateGate,
}

impl Drop for GateHold<'_> {
    fn drop(&mut self) {
        self.gate.resume();
    }
}
