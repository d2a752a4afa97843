use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::headers::RateLimitHeaders;
use super::{LatencyRef, now_millis};

/// Quota before the server has told us anything about a route
const OPTIMISTIC_LIMIT: u32 = 1;

/// Reset window substituted by the reaction reset quirk
const REACTION_QUIRK_RESET_MS: i64 = 250;

/// Point-in-time view of a bucket's quota state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the current window clears, in epoch milliseconds (0 if never set)
    pub reset: i64,
}

impl BucketSnapshot {
    /// Whether the bucket still runs on its optimistic default, i.e. the
    /// server never sent a limit for it
    #[must_use]
    pub const fn is_default_limit(&self) -> bool {
        self.limit == OPTIMISTIC_LIMIT
    }
}

/// Rate limit state and admission queue for one route key.
///
/// At most one [`BucketLease`] exists per bucket at any time. Callers
/// [`acquire`](RouteBucket::acquire) a lease, run their attempt and drop or
/// [`release`](BucketLease::release) the lease; the next waiter is admitted
/// only then, and only while the quota window has room.
#[derive(Debug)]
pub(crate) struct RouteBucket {
    latency: Arc<LatencyRef>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    reset: i64,
    in_flight: bool,
    wakeup: Option<Wakeup>,
    next_wakeup_id: u64,
    queue: VecDeque<oneshot::Sender<BucketLease>>,
}

#[derive(Debug)]
struct Wakeup {
    id: u64,
    handle: JoinHandle<()>,
}

impl RouteBucket {
    pub(crate) fn new(latency: Arc<LatencyRef>) -> Self {
        Self {
            latency,
            state: Mutex::new(BucketState {
                limit: OPTIMISTIC_LIMIT,
                remaining: OPTIMISTIC_LIMIT,
                reset: 0,
                in_flight: false,
                wakeup: None,
                next_wakeup_id: 0,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Wait for this bucket's single execution slot.
    ///
    /// Waiters are admitted in FIFO order; a `priority` waiter goes to the
    /// front of the line but never preempts the lease currently held.
    /// Dropping the returned future gives the place in line up.
    pub(crate) async fn acquire(self: &Arc<Self>, priority: bool) -> BucketLease {
        self.enqueue(priority).lease().await
    }

    /// Take a place in line right away and return the ticket to wait on.
    ///
    /// The position is fixed when this returns, so callers that must join
    /// several buckets in a given order can do so without racing.
    pub(crate) fn enqueue(self: &Arc<Self>, priority: bool) -> BucketTicket {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if priority {
            state.queue.push_front(tx);
        } else {
            state.queue.push_back(tx);
        }
        self.check(&mut state);
        BucketTicket {
            bucket: Arc::clone(self),
            rx,
        }
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        let state = self.lock();
        BucketSnapshot {
            limit: state.limit,
            remaining: state.remaining,
            reset: state.reset,
        }
    }

    /// Take the quota the server reported for this route.
    ///
    /// The window reset prefers a relative reset, then the absolute epoch
    /// reset, then "now". Global limits never touch the bucket's own reset.
    pub(crate) fn update_quota(
        &self,
        headers: &RateLimitHeaders,
        route: &str,
        now: i64,
        reaction_quirk: bool,
    ) -> BucketSnapshot {
        let latency = self.latency.latency();
        let mut state = self.lock();

        if let Some(limit) = headers.limit {
            state.limit = limit;
        }
        state.remaining = headers.remaining.unwrap_or(1);

        if let Some(reset_after) = headers.reset_after {
            if !headers.global {
                let millis = i64::try_from(reset_after.as_millis()).unwrap_or(i64::MAX);
                state.reset = now.saturating_add(millis.max(1));
            }
        } else if let Some(mut reset_at) = headers.reset_at {
            if reaction_quirk
                && route.ends_with("/reactions/:id")
                && headers.date_millis().is_some_and(|date| reset_at - date == 1_000)
            {
                reset_at = now + REACTION_QUIRK_RESET_MS;
            }
            state.reset = (reset_at - latency).max(now);
        } else {
            state.reset = now;
        }

        BucketSnapshot {
            limit: state.limit,
            remaining: state.remaining,
            reset: state.reset,
        }
    }

    /// Admit the next waiter if the slot is free and the window has room,
    /// otherwise arrange to look again when the window resets.
    fn check(self: &Arc<Self>, state: &mut BucketState) {
        loop {
            if state.queue.is_empty() {
                if let Some(wakeup) = state.wakeup.take() {
                    wakeup.handle.abort();
                }
                return;
            }
            // The lease holder calls back in on release
            if state.in_flight {
                return;
            }

            let now = now_millis();
            let offset = self.latency.latency();
            if state.reset == 0 || state.reset < now - offset {
                state.reset = now - offset;
                state.remaining = state.limit.max(1);
            }

            if state.remaining == 0 {
                if state.wakeup.is_none() {
                    let delay = (state.reset - now + offset).max(0) + 1;
                    self.schedule_wakeup(state, Duration::from_millis(delay.unsigned_abs()));
                }
                return;
            }
            // The window has room again, a pending wakeup is stale
            if let Some(wakeup) = state.wakeup.take() {
                wakeup.handle.abort();
            }

            let Some(waiter) = state.queue.pop_front() else {
                return;
            };
            state.remaining -= 1;
            state.in_flight = true;

            match waiter.send(BucketLease::new(Arc::clone(self))) {
                Ok(()) => return,
                Err(mut lease) => {
                    // The waiter went away; hand the slot to the next one
                    lease.disarm();
                    state.remaining += 1;
                    state.in_flight = false;
                }
            }
        }
    }

    fn schedule_wakeup(self: &Arc<Self>, state: &mut BucketState, delay: Duration) {
        let id = state.next_wakeup_id;
        state.next_wakeup_id = state.next_wakeup_id.wrapping_add(1);

        let bucket = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = bucket.lock();
            if state.wakeup.as_ref().is_some_and(|w| w.id == id) {
                state.wakeup = None;
                bucket.check(&mut state);
            }
        });
        state.wakeup = Some(Wakeup { id, handle });
    }

    fn release(self: &Arc<Self>, refund: bool) {
        let mut state = self.lock();
        state.in_flight = false;
        if refund && state.remaining < state.limit {
            state.remaining += 1;
        }
        self.check(&mut state);
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A place in a [`RouteBucket`]'s line
#[derive(Debug)]
#[must_use = "dropping a ticket gives up the place in line"]
pub(crate) struct BucketTicket {
    bucket: Arc<RouteBucket>,
    rx: oneshot::Receiver<BucketLease>,
}

impl BucketTicket {
    /// Wait until this ticket is admitted
    pub(crate) async fn lease(self) -> BucketLease {
        match self.rx.await {
            Ok(lease) => lease,
            // `check` only ever drops a sender after handing it a lease, and
            // the bucket outlives this call through the ticket
            Err(_) => unreachable!("route bucket {:p} dropped a waiter", self.bucket),
        }
    }
}

/// The execution slot of a [`RouteBucket`].
///
/// Whoever holds a lease must give it back on every exit path; dropping the
/// lease releases it, so early returns and panics are covered too.
#[derive(Debug)]
#[must_use = "dropping a lease immediately releases the bucket slot"]
pub(crate) struct BucketLease {
    bucket: Arc<RouteBucket>,
    armed: bool,
}

impl BucketLease {
    fn new(bucket: Arc<RouteBucket>) -> Self {
        Self {
            bucket,
            armed: true,
        }
    }

    /// Give the slot back so the next queued attempt can be admitted
    pub(crate) fn release(mut self) {
        self.release_once(false);
    }

    /// Give the slot back without having sent anything, returning the
    /// request it was counted as to the window
    pub(crate) fn refund(mut self) {
        self.release_once(true);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn release_once(&mut self, refund: bool) {
        if std::mem::replace(&mut self.armed, false) {
            self.bucket.release(refund);
        }
    }
}

impl Drop for BucketLease {
    fn drop(&mut self) {
        self.release_once(false);
    }
}
