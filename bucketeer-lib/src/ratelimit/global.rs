use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::bucket::{BucketLease, BucketTicket, RouteBucket};

/// Shortest lockout ever scheduled, so a zero delay still clears on a timer
const MIN_LOCKOUT: Duration = Duration::from_millis(1);

/// The cross-route lockout the server imposes with a global rate limit.
///
/// While locked, authenticated attempts park in a shared FIFO (priority
/// waiters at its front). When the lockout expires they join their route
/// buckets in that order, before any newcomer can.
#[derive(Debug, Default)]
pub(crate) struct GlobalLock {
    state: Mutex<GlobalState>,
}

#[derive(Debug, Default)]
struct GlobalState {
    until: Option<Instant>,
    waiters: VecDeque<Parked>,
}

#[derive(Debug)]
struct Parked {
    bucket: Arc<RouteBucket>,
    priority: bool,
    tx: oneshot::Sender<BucketTicket>,
}

/// An attempt's way into its route bucket, possibly through the global line
#[derive(Debug)]
pub(crate) enum Admission {
    /// Already in the bucket's line
    Queued(BucketTicket),
    /// Waiting for the global lockout to clear
    Parked {
        bucket: Arc<RouteBucket>,
        priority: bool,
        rx: oneshot::Receiver<BucketTicket>,
    },
}

impl Admission {
    /// Wait for the bucket's execution slot
    pub(crate) async fn lease(self) -> BucketLease {
        match self {
            Self::Queued(ticket) => ticket.lease().await,
            Self::Parked {
                bucket,
                priority,
                rx,
            } => match rx.await {
                Ok(ticket) => ticket.lease().await,
                // The lock went away with its waiters, so nothing holds us back
                Err(_) => bucket.acquire(priority).await,
            },
        }
    }
}

impl GlobalLock {
    pub(crate) fn is_locked(&self) -> bool {
        self.lock().until.is_some()
    }

    /// Lock every authenticated route for `delay`. Overlapping lockouts
    /// extend each other; the lock clears when the latest one expires.
    pub(crate) fn lock_for(self: &Arc<Self>, delay: Duration) {
        let until = Instant::now() + delay.max(MIN_LOCKOUT);
        {
            let mut state = self.lock();
            if state.until.is_some_and(|current| current >= until) {
                return;
            }
            state.until = Some(until);
        }

        let lock = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            lock.unlock_if_expired(until);
        });
    }

    /// Line up for `bucket`: in the bucket itself when unlocked, otherwise
    /// in the global line.
    pub(crate) fn admit(&self, bucket: &Arc<RouteBucket>, priority: bool) -> Admission {
        let mut state = self.lock();
        if state.until.is_none() {
            return Admission::Queued(bucket.enqueue(priority));
        }
        Self::park(&mut state, bucket, priority)
    }

    /// Move the holder of `lease` to the global line if a lockout started
    /// while it waited in its bucket. The lease is refunded only once the
    /// attempt is parked, so the bucket's next waiter lines up behind it.
    pub(crate) fn repark(
        &self,
        bucket: &Arc<RouteBucket>,
        priority: bool,
        lease: BucketLease,
    ) -> Result<Admission, BucketLease> {
        let admission = {
            let mut state = self.lock();
            if state.until.is_none() {
                return Err(lease);
            }
            Self::park(&mut state, bucket, priority)
        };
        lease.refund();
        Ok(admission)
    }

    fn park(state: &mut GlobalState, bucket: &Arc<RouteBucket>, priority: bool) -> Admission {
        let (tx, rx) = oneshot::channel();
        let parked = Parked {
            bucket: Arc::clone(bucket),
            priority,
            tx,
        };
        if priority {
            state.waiters.push_front(parked);
        } else {
            state.waiters.push_back(parked);
        }
        Admission::Parked {
            bucket: Arc::clone(bucket),
            priority,
            rx,
        }
    }

    fn unlock_if_expired(&self, until: Instant) {
        let mut state = self.lock();
        // A later lockout superseded the one this timer was armed for
        if state.until != Some(until) {
            return;
        }
        state.until = None;

        // Join the buckets while still holding the lock, so no newcomer can
        // get ahead of the parked line
        let tickets: Vec<_> = state
            .waiters
            .drain(..)
            .map(|parked| (parked.bucket.enqueue(parked.priority), parked.tx))
            .collect();
        drop(state);

        for (ticket, tx) in tickets {
            // A gone waiter drops its ticket, which hands the slot on
            let _ = tx.send(ticket);
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ratelimit::{LatencyRef, RateLimitConfig};

    fn bucket() -> Arc<RouteBucket> {
        Arc::new(RouteBucket::new(Arc::new(LatencyRef::new(
            &RateLimitConfig::default(),
        ))))
    }

    #[tokio::test]
    async fn test_unlocked_admits_immediately() {
        let lock = GlobalLock::default();
        assert!(!lock.is_locked());
        let admission = lock.admit(&bucket(), false);
        assert!(matches!(admission, Admission::Queued(_)));
        tokio::time::timeout(Duration::from_millis(10), admission.lease())
            .await
            .expect("unlocked global lock should not block");
    }

    #[tokio::test]
    async fn test_waiters_are_held_for_the_delay() {
        let lock = Arc::new(GlobalLock::default());
        let start = Instant::now();
        lock.lock_for(Duration::from_millis(100));
        assert!(lock.is_locked());

        let admission = lock.admit(&bucket(), false);
        assert!(matches!(admission, Admission::Parked { .. }));
        drop(admission.lease().await);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_priority_waiters_are_released_first() {
        let lock = Arc::new(GlobalLock::default());
        let bucket = bucket();
        lock.lock_for(Duration::from_millis(50));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for (name, priority) in [("first", false), ("second", false), ("urgent", true)] {
            let admission = lock.admit(&bucket, priority);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = admission.lease().await;
                order.lock().unwrap().push(name);
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["urgent", "first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_released_waiters_keep_their_order_across_threads() {
        let lock = Arc::new(GlobalLock::default());
        let bucket = bucket();
        lock.lock_for(Duration::from_millis(50));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..30 {
            let admission = lock.admit(&bucket, false);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = admission.lease().await;
                order.lock().unwrap().push(i);
                tokio::task::yield_now().await;
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_repark_only_while_locked() {
        let lock = Arc::new(GlobalLock::default());
        let bucket = bucket();

        let lease = bucket.acquire(false).await;
        let lease = lock
            .repark(&bucket, false, lease)
            .expect_err("nothing to wait for while unlocked");

        lock.lock_for(Duration::from_millis(30));
        let admission = lock
            .repark(&bucket, false, lease)
            .expect("a lockout parks the holder");
        // The slot was given back
        assert_eq!(bucket.snapshot().remaining, 1);

        let start = Instant::now();
        drop(admission.lease().await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_later_lockout_extends_earlier_one() {
        let lock = Arc::new(GlobalLock::default());
        let start = Instant::now();
        lock.lock_for(Duration::from_millis(20));
        lock.lock_for(Duration::from_millis(120));

        drop(lock.admit(&bucket(), false).lease().await);
        assert!(start.elapsed() >= Duration::from_millis(120));
    }
}
