use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use tokio_util::sync::CancellationToken;

/// Latch counting in-flight request handlers.
///
/// The reader task holds the initial count; every spawned handler holds a
/// [`RequestGuard`] for its lifetime. When the reader shuts down it releases
/// its own count and waits for the latch, guaranteeing that no handler
/// outlives the connection.
#[derive(Debug, Default)]
pub(crate) struct RequestTracker {
    outstanding: AtomicI64,
    drained: CancellationToken,
}

/// RAII share of the tracker's count; dropping it releases the count and
/// trips the latch when it was the last one.
#[derive(Debug)]
pub(crate) struct RequestGuard(Arc<RequestTracker>);

impl RequestTracker {
    /// Creates a tracker whose initial count belongs to the reader itself.
    pub(crate) fn start() -> (Arc<Self>, RequestGuard) {
        let tracker = Arc::new(Self::default());
        let guard = tracker.track();
        (tracker, guard)
    }

    /// Claims one count for a spawned handler.
    pub(crate) fn track(self: &Arc<Self>) -> RequestGuard {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        RequestGuard(Arc::clone(self))
    }

    /// Resolves once every claimed count has been released.
    pub(crate) async fn drained(&self) {
        self.drained.cancelled().await;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drains_after_last_guard() {
        let (tracker, reader_guard) = RequestTracker::start();

        let handler_guard = tracker.track();
        let handle = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
                drop(handler_guard);
                tracker.drained().await;
            })
        };

        drop(reader_guard);
        tracker.drained().await;
        handle.await.unwrap();
        assert_eq!(tracker.outstanding.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_reader_only_drains_immediately() {
        let (tracker, reader_guard) = RequestTracker::start();
        drop(reader_guard);
        tracker.drained().await;
    }
}
