use std::sync::Arc;
use tokio::sync::watch;

/// A counter that tasks can suspend on until it drains back to zero.
///
/// This is the drain-accounting primitive behind both shutdown counts: the
/// worker-level "all listeners closed" count and the per-listener
/// "no outstanding accepts" count. `add` before starting tracked work,
/// `done` when it finishes, `wait` until everything tracked has finished.
///
/// Cloning produces another handle to the same counter.
#[derive(Clone)]
#[derive(Debug)]
pub(crate) struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    pub fn add(&self, n: usize) {
        self.count.send_modify(|c| *c += n);
    }

    /// Counts one unit of tracked work as finished. Calling `done` more
    /// often than `add` accounted for is a bookkeeping bug and panics.
    pub fn done(&self) {
        self.count.send_modify(|c| {
            *c = c
                .checked_sub(1)
                .expect("drain counter dropped below zero");
        });
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Suspends until the counter reaches zero. Returns immediately if it
    /// already is zero.
    pub async fn wait(&self) {
        let mut count = self.count.subscribe();
        // Cannot fail: this handle keeps the sender alive for the whole
        // wait.
        let _ = count.wait_for(|c| *c == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new();
        timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("empty waitgroup should not block");
    }

    #[tokio::test]
    async fn wait_blocks_until_all_done() {
        let wg = WaitGroup::new();
        wg.add(2);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        wg.done();
        assert_eq!(wg.count(), 1);
        assert!(!waiter.is_finished());

        wg.done();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once the count drains")
            .unwrap();
    }

    #[tokio::test]
    async fn clones_share_one_counter() {
        let wg = WaitGroup::new();
        let other = wg.clone();
        wg.add(1);
        assert_eq!(other.count(), 1);
        other.done();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "drain counter dropped below zero")]
    async fn done_without_add_panics() {
        WaitGroup::new().done();
    }
}
