use crate::listener::Listener;
use crate::signals::Signals;
use crate::sync::WaitGroup;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type ExitHook = Box<dyn FnOnce() + Send + 'static>;

/// The serving side of the supervisor: wraps the inherited listeners and
/// runs the dual-phase shutdown state machine.
///
/// Shutdown has two phases racing on a once-only latch. The hangup class
/// drains gracefully: stop accepting, wait for every outstanding accept and
/// live connection, then trip the latch. The terminate class aborts: stop
/// accepting and trip the latch at once. Either way, exit hooks run after
/// the latch and [`Worker::wait`] returns only after both the drain
/// accounting and the hooks have settled.
pub(crate) struct Worker {
    listeners: Vec<Listener>,
    listener_close: WaitGroup,
    exit_hooks: Mutex<Vec<ExitHook>>,
    done: CancellationToken,
    shutdown: CancellationToken,
}

impl Worker {
    /// Wraps `raw` into counting listeners owned by this worker, priming
    /// the close count with one unit per listener.
    pub fn new(raw: Vec<std::net::TcpListener>) -> io::Result<Arc<Self>> {
        let listener_close = WaitGroup::new();
        listener_close.add(raw.len());
        let listeners = raw
            .into_iter()
            .map(|listener| Listener::wrap(listener, listener_close.clone()))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Arc::new(Self {
            listeners,
            listener_close,
            exit_hooks: Mutex::new(Vec::new()),
            done: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.listeners.clone()
    }

    /// Appends a hook to run once during shutdown, after the done latch and
    /// before [`Worker::wait`] returns. Hooks registered after the latch
    /// has tripped are never invoked.
    pub fn register_exit_event(&self, hook: ExitHook) {
        self.lock_hooks().push(hook);
    }

    /// Runs the shutdown signal loop to completion.
    ///
    /// Two watchers race on the done latch; whichever loses the race
    /// observes the latch and stands down without side effects. Closing
    /// listeners and cancelling the latch are both idempotent, so a forced
    /// signal arriving during an in-progress graceful drain trips the latch
    /// without further waiting.
    pub async fn run(self: Arc<Self>, signals: Signals) {
        let Signals {
            mut hangup,
            mut terminate,
        } = signals;

        let graceful = {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = worker.done.cancelled() => {}
                    received = hangup.recv() => {
                        if received.is_some() {
                            info!("hangup received, draining worker");
                            worker.close_all_listeners();
                            worker.wait_drained().await;
                            worker.done.cancel();
                        }
                    }
                }
            })
        };
        let forced = {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = worker.done.cancelled() => {}
                    received = terminate.recv() => {
                        if received.is_some() {
                            info!("terminate received, aborting worker");
                            worker.close_all_listeners();
                            worker.done.cancel();
                        }
                    }
                }
            })
        };

        self.done.cancelled().await;

        let hooks: Vec<ExitHook> = std::mem::take(&mut *self.lock_hooks());
        debug!(count = hooks.len(), "running exit hooks");
        for hook in hooks {
            hook();
        }
        self.shutdown.cancel();

        // The losing watcher is abandoned: it either finishes through the
        // latch or is still in a drain wait that no longer matters.
        graceful.abort();
        forced.abort();
    }

    /// Blocks until drain accounting is satisfied and the exit hooks have
    /// run.
    pub async fn wait(&self) {
        self.wait_drained().await;
        self.shutdown.cancelled().await;
    }

    fn close_all_listeners(&self) {
        for listener in &self.listeners {
            listener.close();
        }
    }

    /// Drain is complete once every listener has been closed and every
    /// outstanding accept has settled.
    async fn wait_drained(&self) {
        self.listener_close.wait().await;
        for listener in &self.listeners {
            listener.wait_outstanding().await;
        }
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<ExitHook>> {
        self.exit_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalSender, Signals};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn bind_raw(count: usize) -> Vec<std::net::TcpListener> {
        (0..count)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect()
    }

    fn booted(count: usize) -> (Arc<Worker>, SignalSender, JoinHandle<()>) {
        let worker = Worker::new(bind_raw(count)).unwrap();
        let (signals, sender) = Signals::manual();
        let running = tokio::spawn(Arc::clone(&worker).run(signals));
        (worker, sender, running)
    }

    #[tokio::test]
    async fn graceful_shutdown_without_connections_completes() {
        let (worker, sender, running) = booted(2);

        sender.hangup();
        timeout(Duration::from_secs(2), worker.wait())
            .await
            .expect("drain with no connections should complete");
        running.await.unwrap();
    }

    #[tokio::test]
    async fn graceful_drain_waits_for_a_live_connection() {
        let (worker, sender, running) = booted(1);
        let listener = worker.listeners().remove(0);
        let addr = listener.addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (conn, _) = listener.accept().await.unwrap();

        sender.hangup();

        // New accepts must fail once the drain has closed the listener.
        timeout(Duration::from_secs(1), async {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("accepts should start failing");

        let wait = worker.wait();
        tokio::pin!(wait);
        assert!(
            timeout(Duration::from_millis(200), &mut wait).await.is_err(),
            "wait must not return while a connection is open"
        );

        drop(conn);
        timeout(Duration::from_secs(2), &mut wait)
            .await
            .expect("drain should complete once the connection closes");
        running.await.unwrap();
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forced_shutdown_does_not_wait_for_connections() {
        let (worker, sender, running) = booted(1);
        let listener = worker.listeners().remove(0);
        let addr = listener.addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (conn, _) = listener.accept().await.unwrap();

        let hook_ran = Arc::new(AtomicBool::new(false));
        {
            let hook_ran = Arc::clone(&hook_ran);
            worker.register_exit_event(Box::new(move || {
                hook_ran.store(true, Ordering::SeqCst);
            }));
        }

        sender.terminate();
        timeout(Duration::from_secs(2), running)
            .await
            .expect("forced shutdown must not wait for the open connection")
            .unwrap();
        assert!(hook_ran.load(Ordering::SeqCst));

        drop(conn);
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exit_hooks_run_in_registration_order_before_wait_returns() {
        let (worker, sender, running) = booted(1);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            worker.register_exit_event(Box::new(move || {
                order.lock().unwrap().push(i);
            }));
        }

        sender.hangup();
        timeout(Duration::from_secs(2), worker.wait())
            .await
            .expect("drain should complete");

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        running.await.unwrap();
    }

    #[tokio::test]
    async fn a_second_signal_after_the_latch_is_ignored() {
        let (worker, sender, running) = booted(1);

        sender.hangup();
        timeout(Duration::from_secs(2), worker.wait())
            .await
            .expect("drain should complete");

        // Both watchers are gone; later signals land in closed channels.
        sender.terminate();
        sender.hangup();
        running.await.unwrap();
    }
}
