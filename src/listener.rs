use crate::connection::{AcceptGuard, Connection};
use crate::sync::WaitGroup;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener as TokioTcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A counting TCP listener handed to the application by
/// [`listeners`](crate::listeners).
///
/// Accepts feed the owning worker's drain accounting: the outstanding count
/// covers every accept in flight and every accepted [`Connection`] not yet
/// closed, so a graceful shutdown knows when the listener has truly
/// drained. Handles are cheap clones over shared state.
#[derive(Clone)]
pub struct Listener {
    shared: Arc<Shared>,
}

struct Shared {
    addr: SocketAddr,
    /// The accepting socket. Taken out on close; in-flight accepts hold a
    /// temporary reference, so the descriptor dies with the last of them.
    socket: Mutex<Option<Arc<TokioTcpListener>>>,
    closed: CancellationToken,
    outstanding: WaitGroup,
    /// Back-reference to the owning worker's listener-close count.
    worker_close: WaitGroup,
    close_once: AtomicBool,
}

impl Shared {
    fn socket_handle(&self) -> Option<Arc<TokioTcpListener>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Listener {
    /// Wraps an inherited (or locally bound) listener, tying it into the
    /// owning worker's close accounting.
    pub(crate) fn wrap(
        listener: std::net::TcpListener,
        worker_close: WaitGroup,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = TokioTcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;
        Ok(Self {
            shared: Arc::new(Shared {
                addr,
                socket: Mutex::new(Some(Arc::new(listener))),
                closed: CancellationToken::new(),
                outstanding: WaitGroup::new(),
                worker_close,
                close_once: AtomicBool::new(false),
            }),
        })
    }

    /// The address this listener is bound to. Stable for its whole life.
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Accepts the next inbound connection.
    ///
    /// The outstanding count is raised before the underlying accept runs,
    /// so the window between a successful accept and the application
    /// observing the [`Connection`] is always covered. An error from the
    /// underlying accept undoes the increment and is handed through
    /// unchanged; accepting on a closed listener fails promptly.
    pub async fn accept(&self) -> io::Result<(Connection, SocketAddr)> {
        let shared = &self.shared;
        shared.outstanding.add(1);
        let guard = AcceptGuard::new(shared.outstanding.clone());

        let socket = match shared.socket_handle() {
            Some(socket) => socket,
            None => {
                guard.release();
                return Err(closed_error());
            }
        };

        let accepted = tokio::select! {
            _ = shared.closed.cancelled() => {
                guard.release();
                return Err(closed_error());
            }
            accepted = socket.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => Ok((Connection::new(stream, peer, guard), peer)),
            Err(err) => {
                guard.release();
                Err(err)
            }
        }
    }

    /// Stops accepting and releases this listener's socket.
    ///
    /// The first close counts toward the owning worker's drain accounting;
    /// later calls only repeat the socket teardown, which has nothing left
    /// to do.
    pub fn close(&self) {
        let shared = &self.shared;
        if !shared.close_once.swap(true, Ordering::AcqRel) {
            debug!(addr = %shared.addr, "listener closed");
            shared.worker_close.done();
        }
        shared.closed.cancel();
        shared
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Suspends until every accept this listener handed out has settled.
    pub(crate) async fn wait_outstanding(&self) {
        self.shared.outstanding.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn outstanding_count(&self) -> usize {
        self.shared.outstanding.count()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn wrapped() -> (Listener, WaitGroup) {
        let worker_close = WaitGroup::new();
        worker_close.add(1);
        let raw = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listener = Listener::wrap(raw, worker_close.clone()).unwrap();
        (listener, worker_close)
    }

    #[tokio::test]
    async fn accept_covers_the_connection_until_it_closes() {
        let (listener, _) = wrapped();
        let addr = listener.addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), peer);
        assert_eq!(listener.outstanding_count(), 1);

        conn.close().await.unwrap();
        assert_eq!(listener.outstanding_count(), 0);
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn accept_on_a_closed_listener_fails() {
        let (listener, _) = wrapped();
        listener.close();

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(listener.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_accept() {
        let (listener, _) = wrapped();

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;

        listener.close();
        let err = timeout(Duration::from_secs(1), pending)
            .await
            .expect("close should unblock the accept")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(listener.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn close_counts_toward_the_worker_exactly_once() {
        let (listener, worker_close) = wrapped();
        assert_eq!(worker_close.count(), 1);

        listener.close();
        listener.close();
        listener.clone().close();

        assert_eq!(worker_close.count(), 0);
    }

    #[tokio::test]
    async fn connections_outlive_their_closed_listener() {
        let (listener, worker_close) = wrapped();
        let addr = listener.addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (conn, _) = listener.accept().await.unwrap();

        listener.close();
        assert_eq!(worker_close.count(), 0);
        assert_eq!(listener.outstanding_count(), 1);

        drop(conn);
        timeout(Duration::from_secs(1), listener.wait_outstanding())
            .await
            .expect("drain should settle once the connection is gone");
        client.await.unwrap().unwrap();
    }
}
