use crate::sync::WaitGroup;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Releases one unit of a listener's outstanding-accept count, exactly
/// once, no matter how many times release is attempted and from how many
/// threads.
#[derive(Debug)]
pub(crate) struct AcceptGuard {
    outstanding: WaitGroup,
    released: AtomicBool,
}

impl AcceptGuard {
    pub(crate) fn new(outstanding: WaitGroup) -> Self {
        Self {
            outstanding,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.outstanding.done();
        }
    }
}

impl Drop for AcceptGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An accepted connection whose lifetime feeds its listener's drain
/// accounting.
///
/// The listener's outstanding count was raised before the accept completed
/// and is lowered exactly once per connection, on the first of [`close`]
/// and drop. A connection reads and writes like the [`tokio::net::TcpStream`]
/// it wraps.
///
/// [`close`]: Connection::close
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    guard: AcceptGuard,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, guard: AcceptGuard) -> Self {
        Self {
            stream,
            peer,
            guard,
        }
    }

    /// The remote address this connection was accepted from.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Shuts the connection down and settles its accept accounting.
    ///
    /// Repeat calls keep delegating to the socket shutdown; the accounting
    /// side fires only on the first call.
    pub async fn close(&mut self) -> io::Result<()> {
        self.guard.release();
        self.stream.shutdown().await
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn release_fires_once() {
        let outstanding = WaitGroup::new();
        outstanding.add(1);

        let guard = AcceptGuard::new(outstanding.clone());
        guard.release();
        guard.release();
        guard.release();

        assert_eq!(outstanding.count(), 0);
    }

    #[test]
    fn drop_after_release_does_not_double_count() {
        let outstanding = WaitGroup::new();
        outstanding.add(1);

        let guard = AcceptGuard::new(outstanding.clone());
        guard.release();
        drop(guard);

        assert_eq!(outstanding.count(), 0);
    }

    #[tokio::test]
    async fn concurrent_releases_settle_to_a_single_decrement() {
        let outstanding = WaitGroup::new();
        outstanding.add(1);

        let guard = Arc::new(AcceptGuard::new(outstanding.clone()));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let guard = Arc::clone(&guard);
            tasks.push(tokio::spawn(async move { guard.release() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // A second decrement would panic inside the waitgroup.
        assert_eq!(outstanding.count(), 0);
    }

    #[tokio::test]
    async fn closing_a_connection_twice_counts_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });

        let (stream, peer) = listener.accept().await.unwrap();
        let outstanding = WaitGroup::new();
        outstanding.add(1);
        let mut conn = Connection::new(stream, peer, AcceptGuard::new(outstanding.clone()));

        conn.close().await.unwrap();
        let _ = conn.close().await;
        assert_eq!(outstanding.count(), 0);

        drop(conn);
        assert_eq!(outstanding.count(), 0);
        client.await.unwrap().unwrap();
    }
}
