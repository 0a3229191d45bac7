use eyre::{eyre, WrapErr};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};

#[cfg(unix)]
use nix::fcntl::{fcntl, FcntlArg};
#[cfg(unix)]
use nix::sys::socket::{getsockopt, sockopt::AcceptConn};
#[cfg(unix)]
use std::os::fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use tracing::debug;

type Result<T> = eyre::Result<T>;

/// First descriptor position a worker probes for inherited listeners,
/// directly after the three standard streams.
#[cfg(unix)]
pub(crate) const INHERITED_FDS_START: RawFd = 3;

const LISTEN_BACKLOG: i32 = 128;

/// Resolves a `host:port` string to its first socket address.
pub(crate) fn resolve_addr(raw: &str) -> Result<SocketAddr> {
    raw.to_socket_addrs()
        .wrap_err_with(|| format!("cannot resolve listen address {raw:?}"))?
        .next()
        .ok_or_else(|| eyre!("listen address {raw:?} resolved to nothing"))
}

pub(crate) fn resolve_addrs(raw: &[String]) -> Result<Vec<SocketAddr>> {
    raw.iter().map(|addr| resolve_addr(addr)).collect()
}

/// Address equality for listener reuse across worker generations: the ports
/// must match, and either both hosts are the wildcard address or the IP
/// bytes are identical.
pub(crate) fn addr_matches(bound: SocketAddr, wanted: SocketAddr) -> bool {
    if bound.port() != wanted.port() {
        return false;
    }
    if bound.ip().is_unspecified() && wanted.ip().is_unspecified() {
        return true;
    }
    bound.ip() == wanted.ip()
}

/// Binds and listens on `addr`. `SO_REUSEADDR` is set so a restarted
/// supervisor can rebind an address still in TIME_WAIT; `SO_REUSEPORT` is
/// not, so a conflicting bind during a reload fails instead of
/// split-listening with a foreign process. The socket keeps close-on-exec;
/// worker handover goes through explicit duplicates.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .wrap_err_with(|| format!("cannot create socket for {addr}"))?;
    socket
        .set_reuse_address(true)
        .wrap_err_with(|| format!("cannot set SO_REUSEADDR for {addr}"))?;
    socket
        .bind(&addr.into())
        .wrap_err_with(|| format!("cannot bind {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .wrap_err_with(|| format!("cannot listen on {addr}"))?;
    Ok(socket)
}

/// The address a bound socket actually listens on.
pub(crate) fn socket_addr(socket: &Socket) -> Result<SocketAddr> {
    socket
        .local_addr()
        .wrap_err("cannot read listener address")?
        .as_socket()
        .ok_or_else(|| eyre!("listening socket has a non-inet address"))
}

/// Collects the TCP listeners a supervising master passed to this process.
///
/// Probes descriptor positions 3, 4, 5, … and stops at the first position
/// that is not an inet listening socket. There is no sentinel and no count;
/// the terminator is failure.
#[cfg(unix)]
pub(crate) fn inherited_listeners() -> Vec<std::net::TcpListener> {
    let mut found = Vec::new();
    for fd in INHERITED_FDS_START.. {
        match probe_listener(fd) {
            Some(listener) => found.push(listener),
            None => break,
        }
    }
    debug!(count = found.len(), "probed inherited listeners");
    found
}

#[cfg(unix)]
fn probe_listener(fd: RawFd) -> Option<std::net::TcpListener> {
    // SAFETY: the descriptor is only borrowed for the probe; ownership is
    // taken below once it is known to be a listening socket.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    if fcntl(borrowed, FcntlArg::F_GETFD).is_err() {
        return None;
    }
    if !getsockopt(&borrowed, AcceptConn).unwrap_or(false) {
        return None;
    }
    // SAFETY: an open listening socket inherited from the parent; nothing
    // else in this process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    if listener.local_addr().is_err() {
        // Listening, but not inet. Hand the descriptor back untouched.
        let _ = listener.into_raw_fd();
        return None;
    }
    Some(listener)
}

/// Duplicates a listener descriptor for handing to a spawned worker.
///
/// The duplicate carries close-on-exec and lands at or above the end of the
/// remap range, so the child-side [`remap_inherited_fds`] can never clobber
/// a source before copying it.
#[cfg(unix)]
pub(crate) fn dup_for_child(fd: RawFd, count: usize) -> Result<OwnedFd> {
    let above = INHERITED_FDS_START + count as RawFd;
    // SAFETY: borrowed only for the duplication call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let dup = fcntl(borrowed, FcntlArg::F_DUPFD_CLOEXEC(above))
        .wrap_err("cannot duplicate listener descriptor")?;
    // SAFETY: freshly created by F_DUPFD_CLOEXEC and owned by this handle.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Remaps duplicated listener descriptors onto positions 3, 4, 5, … in a
/// freshly forked child, preserving order.
///
/// Runs between fork and exec, so only async-signal-safe calls are allowed.
/// `dup2` clears close-on-exec on the target position, which is what lets
/// the remapped block survive the exec while the source duplicates do not.
#[cfg(unix)]
pub(crate) fn remap_inherited_fds(sources: &[RawFd]) -> std::io::Result<()> {
    for (i, &fd) in sources.iter().enumerate() {
        let target = INHERITED_FDS_START + i as RawFd;
        // SAFETY: plain descriptor call on descriptors the parent set up.
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
