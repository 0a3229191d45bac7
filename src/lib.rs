//! Zero-downtime TCP listener supervision.
//!
//! A long-lived daemon embeds this crate to keep its listening sockets
//! bound across restarts and to change the bound address set on demand
//! without dropping traffic. The mechanism is a master/worker split over
//! POSIX descriptor inheritance: the master process owns the listening
//! sockets and spawns one worker per generation; the worker inherits the
//! sockets at descriptor positions 3, 4, 5, … and serves them.
//!
//! On SIGHUP the master re-runs the application's address resolver, reuses
//! every already-bound address, binds the missing ones, spawns a fresh
//! worker over the updated set and asks the previous generation to drain:
//! stop accepting, finish outstanding connections, exit. Addresses present
//! in both generations are served continuously. On SIGINT or SIGTERM the
//! master escalates shutdown of all generations and exits.
//!
//! The application side is three calls:
//!
//! ```no_run
//! # async fn serve(listener: relisten::Listener) {}
//! # #[tokio::main] async fn main() {
//! let bound = relisten::listeners(|| vec!["127.0.0.1:7001".to_string()]).await;
//! for listener in bound {
//!     tokio::spawn(serve(listener));
//! }
//! relisten::register_exit_event(|| println!("draining done"));
//! relisten::wait().await;
//! # }
//! ```
//!
//! `listeners` never returns in the process that becomes the master; the
//! application code after it only runs in workers.

mod connection;
mod listener;
#[cfg(unix)]
mod master;
mod signals;
mod sockets;
mod sync;
mod worker;

pub use connection::Connection;
pub use listener::Listener;

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use worker::Worker;

static BOOTED: AtomicBool = AtomicBool::new(false);
static WORKER: OnceCell<Arc<Worker>> = OnceCell::new();

/// Boots the supervisor and returns the listeners to serve.
///
/// `resolver` returns the currently desired `host:port` bind list; the
/// master re-invokes it on every reload. Must be called from within a
/// tokio runtime, and at most once per process.
///
/// A process spawned with inherited listener descriptors becomes a worker:
/// the inherited sockets are wrapped into counting [`Listener`]s, the
/// worker's signal loop starts in the background and the wrapped listeners
/// are returned. A process without inherited descriptors becomes the
/// master and never returns from this call. On targets without
/// spawn-with-descriptors there is no master: the process binds the
/// resolved addresses itself and serves them as a lone worker, without
/// reload support.
///
/// # Panics
///
/// Panics when called a second time, or when the resolver returns an empty
/// list at boot. Failing to bind or wrap the boot listeners logs the error
/// and exits the process nonzero.
pub async fn listeners<R>(resolver: R) -> Vec<Listener>
where
    R: Fn() -> Vec<String> + Send + Sync + 'static,
{
    if BOOTED.swap(true, Ordering::SeqCst) {
        panic!("relisten::listeners may only be called once per process");
    }

    #[cfg(unix)]
    {
        let inherited = sockets::inherited_listeners();
        if inherited.is_empty() {
            info!("no inherited listeners, supervising as master");
            let signals = os_signals();
            master::Master::new(Box::new(resolver)).run(signals).await;
            unreachable!("the master exits the process from its signal loop");
        } else {
            info!(count = inherited.len(), "inherited listeners, serving as worker");
            boot_worker(inherited)
        }
    }

    #[cfg(not(unix))]
    {
        // Single-process mode: no descriptor inheritance, no master, no
        // reload.
        let addrs = resolver();
        if addrs.is_empty() {
            panic!("address resolver returned an empty bind list at boot");
        }
        match bind_local(&addrs) {
            Ok(bound) => boot_worker(bound),
            Err(err) => {
                error!("cannot bind boot listeners: {err:#}");
                std::process::exit(1);
            }
        }
    }
}

/// Blocks until the worker has completed shutdown: listeners closed, every
/// outstanding accept and connection settled, exit hooks run.
///
/// Returns immediately in a process that never became a worker.
pub async fn wait() {
    if let Some(worker) = WORKER.get() {
        worker.wait().await;
    }
}

/// Registers a hook to run once during worker shutdown, after the drain
/// accounting settles and before [`wait`] returns. Hooks run in
/// registration order. Does nothing in a process that never became a
/// worker.
pub fn register_exit_event<F>(hook: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Some(worker) = WORKER.get() {
        worker.register_exit_event(Box::new(hook));
    }
}

fn boot_worker(raw: Vec<std::net::TcpListener>) -> Vec<Listener> {
    let worker = match Worker::new(raw) {
        Ok(worker) => worker,
        Err(err) => {
            error!("cannot wrap boot listeners: {err}");
            std::process::exit(1);
        }
    };
    let signals = os_signals();
    tokio::spawn(Arc::clone(&worker).run(signals));

    let bound = worker.listeners();
    // The boot flag guarantees a single installer.
    let _ = WORKER.set(worker);
    bound
}

fn os_signals() -> signals::Signals {
    match signals::Signals::os() {
        Ok(signals) => signals,
        Err(err) => {
            error!("cannot install signal handlers: {err:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(unix))]
fn bind_local(addrs: &[String]) -> eyre::Result<Vec<std::net::TcpListener>> {
    let resolved = sockets::resolve_addrs(addrs)?;
    let mut bound = Vec::with_capacity(resolved.len());
    for addr in resolved {
        // A failure drops the partially bound set on the way out.
        bound.push(sockets::bind_listener(addr)?.into());
    }
    Ok(bound)
}
