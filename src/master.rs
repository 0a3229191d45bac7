use crate::signals::Signals;
use crate::sockets;
use eyre::{Result, WrapErr};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use socket2::Socket;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub(crate) type AddrResolver = Box<dyn Fn() -> Vec<String> + Send + Sync>;

type ListenerId = u64;
type WorkerId = u64;

/// Rounds of SIGTERM sent to lingering workers, one second apart, before
/// the final round switches to SIGKILL.
const ESCALATION_ROUNDS: u32 = 3;

struct MasterListener {
    socket: Socket,
    addr: SocketAddr,
    /// Live worker generations holding this listener. The listener is
    /// closed when the set empties.
    refs: HashSet<WorkerId>,
}

struct WorkerHandle {
    /// Set once the child has been spawned.
    pid: Option<Pid>,
    /// Master-side descriptor duplicates passed to this child; dropped,
    /// and thereby closed, when the child is detached.
    inherited: Vec<OwnedFd>,
}

#[derive(Default)]
struct State {
    listeners: HashMap<ListenerId, MasterListener>,
    workers: HashMap<WorkerId, WorkerHandle>,
    next_listener_id: ListenerId,
    next_worker_id: WorkerId,
}

/// A listener set prepared for one worker generation: the worker slot is
/// registered and references its listeners, the descriptor duplicates
/// exist, and all that is left is the spawn itself.
#[derive(Debug)]
struct Generation {
    worker: WorkerId,
    /// Raw descriptors of the duplicates, in address order; the owned side
    /// lives in the worker's handle.
    fds: Vec<RawFd>,
}

impl State {
    fn find_listener(&self, addr: SocketAddr) -> Option<ListenerId> {
        self.listeners
            .iter()
            .find(|(_, listener)| sockets::addr_matches(listener.addr, addr))
            .map(|(&id, _)| id)
    }

    fn insert_listener(&mut self, socket: Socket, addr: SocketAddr) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.insert(
            id,
            MasterListener {
                socket,
                addr,
                refs: HashSet::new(),
            },
        );
        id
    }

    fn drop_listeners(&mut self, ids: &[ListenerId]) {
        for id in ids {
            self.listeners.remove(id);
        }
    }

    /// Removes a worker generation: drops its reference from every
    /// listener, closes listeners nobody references anymore, and closes
    /// the master-side duplicates that were passed to this child.
    fn detach(&mut self, worker: WorkerId) {
        self.listeners.retain(|_, listener| {
            listener.refs.remove(&worker);
            if listener.refs.is_empty() {
                info!(addr = %listener.addr, "closing listener with no remaining workers");
                return false;
            }
            true
        });
        self.workers.remove(&worker);
    }
}

/// The supervising side: owns the listening sockets and the worker
/// generations, driven by a signal loop. Hangup reloads the address set and
/// swaps in a new generation; interrupt and terminate escalate shutdown of
/// every generation and then exit the process.
pub(crate) struct Master {
    resolver: AddrResolver,
    state: Arc<Mutex<State>>,
    tracker: TaskTracker,
}

impl Master {
    pub fn new(resolver: AddrResolver) -> Self {
        Self {
            resolver,
            state: Arc::new(Mutex::new(State::default())),
            tracker: TaskTracker::new(),
        }
    }

    /// Binds the boot address set, spawns the first worker generation and
    /// runs the signal loop. Does not return; the master exits the
    /// process.
    pub async fn run(self, signals: Signals) {
        let addrs = (self.resolver)();
        if addrs.is_empty() {
            panic!("address resolver returned an empty bind list at boot");
        }

        let resolved = match sockets::resolve_addrs(&addrs) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("cannot resolve boot addresses: {err:#}");
                std::process::exit(1);
            }
        };
        let generation = match self.prepare_generation(&resolved) {
            Ok(generation) => generation,
            Err(err) => {
                error!("cannot bind boot listeners: {err:#}");
                std::process::exit(1);
            }
        };
        if let Err(err) = self.launch_worker(generation) {
            error!("cannot spawn the initial worker: {err:#}");
            std::process::exit(1);
        }

        self.event_loop(signals).await
    }

    async fn event_loop(self, signals: Signals) {
        let Signals {
            mut hangup,
            mut terminate,
        } = signals;

        info!("master running");
        loop {
            tokio::select! {
                received = hangup.recv() => match received {
                    Some(()) => self.reload(),
                    None => break,
                },
                _ = terminate.recv() => break,
            }
        }

        info!("shutting down worker generations");
        self.escalate();
        self.tracker.close();
        self.tracker.wait().await;
        info!("all workers exited");
        std::process::exit(0);
    }

    /// Swaps in a new worker generation for the currently desired address
    /// set. Every failure mode leaves the previous generation serving:
    /// empty or unresolvable address sets are ignored, a failed bind closes
    /// only the listeners this attempt opened, and a failed spawn detaches
    /// the registered generation again.
    fn reload(&self) {
        info!("reload requested");

        let addrs = (self.resolver)();
        if addrs.is_empty() {
            warn!("address resolver returned an empty list, keeping the current generation");
            return;
        }
        let resolved = match sockets::resolve_addrs(&addrs) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("reload abandoned, cannot resolve addresses: {err:#}");
                return;
            }
        };
        let generation = match self.prepare_generation(&resolved) {
            Ok(generation) => generation,
            Err(err) => {
                error!("reload abandoned, cannot bind new listeners: {err:#}");
                return;
            }
        };

        let worker = generation.worker;
        if let Err(err) = self.launch_worker(generation) {
            error!("reload abandoned, cannot spawn a worker: {err:#}");
            return;
        }
        self.drain_other_workers(worker);
    }

    /// Computes the listener set for `resolved`, reusing live listeners
    /// with a matching address and binding the rest, then registers a
    /// worker slot referencing exactly that set.
    ///
    /// Lookup, bind and attach happen under one lock hold, so a detaching
    /// old worker cannot close a listener between its selection for reuse
    /// and the new generation's reference. A reused listener keeps its
    /// socket untouched; close-and-rebind never happens for an address that
    /// is present in both generations.
    fn prepare_generation(&self, resolved: &[SocketAddr]) -> Result<Generation> {
        let mut state = self.lock_state();

        let mut chosen = Vec::with_capacity(resolved.len());
        let mut opened = Vec::new();
        for &addr in resolved {
            if let Some(id) = state.find_listener(addr) {
                debug!(%addr, "reusing bound listener");
                chosen.push(id);
                continue;
            }
            let socket = match bind_new(addr) {
                Ok(socket) => socket,
                Err(err) => {
                    state.drop_listeners(&opened);
                    return Err(err);
                }
            };
            let bound = match sockets::socket_addr(&socket) {
                Ok(bound) => bound,
                Err(err) => {
                    state.drop_listeners(&opened);
                    return Err(err);
                }
            };
            info!(addr = %bound, "bound new listener");
            let id = state.insert_listener(socket, bound);
            chosen.push(id);
            opened.push(id);
        }

        let count = chosen.len();
        let mut inherited = Vec::with_capacity(count);
        let mut fds = Vec::with_capacity(count);
        for &id in &chosen {
            let Some(listener) = state.listeners.get(&id) else {
                continue;
            };
            match sockets::dup_for_child(listener.socket.as_raw_fd(), count) {
                Ok(dup) => {
                    fds.push(dup.as_raw_fd());
                    inherited.push(dup);
                }
                Err(err) => {
                    state.drop_listeners(&opened);
                    return Err(err);
                }
            }
        }

        let worker = state.next_worker_id;
        state.next_worker_id += 1;
        for &id in &chosen {
            if let Some(listener) = state.listeners.get_mut(&id) {
                listener.refs.insert(worker);
            }
        }
        state.workers.insert(
            worker,
            WorkerHandle {
                pid: None,
                inherited,
            },
        );

        Ok(Generation { worker, fds })
    }

    /// Spawns the prepared generation's child process and hands it to a
    /// tracking task; a failed spawn detaches the generation, closing
    /// exactly the listeners only it referenced.
    fn launch_worker(&self, generation: Generation) -> Result<()> {
        let Generation { worker, fds } = generation;

        let child = match spawn_child(fds) {
            Ok(child) => child,
            Err(err) => {
                self.lock_state().detach(worker);
                return Err(err);
            }
        };

        let pid = child
            .id()
            .and_then(|raw| i32::try_from(raw).ok())
            .map(Pid::from_raw);
        if let Some(handle) = self.lock_state().workers.get_mut(&worker) {
            handle.pid = pid;
        }
        info!(worker, ?pid, "worker spawned");

        let state = Arc::clone(&self.state);
        self.tracker.spawn(async move {
            let mut child = child;
            match child.wait().await {
                Ok(status) => info!(worker, %status, "worker exited"),
                Err(err) => error!(worker, "cannot wait for worker: {err}"),
            }
            lock_state(&state).detach(worker);
        });
        Ok(())
    }

    /// Asks every live worker generation except `current` to drain
    /// gracefully. Their exits are observed by their tracking tasks, never
    /// inline.
    fn drain_other_workers(&self, current: WorkerId) {
        let state = self.lock_state();
        for (&id, handle) in &state.workers {
            if id == current {
                continue;
            }
            let Some(pid) = handle.pid else { continue };
            info!(worker = id, %pid, "asking previous worker to drain");
            if let Err(err) = kill(pid, Signal::SIGHUP) {
                warn!(worker = id, "cannot signal worker: {err}");
            }
        }
    }

    /// Forces every remaining worker out in the background: three rounds of
    /// SIGTERM at one-second spacing, then SIGKILL for whatever is left.
    fn escalate(&self) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            for round in 0..=ESCALATION_ROUNDS {
                let signal = if round == ESCALATION_ROUNDS {
                    Signal::SIGKILL
                } else {
                    Signal::SIGTERM
                };
                {
                    let state = lock_state(&state);
                    for (&id, handle) in &state.workers {
                        let Some(pid) = handle.pid else { continue };
                        debug!(worker = id, %pid, ?signal, "escalating shutdown");
                        if let Err(err) = kill(pid, signal) {
                            debug!(worker = id, "cannot signal worker: {err}");
                        }
                    }
                }
                sleep(Duration::from_secs(1)).await;
            }
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bind_new(addr: SocketAddr) -> Result<Socket> {
    sockets::bind_listener(addr).wrap_err_with(|| format!("cannot open listener for {addr}"))
}

/// Spawns a worker process: the same executable with identical arguments,
/// stdio inherited, and the generation's listener duplicates remapped onto
/// descriptors 3, 4, 5, … before exec.
fn spawn_child(fds: Vec<RawFd>) -> Result<tokio::process::Child> {
    let mut argv = std::env::args_os();
    let arg0 = argv.next().unwrap_or_default();
    let program = std::env::current_exe().unwrap_or_else(|_| arg0.clone().into());

    let mut command = Command::new(program);
    command.arg0(&arg0);
    command.args(argv);
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
    // SAFETY: the remap performs only async-signal-safe descriptor calls.
    unsafe {
        command.pre_exec(move || sockets::remap_inherited_fds(&fds));
    }
    command.spawn().wrap_err("cannot spawn worker process")
}
