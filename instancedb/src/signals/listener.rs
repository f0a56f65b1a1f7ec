//! Process-wide interrupt dispatch.
//!
//! A LIFO stack of callbacks is serviced by a dedicated worker thread. The
//! installed signal handler only performs an atomic fd exchange and a single
//! `send(2)` into a wakeup channel, keeping the signal-context footprint
//! minimal; the worker thread is the only place handler-provided data is
//! observed, so callbacks may log, allocate, and do further I/O freely.

use std::os::fd::{AsFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::errors::{DbError, DbResult};

/// Signals observed by the interrupt listener. All others keep their
/// process-default disposition.
pub const LISTENED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM];

/// Sentinel: no wakeup channel is open.
const FD_CLOSED: i32 = -1;
/// Sentinel: the signal handler currently holds the fd.
const FD_IN_USE: i32 = -2;

/// Write end of the wakeup channel, shared between the signal handler and
/// the owning thread. Holds a live fd (>= 0) or one of the sentinels above.
static WAKEUP_FD: AtomicI32 = AtomicI32::new(FD_CLOSED);

type Callback = Box<dyn FnMut(Signal) + Send>;

struct Registry {
    state: Mutex<State>,
}

struct State {
    // Shared with the worker thread, which holds it for the duration of a
    // callback so pushes and pops cannot change the stack mid-call.
    callbacks: Arc<Mutex<Vec<Callback>>>,
    worker: Option<JoinHandle<()>>,
    prior_actions: Vec<(Signal, SigAction)>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        state: Mutex::new(State {
            callbacks: Arc::new(Mutex::new(Vec::new())),
            worker: None,
            prior_actions: Vec::new(),
        }),
    })
}

/// Reinstates the default disposition for `signum` and redelivers it.
///
/// Async-signal-safe: only calls `signal(2)` and `raise(2)`.
fn forward_to_default(signum: libc::c_int) {
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

/// The installed handler. Runs in signal context; the only operations are
/// atomic exchanges on [`WAKEUP_FD`] and a best-effort `send(2)`.
extern "C" fn wakeup_handler(signum: libc::c_int) {
    let fd = WAKEUP_FD.swap(FD_IN_USE, Ordering::AcqRel);
    if fd == FD_IN_USE {
        // Another in-flight handler holds the fd; this delivery coalesces.
        return;
    }
    if fd == FD_CLOSED {
        WAKEUP_FD.store(FD_CLOSED, Ordering::Release);
        forward_to_default(signum);
        return;
    }
    let payload = signum.to_ne_bytes();
    unsafe {
        // Best effort; a full channel drops the wakeup.
        libc::send(fd, payload.as_ptr().cast(), payload.len(), 0);
    }
    if WAKEUP_FD
        .compare_exchange(FD_IN_USE, fd, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // The owner marked the channel closed while we held the fd; the
        // close falls to us.
        unsafe {
            libc::close(fd);
        }
    }
}

/// Drains the wakeup channel, dispatching one signal per datagram to the
/// top of the callback stack. Exits on EOF (write end closed) or on an
/// unrecoverable read error.
fn worker_loop(read_end: OwnedFd, callbacks: Arc<Mutex<Vec<Callback>>>) {
    let mut buf = [0u8; size_of::<libc::c_int>()];
    loop {
        match nix::unistd::read(read_end.as_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) if n == buf.len() => {
                let signum = libc::c_int::from_ne_bytes(buf);
                let Ok(sig) = Signal::try_from(signum) else {
                    continue;
                };
                tracing::debug!(signal = %sig, "interrupt received");
                let mut callbacks = callbacks.lock().unwrap_or_else(PoisonError::into_inner);
                match callbacks.last_mut() {
                    Some(callback) => callback(sig),
                    // The stack drained after the signal was queued; hand it
                    // back to the default disposition.
                    None => forward_to_default(signum),
                }
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                tracing::warn!(%errno, "wakeup channel read failed, stopping listener worker");
                break;
            }
        }
    }
}

/// Handle for a registered interrupt listener. Dropping it (or calling
/// [`pop`](InterruptListenerHandle::pop)) unregisters the listener; once the
/// drop returns, the callback from this registration can no longer run.
///
/// Handles must be released in LIFO order; an out-of-order pop panics.
pub struct InterruptListenerHandle {
    index: usize,
    active: bool,
}

impl InterruptListenerHandle {
    /// Unregister this listener. Equivalent to dropping the handle.
    pub fn pop(mut self) {
        self.deactivate();
    }

    fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        pop_index(self.index);
    }
}

impl Drop for InterruptListenerHandle {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Registers `callback` on top of the process-wide listener stack and
/// returns a handle that unregisters it on drop.
///
/// While at least one listener is registered, SIGINT, SIGHUP and SIGTERM
/// are routed to the top-of-stack callback on a dedicated worker thread
/// instead of their default dispositions. The first push installs the
/// handler, opens the wakeup channel and starts the worker; the pop that
/// empties the stack restores the defaults and joins the worker.
pub fn push_interrupt_listener(
    callback: impl FnMut(Signal) + Send + 'static,
) -> DbResult<InterruptListenerHandle> {
    let mut state = registry()
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if state.worker.is_none() {
        activate(&mut state)?;
    }
    let mut callbacks = state
        .callbacks
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let index = callbacks.len();
    callbacks.push(Box::new(callback));
    tracing::debug!(index, "interrupt listener registered");
    Ok(InterruptListenerHandle {
        index,
        active: true,
    })
}

/// Idle -> Active: open the wakeup channel, start the worker, install the
/// handler for every listened signal.
fn activate(state: &mut State) -> DbResult<()> {
    let (read_end, write_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|errno| DbError::Io(format!("failed to open wakeup channel: {errno}")))?;

    let callbacks = Arc::clone(&state.callbacks);
    let worker = std::thread::Builder::new()
        .name("interrupt-listener".into())
        .spawn(move || worker_loop(read_end, callbacks))
        .map_err(|e| DbError::Io(format!("failed to spawn listener worker: {e}")))?;

    WAKEUP_FD.store(write_end.into_raw_fd(), Ordering::Release);

    let action = SigAction::new(
        SigHandler::Handler(wakeup_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in LISTENED_SIGNALS {
        let prior = unsafe { signal::sigaction(sig, &action) }
            .unwrap_or_else(|errno| panic!("sigaction({sig}) failed: {errno}"));
        state.prior_actions.push((sig, prior));
    }
    state.worker = Some(worker);
    Ok(())
}

fn pop_index(index: usize) {
    // Poison tolerant: the LIFO assertion below unwinds with both mutexes
    // held, and the remaining handles still pop through here on their drops.
    let mut state = registry()
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    {
        let mut callbacks = state
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert_eq!(
            index + 1,
            callbacks.len(),
            "interrupt listener popped out of LIFO order (index {index}, stack size {})",
            callbacks.len()
        );
        callbacks.pop();
        tracing::debug!(index, "interrupt listener unregistered");
        if !callbacks.is_empty() {
            return;
        }
    }
    deactivate(&mut state);
}

/// Active -> Idle: restore the default dispositions, close the wakeup
/// channel and join the worker.
fn deactivate(state: &mut State) {
    for (sig, prior) in state.prior_actions.drain(..) {
        unsafe { signal::sigaction(sig, &prior) }
            .unwrap_or_else(|errno| panic!("sigaction({sig}) restore failed: {errno}"));
    }
    let fd = WAKEUP_FD.swap(FD_CLOSED, Ordering::AcqRel);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
    // fd == FD_IN_USE: a handler invocation holds the fd and will close it
    // when it observes the CLOSED sentinel.
    if let Some(worker) = state.worker.take() {
        // The worker sees EOF once the write end is gone.
        let _ = worker.join();
    }
}
