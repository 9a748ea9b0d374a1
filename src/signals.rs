// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-wide signal multiplexer.
//!
//! One OS-level listener fans interrupt/terminate out to every registered
//! handler, in registration order. Child-process wrappers and the reloader
//! register here instead of installing their own OS handlers, so a single
//! Ctrl+C reaches all of them exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use tokio::sync::Notify;
use tracing::debug;

/// Host signals the multiplexer forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Ctrl+Break (Windows only)
    Break,
}

type Handler = Arc<dyn Fn(Signal) + Send + Sync>;

/// Token returned by [`register`], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static HANDLERS: Mutex<Vec<(HandlerId, Handler)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static SHIELD: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NOTIFY: LazyLock<Notify> = LazyLock::new(Notify::new);

/// Append a handler. Handlers run synchronously on the dispatching task and
/// must not block.
pub fn register<F>(handler: F) -> HandlerId
where
    F: Fn(Signal) + Send + Sync + 'static,
{
    let id = HandlerId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    lock_handlers().push((id, Arc::new(handler)));
    id
}

/// Drop the first handler registered under `id`. Unknown ids are ignored.
pub fn remove(id: HandlerId) {
    let mut handlers = lock_handlers();
    if let Some(pos) = handlers.iter().position(|(h, _)| *h == id) {
        handlers.remove(pos);
    }
}

/// Number of currently registered handlers.
pub fn handler_count() -> usize {
    lock_handlers().len()
}

/// Deliver `signal` to every registered handler, unless a [`shield`] is held.
pub fn dispatch(signal: Signal) {
    if SHIELD.load(Ordering::SeqCst) > 0 {
        debug!(?signal, "signal suppressed by shield");
        return;
    }

    INTERRUPTED.store(true, Ordering::SeqCst);
    INTERRUPT_NOTIFY.notify_waiters();

    // Snapshot so handlers may register/remove without deadlocking.
    let snapshot: Vec<Handler> = lock_handlers().iter().map(|(_, h)| h.clone()).collect();
    debug!(?signal, handlers = snapshot.len(), "dispatching signal");
    for handler in snapshot {
        handler(signal);
    }
}

/// Whether any signal has been dispatched during this process lifetime.
pub fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Resolves once a signal has been dispatched.
pub async fn interrupted() {
    loop {
        let notified = INTERRUPT_NOTIFY.notified();
        if was_interrupted() {
            return;
        }
        notified.await;
    }
}

/// RAII guard returned by [`shield`].
#[must_use = "the shield is released when the guard is dropped"]
pub struct ShieldGuard(());

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        SHIELD.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Suppress dispatch until the returned guard is dropped. Guards nest.
pub fn shield() -> ShieldGuard {
    SHIELD.fetch_add(1, Ordering::SeqCst);
    ShieldGuard(())
}

/// Install the OS listeners. Must be called from the main thread inside a
/// Tokio runtime; elsewhere it is a no-op returning `false`.
pub fn install() -> std::io::Result<bool> {
    if std::thread::current().name() != Some("main") {
        return Ok(false);
    }
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(true);
    }
    install_os_listeners()?;
    Ok(true)
}

#[cfg(unix)]
fn install_os_listeners() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = interrupt.recv() => dispatch(Signal::Interrupt),
                Some(()) = terminate.recv() => dispatch(Signal::Terminate),
                else => break,
            }
        }
    });
    Ok(())
}

// Tokio registers console control handlers synchronously here; there is no
// async signal registration to fall back from.
#[cfg(windows)]
fn install_os_listeners() -> std::io::Result<()> {
    use tokio::signal::windows::{ctrl_break, ctrl_c};

    let mut interrupt = ctrl_c()?;
    let mut brk = ctrl_break()?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = interrupt.recv() => dispatch(Signal::Interrupt),
                Some(()) = brk.recv() => dispatch(Signal::Break),
                else => break,
            }
        }
    });
    Ok(())
}

fn lock_handlers() -> std::sync::MutexGuard<'static, Vec<(HandlerId, Handler)>> {
    HANDLERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
