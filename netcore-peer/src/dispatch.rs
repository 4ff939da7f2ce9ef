//! Single dispatch point from both listener threads into application code.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error};
use netcore_core::Inbound;

/// Application callback. Runs on a listener thread; for a synced request it may call
/// `Inbound::set_return_value` before returning.
///
/// Handlers must not block on a synced call of their own: the reliable listener thread is
/// the one that would read the response.
pub type Handler = dyn Fn(&mut Inbound) + Send + Sync + 'static;

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

#[derive(Default)]
pub struct Dispatcher {
    handler: RwLock<Option<Arc<Handler>>>,
    /// Replacement registered from inside a handler, installed once it returns.
    deferred: Mutex<Option<Arc<Handler>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the handler. From inside a handler the write lock would wait on this thread's
    /// own read guard, so the swap is deferred until the invocation returns.
    pub fn set_handler(&self, handler: Arc<Handler>) {
        if IN_DISPATCH.with(|f| f.get()) {
            *self.deferred.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
            return;
        }
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Hand `inbound` to the handler. Returns false if nothing handled it (no handler,
    /// closed, or the handler panicked).
    pub fn dispatch(&self, inbound: &mut Inbound) -> bool {
        let guard = self.handler.read().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(handler) = guard.as_ref() else {
            debug!("no handler registered, dropping {:?}", inbound.type_tag());
            return false;
        };
        let was_inside = IN_DISPATCH.with(|f| f.replace(true));
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(inbound)));
        IN_DISPATCH.with(|f| f.set(was_inside));
        drop(guard);
        self.install_deferred();
        match result {
            Ok(()) => true,
            Err(_) => {
                error!("message handler panicked on {:?}", inbound.type_tag());
                false
            }
        }
    }

    fn install_deferred(&self) {
        let Some(handler) = self.deferred.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        debug!("installing handler registered during dispatch");
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// After this returns no new invocation starts. Waits for in-flight invocations unless
    /// called from inside the handler.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if IN_DISPATCH.with(|f| f.get()) {
            return;
        }
        self.handler.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
