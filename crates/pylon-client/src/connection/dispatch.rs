//! Typed notification dispatch.
//!
//! Handlers are kept per [`NotifyKind`] in registration order and invoked
//! synchronously for every inbound notification. Dispatch iterates over a
//! snapshot of the handler list, so a handler unregistering itself or a
//! sibling mid-dispatch cannot corrupt the in-progress iteration. A handler
//! that panics is caught and logged; later handlers still run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pylon_core::{Notify, NotifyKind};
use tracing::warn;

type Callback = Box<dyn Fn(&Notify) + Send + Sync>;
type Filter = Box<dyn Fn(&Notify) -> bool + Send + Sync>;

enum Handler {
    Persistent(Callback),
    CatchOnce {
        filter: Option<Filter>,
        slot: Arc<Mutex<Option<Notify>>>,
    },
}

struct Entry {
    id: u64,
    handler: Handler,
}

pub(crate) struct DispatcherInner {
    handlers: Mutex<HashMap<NotifyKind, Vec<Arc<Entry>>>>,
    next_id: AtomicU64,
}

impl DispatcherInner {
    fn remove(&self, kind: NotifyKind, id: u64) {
        let mut handlers = self.handlers.lock();
        if let Some(entries) = handlers.get_mut(&kind) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                let _ = handlers.remove(&kind);
            }
        }
    }
}

/// Ordered registry of notification handlers.
pub(crate) struct NotifyDispatcher {
    inner: Arc<DispatcherInner>,
}

impl NotifyDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn insert(&self, kind: NotifyKind, handler: Handler) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(Entry { id, handler });
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push(entry);
        id
    }

    /// Register a persistent handler for `kind`.
    pub(crate) fn subscribe(
        &self,
        kind: NotifyKind,
        callback: impl Fn(&Notify) + Send + Sync + 'static,
    ) -> NotifySubscription {
        let id = self.insert(kind, Handler::Persistent(Box::new(callback)));
        NotifySubscription {
            inner: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Register a single-use catcher for the next notification of `kind`
    /// accepted by `filter` (or any, if absent).
    pub(crate) fn catch_next(&self, kind: NotifyKind, filter: Option<Filter>) -> CaughtNotify {
        let slot = Arc::new(Mutex::new(None));
        let id = self.insert(
            kind,
            Handler::CatchOnce {
                filter,
                slot: slot.clone(),
            },
        );
        CaughtNotify {
            inner: Arc::downgrade(&self.inner),
            kind,
            id,
            slot,
            outcome: Mutex::new(None),
        }
    }

    /// Invoke every handler registered for the notification's kind.
    pub(crate) fn dispatch(&self, notify: &Notify) {
        let kind = notify.kind();
        let snapshot: Vec<Arc<Entry>> = self
            .inner
            .handlers
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut spent = Vec::new();
        for entry in &snapshot {
            match &entry.handler {
                Handler::Persistent(callback) => {
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| callback(notify)));
                    if result.is_err() {
                        warn!(kind = ?kind, "notification handler panicked");
                    }
                }
                Handler::CatchOnce { filter, slot } => {
                    let mut slot = slot.lock();
                    if slot.is_some() {
                        continue;
                    }
                    if filter.as_ref().is_none_or(|accept| accept(notify)) {
                        *slot = Some(notify.clone());
                        spent.push(entry.id);
                    }
                }
            }
        }

        for id in spent {
            self.inner.remove(kind, id);
        }
    }
}

/// Guard for a persistent handler registration. Dropping it (or calling
/// [`NotifySubscription::unsubscribe`]) removes the handler.
pub struct NotifySubscription {
    inner: Weak<DispatcherInner>,
    kind: NotifyKind,
    id: u64,
}

impl NotifySubscription {
    /// Remove the handler.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.kind, self.id);
        }
    }
}

/// Single-use catcher returned by `catch_notify`.
///
/// [`CaughtNotify::resolve`] never blocks: it returns the captured
/// notification if a matching one already arrived, else `None`. The first
/// call settles the outcome; repeated calls return the same answer.
pub struct CaughtNotify {
    inner: Weak<DispatcherInner>,
    kind: NotifyKind,
    id: u64,
    slot: Arc<Mutex<Option<Notify>>>,
    outcome: Mutex<Option<Option<Notify>>>,
}

impl CaughtNotify {
    /// Settle and return the outcome of this catcher.
    pub fn resolve(&self) -> Option<Notify> {
        let mut outcome = self.outcome.lock();
        if let Some(settled) = &*outcome {
            return settled.clone();
        }
        let value = self.slot.lock().clone();
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.kind, self.id);
        }
        *outcome = Some(value.clone());
        value
    }
}

impl Drop for CaughtNotify {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.kind, self.id);
        }
    }
}
