//! Notification and indication subscriptions
//!
//! Every subscription owns a dispatch thread fed by a channel. The read path
//! only ever pushes into that channel, so a slow callback never stalls it, and
//! values for one handle are delivered in arrival order.
//!
//! The callback lives in a slot guarded by its own mutex. The dispatch thread
//! holds that mutex for the duration of each invocation and `unsubscribe`
//! empties the slot under the same mutex, so once `unsubscribe` returns no
//! further invocation can start, even for values that were already queued.
//! Unsubscribing from a dispatch thread does not wait for a callback running
//! on another dispatch thread, so callbacks may unsubscribe each other.
use super::lock;
use crate::error::Result;
use log::{debug, trace};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

thread_local! {
    static ON_DISPATCH_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Value notification callback, called with the value handle and the value
pub type NotificationCallback = Box<dyn FnMut(u16, &[u8]) + Send + 'static>;

struct CallbackSlot {
    callback: Mutex<Option<NotificationCallback>>,
    retired: AtomicBool,
}

/// Sending side of one subscription's dispatch queue
#[derive(Clone)]
pub struct Dispatcher {
    handle: u16,
    tx: Sender<Vec<u8>>,
}

impl Dispatcher {
    /// Value handle this dispatcher delivers for
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Queue a value for the callback. Returns false once the subscription
    /// has gone away.
    pub fn deliver(&self, value: Vec<u8>) -> bool {
        self.tx.send(value).is_ok()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handle", &self.handle)
            .finish()
    }
}

struct Subscription {
    slot: Arc<CallbackSlot>,
    dispatcher: Dispatcher,
    worker: ThreadId,
}

impl Subscription {
    fn retire(self) {
        self.slot.retired.store(true, Ordering::SeqCst);
        // From inside a callback, waiting on a slot could deadlock against a
        // callback doing the same to ours. The retired flag alone stops the
        // worker before its next invocation.
        if thread::current().id() == self.worker || ON_DISPATCH_THREAD.with(Cell::get) {
            return;
        }
        *lock(&self.slot.callback) = None;
    }
}

/// A subscription displaced by [`SubscriptionRegistry::swap`], held until
/// the swap is committed or rolled back.
pub(crate) struct Swapped {
    handle: u16,
    previous: Option<Subscription>,
}

/// Mapping from characteristic value handle to notification callback
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<u16, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for `handle`, replacing any earlier subscription.
    pub fn subscribe<F>(&self, handle: u16, callback: F) -> Result<()>
    where
        F: FnMut(u16, &[u8]) + Send + 'static,
    {
        let swapped = self.swap(handle, callback)?;
        self.commit(swapped);
        Ok(())
    }

    /// Install `callback` for `handle` while keeping any earlier subscription
    /// alive, so [`Self::restore`] can put it back.
    pub(crate) fn swap<F>(&self, handle: u16, callback: F) -> Result<Swapped>
    where
        F: FnMut(u16, &[u8]) + Send + 'static,
    {
        let slot = Arc::new(CallbackSlot {
            callback: Mutex::new(Some(Box::new(callback))),
            retired: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel();

        let worker_slot = Arc::clone(&slot);
        let worker = thread::Builder::new()
            .name(format!("gatt-notify-{:04x}", handle))
            .spawn(move || run_dispatch(handle, rx, worker_slot))?;

        let subscription = Subscription {
            slot,
            dispatcher: Dispatcher { handle, tx },
            worker: worker.thread().id(),
        };

        let previous = lock(&self.subscriptions).insert(handle, subscription);
        Ok(Swapped { handle, previous })
    }

    /// Retire the subscription a swap displaced.
    pub(crate) fn commit(&self, swapped: Swapped) {
        if let Some(previous) = swapped.previous {
            debug!("Replacing subscription for handle 0x{:04X}", swapped.handle);
            previous.retire();
        }
    }

    /// Undo a swap: retire the new subscription and reinstate the old one.
    pub(crate) fn restore(&self, swapped: Swapped) {
        let Swapped { handle, previous } = swapped;
        let current = {
            let mut subscriptions = lock(&self.subscriptions);
            match previous {
                Some(previous) => subscriptions.insert(handle, previous),
                None => subscriptions.remove(&handle),
            }
        };
        if let Some(current) = current {
            current.retire();
        }
    }

    /// Remove the subscription for `handle`. Returns whether one existed.
    ///
    /// Blocks while the callback is running on another thread, unless called
    /// from a dispatch thread: there it only stops further invocations.
    pub fn unsubscribe(&self, handle: u16) -> bool {
        let removed = lock(&self.subscriptions).remove(&handle);
        match removed {
            Some(subscription) => {
                subscription.retire();
                true
            }
            None => false,
        }
    }

    /// The dispatcher for `handle`, if subscribed
    pub fn lookup(&self, handle: u16) -> Option<Dispatcher> {
        lock(&self.subscriptions)
            .get(&handle)
            .map(|subscription| subscription.dispatcher.clone())
    }

    /// Queue `value` for the subscriber of `handle`. Returns false when
    /// nobody is subscribed.
    pub fn dispatch(&self, handle: u16, value: Vec<u8>) -> bool {
        match self.lookup(handle) {
            Some(dispatcher) => dispatcher.deliver(value),
            None => false,
        }
    }

    pub fn is_subscribed(&self, handle: u16) -> bool {
        lock(&self.subscriptions).contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription
    pub fn clear(&self) {
        let drained: Vec<Subscription> = lock(&self.subscriptions)
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in drained {
            subscription.retire();
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn run_dispatch(handle: u16, rx: Receiver<Vec<u8>>, slot: Arc<CallbackSlot>) {
    ON_DISPATCH_THREAD.with(|flag| flag.set(true));
    for value in rx {
        let mut callback = lock(&slot.callback);
        if slot.retired.load(Ordering::SeqCst) {
            break;
        }
        match callback.as_mut() {
            Some(callback) => callback(handle, &value),
            None => break,
        }
    }
    trace!("Dispatch for handle 0x{:04X} finished", handle);
}
