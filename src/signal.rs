// Multi-subscriber notifications
//
// An ordered observer list. `emit` takes a snapshot of the subscribers and
// calls them synchronously in connection order, outside the list lock, so a
// handler may connect or disconnect others while it runs:
// - handlers connected during an emit are first called on the next emit
// - handlers disconnected during an emit may still see the one in flight
// - a handler that re-emits the same signal is skipped for the nested emit
//   (it is already running), everyone else is called normally
//
// The first handler error stops dispatch and is returned to the emitter.
//
// Handlers connected with `connect_weak` belong to an owner held by `Arc`.
// They stop being called once the owner is gone and are pruned from the
// list on the next connect, emit or `len`.

use anyhow::Result;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};

type Handler<T> = Arc<Mutex<Box<dyn FnMut(&T) -> Result<()> + Send>>>;

/// Handle returned by [`Signal::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Slot<T> {
    id: SubscriptionId,
    handler: Handler<T>,
    owner: Option<Weak<dyn Any + Send + Sync>>,
}

impl<T> Slot<T> {
    fn is_live(&self) -> bool {
        self.owner.as_ref().map_or(true, |owner| owner.strong_count() > 0)
    }
}

struct Slots<T> {
    next_id: u64,
    handlers: Vec<Slot<T>>,
}

impl<T> Slots<T> {
    fn prune(&mut self) {
        self.handlers.retain(Slot::is_live);
    }
}

pub struct Signal<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                next_id: 0,
                handlers: Vec::new(),
            }),
        }
    }

    pub fn connect<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&T) -> Result<()> + Send + 'static,
    {
        self.insert(Box::new(handler), None)
    }

    /// Connect a handler that lives only as long as `owner`. The handler gets
    /// the owner alongside each value; it is dropped from the list once the
    /// last strong reference to the owner is gone.
    pub fn connect_weak<S, F>(&self, owner: &Arc<S>, mut handler: F) -> SubscriptionId
    where
        S: Send + Sync + 'static,
        F: FnMut(&S, &T) -> Result<()> + Send + 'static,
    {
        let weak = Arc::downgrade(owner);
        let tracked: Weak<dyn Any + Send + Sync> = weak.clone();
        self.insert(
            Box::new(move |value: &T| match weak.upgrade() {
                Some(owner) => handler(&*owner, value),
                None => Ok(()),
            }),
            Some(tracked),
        )
    }

    fn insert(
        &self,
        handler: Box<dyn FnMut(&T) -> Result<()> + Send>,
        owner: Option<Weak<dyn Any + Send + Sync>>,
    ) -> SubscriptionId {
        let mut slots = self.slots.lock();
        slots.prune();
        let id = SubscriptionId(slots.next_id);
        slots.next_id += 1;
        slots.handlers.push(Slot {
            id,
            handler: Arc::new(Mutex::new(handler)),
            owner,
        });
        id
    }

    /// Returns false if `id` was not connected.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.handlers.len();
        slots.handlers.retain(|slot| slot.id != id);
        slots.handlers.len() != before
    }

    /// Live subscribers
    pub fn len(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.prune();
        slots.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, value: &T) -> Result<()> {
        let snapshot: Vec<Handler<T>> = {
            let mut slots = self.slots.lock();
            slots.prune();
            slots.handlers.iter().map(|slot| slot.handler.clone()).collect()
        };

        for handler in snapshot {
            match handler.try_lock() {
                Some(mut handler) => handler(value)?,
                None => log::trace!("Skipping re-entrant signal handler"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (log.clone(), log)
    }

    #[test]
    fn test_emit_calls_in_connection_order() {
        let (log, seen) = recorder();
        let signal = Signal::<u32>::new();

        let first = log.clone();
        signal.connect(move |_| {
            first.lock().push("first");
            Ok(())
        });
        let second = log.clone();
        signal.connect(move |_| {
            second.lock().push("second");
            Ok(())
        });

        signal.emit(&7).unwrap();
        signal.emit(&8).unwrap();
        assert_eq!(*seen.lock(), vec!["first", "second", "first", "second"]);
    }

    #[test]
    fn test_handler_receives_value() {
        let total = Arc::new(Mutex::new(0u32));
        let signal = Signal::<u32>::new();
        let sink = total.clone();
        signal.connect(move |v| {
            *sink.lock() += *v;
            Ok(())
        });

        signal.emit(&3).unwrap();
        signal.emit(&4).unwrap();
        assert_eq!(*total.lock(), 7);
    }

    #[test]
    fn test_disconnect() {
        let (log, seen) = recorder();
        let signal = Signal::<()>::new();
        let id = signal.connect(move |_| {
            log.lock().push("called");
            Ok(())
        });

        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        assert!(signal.is_empty());

        signal.emit(&()).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_connect_during_emit_waits_for_next_emit() {
        let (log, seen) = recorder();
        let signal = Arc::new(Signal::<()>::new());

        let inner_signal = signal.clone();
        let outer_log = log.clone();
        let mut connected = false;
        signal.connect(move |_| {
            outer_log.lock().push("outer");
            if !connected {
                connected = true;
                let late_log = outer_log.clone();
                inner_signal.connect(move |_| {
                    late_log.lock().push("late");
                    Ok(())
                });
            }
            Ok(())
        });

        signal.emit(&()).unwrap();
        assert_eq!(*seen.lock(), vec!["outer"]);

        signal.emit(&()).unwrap();
        assert_eq!(*seen.lock(), vec!["outer", "outer", "late"]);
    }

    #[test]
    fn test_error_stops_dispatch() {
        let (log, seen) = recorder();
        let signal = Signal::<()>::new();
        signal.connect(|_| anyhow::bail!("framebuffer rebuild failed"));
        signal.connect(move |_| {
            log.lock().push("after");
            Ok(())
        });

        let err = signal.emit(&()).unwrap_err();
        assert_eq!(err.to_string(), "framebuffer rebuild failed");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_weak_handlers_lapse_with_their_owner() {
        let signal = Signal::<u32>::new();
        let owners: Vec<Arc<Mutex<u32>>> = (0..100).map(|_| Arc::new(Mutex::new(0))).collect();
        for owner in &owners {
            signal.connect_weak(owner, |total: &Mutex<u32>, v: &u32| {
                *total.lock() += *v;
                Ok(())
            });
        }
        assert_eq!(signal.len(), 100);

        signal.emit(&2).unwrap();
        assert!(owners.iter().all(|o| *o.lock() == 2));

        drop(owners);
        assert_eq!(signal.len(), 0);
        signal.emit(&3).unwrap();
    }

    #[test]
    fn test_dead_owner_is_skipped_and_others_keep_running() {
        let (log, seen) = recorder();
        let signal = Signal::<()>::new();

        let owner = Arc::new(());
        let weak_log = log.clone();
        signal.connect_weak(&owner, move |_: &(), _: &()| {
            weak_log.lock().push("weak");
            Ok(())
        });
        signal.connect(move |_| {
            log.lock().push("strong");
            Ok(())
        });

        signal.emit(&()).unwrap();
        drop(owner);
        signal.emit(&()).unwrap();

        assert_eq!(*seen.lock(), vec!["weak", "strong", "strong"]);
        assert_eq!(signal.len(), 1);
    }

    #[test]
    fn test_reentrant_emit_skips_running_handler() {
        let count = Arc::new(Mutex::new(0u32));
        let signal = Arc::new(Signal::<()>::new());

        let nested = signal.clone();
        let counter = count.clone();
        signal.connect(move |_| {
            *counter.lock() += 1;
            nested.emit(&())
        });

        signal.emit(&()).unwrap();
        assert_eq!(*count.lock(), 1);
    }
}
