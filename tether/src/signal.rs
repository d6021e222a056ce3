// Observer registration for proxy change notifications
//
// INTENTION:
// Replace toolkit signal/slot dispatch with an explicit callback list:
// subscribing returns a token that can later disconnect the observer, and
// emission is a plain closure invocation in subscription order. Emitters are
// owned by a single proxy instance; callbacks must not block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Token identifying one connected observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalToken(u64);

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered list of observers for one notification kind
pub struct SignalEmitter<T> {
    slots: Mutex<Vec<(u64, Slot<T>)>>,
    next_token: AtomicU64,
}

impl<T> SignalEmitter<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Connect an observer; it stays connected until disconnected
    pub fn connect(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SignalToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .expect("signal emitter lock poisoned")
            .push((token, Arc::new(callback)));
        SignalToken(token)
    }

    /// Disconnect a previously connected observer; unknown tokens are ignored
    pub fn disconnect(&self, token: SignalToken) {
        self.slots
            .lock()
            .expect("signal emitter lock poisoned")
            .retain(|(id, _)| *id != token.0);
    }

    /// Invoke every connected observer, in subscription order
    ///
    /// The slot list is snapshotted before invocation, so observers may
    /// connect or disconnect re-entrantly; an observer disconnected from
    /// inside a callback can still receive the in-progress emission.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .expect("signal emitter lock poisoned")
            .iter()
            .map(|(_, slot)| slot.clone())
            .collect();
        for slot in snapshot {
            slot(value);
        }
    }

    /// Number of connected observers
    pub fn len(&self) -> usize {
        self.slots.lock().expect("signal emitter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SignalEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn observers_fire_in_subscription_order() {
        let emitter = SignalEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        emitter.connect(move |v: &u32| o1.lock().unwrap().push(("first", *v)));
        let o2 = order.clone();
        emitter.connect(move |v: &u32| o2.lock().unwrap().push(("second", *v)));

        emitter.emit(&7);
        assert_eq!(*order.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn disconnect_removes_observer() {
        let emitter = SignalEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let token = emitter.connect(move |_: &()| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&());
        emitter.disconnect(token);
        emitter.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
