//! Subscriber registry.
//!
//! Subscribers are plain callbacks kept in registration order. Dispatch runs
//! over a snapshot taken up front, so callbacks may subscribe or unsubscribe
//! (themselves or others) without skipping or double-invoking anyone in the
//! current round. A panicking callback is isolated and the round continues.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};

/// Identifier of a registered callback.
pub type SubscriberId = u64;

/// A registered callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Outcome of one dispatch round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub panicked: usize,
}

/// Ordered list of subscribers for one channel.
pub struct SubscriberList<T> {
    entries: Vec<(SubscriberId, Callback<T>)>,
    next_id: SubscriberId,
}

impl<T> SubscriberList<T> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Register a callback. Returns its id.
    pub fn add(&mut self, callback: Callback<T>) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    /// Remove a callback.
    ///
    /// Returns `true` if it was registered.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(sid, _)| *sid != id);
        self.entries.len() != before
    }

    /// Copy of the current subscribers, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SubscriberId, Callback<T>)> {
        self.entries.clone()
    }

    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.entries.iter().any(|(sid, _)| *sid == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for SubscriberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Invoke every callback of a snapshot with `value`, in order.
pub fn dispatch<T>(snapshot: &[(SubscriberId, Callback<T>)], value: &T) -> DispatchReport {
    let mut report = DispatchReport::default();

    for (id, callback) in snapshot {
        match catch_unwind(AssertUnwindSafe(|| callback(value))) {
            Ok(()) => report.delivered += 1,
            Err(_) => {
                warn!(subscriber = id, "Subscriber panicked during dispatch");
                report.panicked += 1;
            }
        }
    }

    trace!(
        delivered = report.delivered,
        panicked = report.panicked,
        "Dispatched"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Callback<u32> {
        let log = Arc::clone(log);
        Arc::new(move |v: &u32| log.lock().unwrap().push(format!("{name}:{v}")))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SubscriberList::new();
        list.add(recorder(&log, "a"));
        list.add(recorder(&log, "b"));
        list.add(recorder(&log, "c"));

        let report = dispatch(&list.snapshot(), &7);
        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock().unwrap(), ["a:7", "b:7", "c:7"]);
    }

    #[test]
    fn test_removed_subscriber_not_invoked() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SubscriberList::new();
        let a = list.add(recorder(&log, "a"));
        list.add(recorder(&log, "b"));

        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert!(!list.contains(a));

        dispatch(&list.snapshot(), &1);
        assert_eq!(*log.lock().unwrap(), ["b:1"]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SubscriberList::new();
        list.add(recorder(&log, "a"));
        list.add(Arc::new(|_: &u32| panic!("render failed")));
        list.add(recorder(&log, "c"));

        let report = dispatch(&list.snapshot(), &3);
        assert_eq!(report, DispatchReport { delivered: 2, panicked: 1 });
        assert_eq!(*log.lock().unwrap(), ["a:3", "c:3"]);
    }

    #[test]
    fn test_snapshot_is_stable_during_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let list = Arc::new(Mutex::new(SubscriberList::<u32>::new()));

        let late = recorder(&log, "late");
        let adder = {
            let list = Arc::clone(&list);
            let log = Arc::clone(&log);
            Arc::new(move |v: &u32| {
                log.lock().unwrap().push(format!("adder:{v}"));
                list.lock().unwrap().add(Arc::clone(&late));
            }) as Callback<u32>
        };
        list.lock().unwrap().add(adder);
        list.lock().unwrap().add(recorder(&log, "b"));

        let snapshot = list.lock().unwrap().snapshot();
        dispatch(&snapshot, &1);
        assert_eq!(*log.lock().unwrap(), ["adder:1", "b:1"]);
        assert_eq!(list.lock().unwrap().len(), 3);
    }
}
