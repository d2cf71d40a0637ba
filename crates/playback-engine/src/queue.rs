//! Thread-safe bounded blocking queue with size-threshold observers.
//!
//! The same queue type carries compressed packets (read thread → decode thread) and
//! decoded frames (decode thread → display / audio pull):
//! - `blocking_insert` is the backpressure point for producers
//! - `blocking_remove` parks consumers until data arrives
//! - `disable_io(true)` wakes every waiter so control paths (flush, stop) can
//!   quiesce the threads on either side without timeouts
//!
//! Observers are invoked synchronously on the thread that changed the size, after
//! the queue lock is released. A callback may therefore call back into the queue
//! (or anything else) without deadlocking, but it runs inline on a pipeline thread
//! and must stay short.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Direction of a size-threshold crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Fires when the size drops from above `threshold` to `<= threshold`.
    AtMost,
    /// Fires when the size rises from below `threshold` to `>= threshold`.
    AtLeast,
}

/// Details handed to a size observer when its threshold is crossed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeCrossing {
    /// Queue size right after the change.
    pub size: usize,
    pub threshold: usize,
    pub trigger: Trigger,
}

/// Size observer callback. The returned flag reports whether the observer acted on
/// the crossing; the queue only logs it.
pub type SizeCallback = Arc<dyn Fn(SizeCrossing) -> bool + Send + Sync>;

struct SizeObserver {
    threshold: usize,
    trigger: Trigger,
    callback: SizeCallback,
}

impl SizeObserver {
    fn crossed(&self, before: usize, after: usize) -> bool {
        match self.trigger {
            Trigger::AtMost => before > self.threshold && after <= self.threshold,
            Trigger::AtLeast => before < self.threshold && after >= self.threshold,
        }
    }
}

struct QueueInner<T> {
    items: VecDeque<T>,
    io_enabled: bool,
    observers: Vec<SizeObserver>,
}

/// Bounded FIFO shared between exactly one stage on each side.
///
/// ## Design
/// - A single [`Condvar`] is used as a general “state changed” signal.
/// - The `io_enabled` flag lives under the same mutex as the items to avoid races
///   between disabling and a waiter re-checking its condition.
/// - While I/O is disabled, inserts drop their item and removes return `None`
///   immediately. Disabling is not an error state; it is how the pipeline halts
///   one side while the other is flushed.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create an enabled, empty queue. `capacity` is clamped to at least one item.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                io_enabled: true,
                observers: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current number of items (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn io_enabled(&self) -> bool {
        self.lock().io_enabled
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Returns `false` when I/O is (or becomes) disabled; the item is dropped in that
    /// case and the producer is expected to stop producing.
    pub fn blocking_insert(&self, item: T) -> bool {
        let mut g = self.lock();
        while g.io_enabled && g.items.len() >= self.capacity {
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
        if !g.io_enabled {
            drop(g);
            tracing::trace!(queue = %self.name, "insert dropped: io disabled");
            return false;
        }

        let before = g.items.len();
        g.items.push_back(item);
        let fired = Self::crossed_observers(&g, before, before + 1);
        drop(g);

        self.cv.notify_all();
        self.notify_observers(fired);
        true
    }

    /// Pop the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` without blocking when I/O is disabled, so a consumer parked on
    /// an empty queue wakes up and can re-check its run condition.
    pub fn blocking_remove(&self) -> Option<T> {
        let mut g = self.lock();
        while g.io_enabled && g.items.is_empty() {
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
        if !g.io_enabled {
            return None;
        }

        let before = g.items.len();
        let item = g.items.pop_front();
        let fired = Self::crossed_observers(&g, before, before.saturating_sub(1));
        drop(g);

        self.cv.notify_all();
        self.notify_observers(fired);
        item
    }

    /// Enable or disable I/O. Disabling wakes every blocked waiter.
    pub fn disable_io(&self, disabled: bool) {
        let mut g = self.lock();
        g.io_enabled = !disabled;
        drop(g);
        self.cv.notify_all();
    }

    /// Release every queued item and reset to empty.
    ///
    /// Meant to run while I/O is disabled so nothing races the drain. Observers are
    /// not notified: a flush is a reset, not a size change the pipeline reacts to.
    /// Returns the number of released items.
    pub fn flush(&self) -> usize {
        let mut g = self.lock();
        if g.io_enabled {
            tracing::debug!(queue = %self.name, "flush while io enabled");
        }
        let drained = std::mem::take(&mut g.items);
        drop(g);

        self.cv.notify_all();
        let count = drained.len();
        drop(drained);
        count
    }

    /// Register a threshold observer.
    ///
    /// The callback fires once per crossing in the registered direction, on the thread
    /// whose insert/remove caused it.
    pub fn add_observer(&self, threshold: usize, trigger: Trigger, callback: SizeCallback) {
        self.lock().observers.push(SizeObserver {
            threshold,
            trigger,
            callback,
        });
    }

    pub fn clear_observers(&self) {
        self.lock().observers.clear();
    }

    fn crossed_observers(
        g: &QueueInner<T>,
        before: usize,
        after: usize,
    ) -> Vec<(SizeCallback, SizeCrossing)> {
        g.observers
            .iter()
            .filter(|o| o.crossed(before, after))
            .map(|o| {
                (
                    o.callback.clone(),
                    SizeCrossing {
                        size: after,
                        threshold: o.threshold,
                        trigger: o.trigger,
                    },
                )
            })
            .collect()
    }

    fn notify_observers(&self, fired: Vec<(SizeCallback, SizeCrossing)>) {
        for (callback, crossing) in fired {
            let handled = callback(crossing);
            tracing::trace!(
                queue = %self.name,
                size = crossing.size,
                threshold = crossing.threshold,
                handled,
                "size observer fired"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_observer(counter: &Arc<AtomicUsize>) -> SizeCallback {
        let counter = counter.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = BoundedQueue::new("q", 8);
        for i in 0..5 {
            assert!(q.blocking_insert(i));
        }
        let out: Vec<_> = (0..5).map(|_| q.blocking_remove().unwrap()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn capacity_is_clamped_to_one() {
        let q: BoundedQueue<u8> = BoundedQueue::new("q", 0);
        assert_eq!(q.capacity(), 1);
    }

    #[test]
    fn insert_blocks_while_full_until_space_appears() {
        let q = Arc::new(BoundedQueue::new("q", 2));
        q.blocking_insert(1);
        q.blocking_insert(2);

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let ok = q.blocking_insert(3);
                assert!(q.len() <= q.capacity());
                ok
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.len(), 2);
        assert_eq!(q.blocking_remove(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(q.blocking_remove(), Some(2));
        assert_eq!(q.blocking_remove(), Some(3));
    }

    #[test]
    fn size_never_exceeds_capacity_under_contention() {
        let q = Arc::new(BoundedQueue::new("q", 4));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..3)
            .map(|p| {
                let q = q.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        q.blocking_insert(p * 1000 + i);
                        max_seen.fetch_max(q.len(), Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                for _ in 0..600 {
                    assert!(q.blocking_remove().is_some());
                }
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();
        assert!(max_seen.load(Ordering::SeqCst) <= 4);
        assert!(q.is_empty());
    }

    #[test]
    fn disable_wakes_blocked_remove() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new("q", 4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.blocking_remove())
        };

        thread::sleep(Duration::from_millis(20));
        q.disable_io(true);
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn disable_wakes_blocked_insert_and_drops_item() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = Arc::new(BoundedQueue::new("q", 1));
        q.blocking_insert(Tracked(drops.clone()));

        let producer = {
            let q = q.clone();
            let drops = drops.clone();
            thread::spawn(move || q.blocking_insert(Tracked(drops)))
        };

        thread::sleep(Duration::from_millis(20));
        q.disable_io(true);
        assert!(!producer.join().unwrap());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_on_disabled_queue_does_not_block() {
        let q = BoundedQueue::new("q", 4);
        q.blocking_insert(7);
        q.disable_io(true);
        assert_eq!(q.blocking_remove(), None);
        q.disable_io(false);
        assert_eq!(q.blocking_remove(), Some(7));
    }

    #[test]
    fn flush_releases_every_item_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = BoundedQueue::new("q", 16);
        for _ in 0..10 {
            q.blocking_insert(Tracked(drops.clone()));
        }

        q.disable_io(true);
        assert_eq!(q.flush(), 10);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
        assert_eq!(q.len(), 0);

        q.disable_io(false);
        drop(q);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn observers_fire_once_per_crossing() {
        let q = BoundedQueue::new("q", 64);
        let empty_hits = Arc::new(AtomicUsize::new(0));
        let resume_hits = Arc::new(AtomicUsize::new(0));
        q.add_observer(1, Trigger::AtMost, counting_observer(&empty_hits));
        q.add_observer(20, Trigger::AtLeast, counting_observer(&resume_hits));

        for i in 0..30 {
            q.blocking_insert(i);
        }
        assert_eq!(resume_hits.load(Ordering::SeqCst), 1);
        assert_eq!(empty_hits.load(Ordering::SeqCst), 0);

        for _ in 0..30 {
            q.blocking_remove();
        }
        assert_eq!(empty_hits.load(Ordering::SeqCst), 1);

        for i in 0..25 {
            q.blocking_insert(i);
        }
        assert_eq!(resume_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_resets_without_notifying() {
        let q = BoundedQueue::new("q", 64);
        let empty_hits = Arc::new(AtomicUsize::new(0));
        q.add_observer(1, Trigger::AtMost, counting_observer(&empty_hits));

        for i in 0..5 {
            q.blocking_insert(i);
        }
        q.disable_io(true);
        q.flush();
        q.disable_io(false);
        assert_eq!(empty_hits.load(Ordering::SeqCst), 0);

        q.blocking_insert(1);
        q.blocking_remove();
        assert_eq!(empty_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_may_reenter_the_queue() {
        let q = Arc::new(BoundedQueue::new("q", 8));
        let seen = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&q);
        let seen_cb = seen.clone();
        q.add_observer(
            2,
            Trigger::AtLeast,
            Arc::new(move |crossing| {
                if let Some(q) = weak.upgrade() {
                    seen_cb.store(q.len(), Ordering::SeqCst);
                }
                crossing.size == 2
            }),
        );

        q.blocking_insert(1);
        q.blocking_insert(2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
