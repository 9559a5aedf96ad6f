use std::collections::VecDeque;
use std::sync::Mutex;

/// Coalescing single-flight queue shared by both refresh domains.
///
/// At most one pending request per key: enqueueing a key that is already
/// queued merges the new value into the existing slot (keeping its FIFO
/// position) instead of growing the queue. A single processor drains the
/// queue; `enqueue` reports whether the caller must start one, and
/// `take_next` clears the running flag when the queue is empty so the
/// processor can stop.
pub(crate) struct CoalescingQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    pending: VecDeque<(K, V)>,
    processor_running: bool,
}

impl<K: PartialEq, V> CoalescingQueue<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                processor_running: false,
            }),
        }
    }

    /// Merge a request into the queue. Returns true when no processor is
    /// running yet and the caller should start one (the flag is set here,
    /// atomically with the enqueue).
    pub fn enqueue(&self, key: K, value: V, merge: impl FnOnce(V, V) -> V) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::merge_locked(&mut inner.pending, key, value, merge);
        if inner.processor_running {
            false
        } else {
            inner.processor_running = true;
            true
        }
    }

    /// Merge a request back without touching the processor flag. Used when
    /// the running processor must defer a dequeued request (gate closed).
    pub fn requeue(&self, key: K, value: V, merge: impl FnOnce(V, V) -> V) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::merge_locked(&mut inner.pending, key, value, merge);
    }

    /// Take-and-clear the next pending request. Returns None when the queue
    /// is empty, in which case the running flag is cleared and the calling
    /// processor must stop.
    pub fn take_next(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        match inner.pending.pop_front() {
            Some(entry) => Some(entry),
            None => {
                inner.processor_running = false;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").pending.len()
    }

    fn merge_locked(
        pending: &mut VecDeque<(K, V)>,
        key: K,
        value: V,
        merge: impl FnOnce(V, V) -> V,
    ) {
        if let Some(idx) = pending.iter().position(|(k, _)| *k == key) {
            let (key, old) = pending.remove(idx).expect("index in bounds");
            pending.insert(idx, (key, merge(old, value)));
        } else {
            pending.push_back((key, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_merge(a: u32, b: u32) -> u32 {
        a.max(b)
    }

    #[test]
    fn first_enqueue_starts_processor_only_once() {
        let queue: CoalescingQueue<(), u32> = CoalescingQueue::new();
        assert!(queue.enqueue((), 1, max_merge));
        assert!(!queue.enqueue((), 2, max_merge));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn repeated_enqueues_coalesce_into_one_slot() {
        let queue: CoalescingQueue<(), u32> = CoalescingQueue::new();
        queue.enqueue((), 1, max_merge);
        queue.enqueue((), 3, max_merge);
        queue.enqueue((), 2, max_merge);

        assert_eq!(queue.take_next(), Some(((), 3)));
        assert_eq!(queue.take_next(), None);
    }

    #[test]
    fn take_next_on_empty_clears_running_flag() {
        let queue: CoalescingQueue<(), u32> = CoalescingQueue::new();
        queue.enqueue((), 1, max_merge);
        assert!(queue.take_next().is_some());
        assert!(queue.take_next().is_none());
        // Processor stopped; the next enqueue must start a new one.
        assert!(queue.enqueue((), 1, max_merge));
    }

    #[test]
    fn keys_keep_fifo_order_and_merge_in_place() {
        let queue: CoalescingQueue<&str, u32> = CoalescingQueue::new();
        queue.enqueue("a", 1, max_merge);
        queue.enqueue("b", 2, max_merge);
        queue.enqueue("a", 5, max_merge);

        assert_eq!(queue.take_next(), Some(("a", 5)));
        assert_eq!(queue.take_next(), Some(("b", 2)));
    }

    #[test]
    fn requeue_preserves_running_state() {
        let queue: CoalescingQueue<&str, u32> = CoalescingQueue::new();
        assert!(queue.enqueue("a", 1, max_merge));
        let (key, value) = queue.take_next().unwrap();
        queue.requeue(key, value, max_merge);
        // Still running: a concurrent enqueue must not start a second
        // processor.
        assert!(!queue.enqueue("b", 2, max_merge));
        assert_eq!(queue.take_next(), Some(("a", 1)));
    }
}
