//! Ordered deadline queue.
//!
//! Keeps (key, deadline) pairs sorted by deadline, with binary-search
//! insertion and keyed removal. Used for orphan reaping and the other
//! timer populations, which are all small and mostly append-at-the-end.

use std::collections::VecDeque;

#[derive(Clone, Debug, Default)]
pub struct DeadlineQueue<K> {
    queue: VecDeque<(K, u64)>,
}

impl<K: PartialEq> DeadlineQueue<K> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn insert(&mut self, key: K, deadline_ms: u64) {
        let at = self.queue.partition_point(|(_, d)| *d <= deadline_ms);
        self.queue.insert(at, (key, deadline_ms));
    }

    pub fn remove(&mut self, key: &K) {
        if let Some(at) = self.queue.iter().position(|(k, _)| k == key) {
            self.queue.remove(at);
        }
    }

    pub fn update(&mut self, key: K, deadline_ms: u64) {
        self.remove(&key);
        self.insert(key, deadline_ms);
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.front().map(|(_, d)| *d)
    }

    /// Remove and return every key whose deadline has passed.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<K> {
        let mut due = Vec::new();
        while let Some((_, deadline)) = self.queue.front() {
            if *deadline > now_ms {
                break;
            }
            if let Some((key, _)) = self.queue.pop_front() {
                due.push(key);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut q = DeadlineQueue::new();
        q.insert("b", 200);
        q.insert("a", 100);
        q.insert("c", 300);

        assert_eq!(q.next_deadline(), Some(100));
        assert_eq!(q.pop_due(250), vec!["a", "b"]);
        assert_eq!(q.next_deadline(), Some(300));
        assert!(q.pop_due(250).is_empty());
        assert_eq!(q.pop_due(300), vec!["c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let mut q = DeadlineQueue::new();
        q.insert("first", 100);
        q.insert("second", 100);
        assert_eq!(q.pop_due(100), vec!["first", "second"]);
    }

    #[test]
    fn update_moves_a_key() {
        let mut q = DeadlineQueue::new();
        q.insert(1u64, 100);
        q.insert(2u64, 200);
        q.update(1, 300);
        assert_eq!(q.pop_due(300), vec![2, 1]);
    }

    #[test]
    fn remove_of_absent_key_is_a_noop() {
        let mut q: DeadlineQueue<u64> = DeadlineQueue::new();
        q.insert(1, 100);
        q.remove(&99);
        assert_eq!(q.next_deadline(), Some(100));
    }
}
