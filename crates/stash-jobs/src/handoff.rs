use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Multi-producer handoff drained by a single owner thread.
///
/// Background jobs push finished results; the owning thread drains them at
/// a point of its choosing and applies them. Nothing pushed here is ever
/// applied from the producing thread.
pub struct CommitQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> CommitQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
    }

    /// Remove and return everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for CommitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CommitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CommitQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitQueue")
            .field("queued", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn drain_returns_items_in_push_order() {
        let queue = CommitQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn clones_share_the_same_queue() {
        let queue = CommitQueue::new();
        let producer = queue.clone();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let producer = producer.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        producer.push(i * 100 + j);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("producer should not panic");
        }

        assert_eq!(queue.len(), 100);
        assert_eq!(queue.drain().len(), 100);
    }
}
