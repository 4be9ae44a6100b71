use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Returned by [`BoundedQueue::enqueue`] once the queue is closed, handing the
/// rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO with a fixed capacity. Producers block while it is full and
/// consumers block while it is empty.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until there is room for `item`.
    pub fn enqueue(&self, item: T) -> Result<(), Closed<T>> {
        let mut state = self.lock();
        while !state.closed && state.items.len() >= self.capacity {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(Closed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed and every queued item has been handed out.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Rejects further items and wakes every waiting producer and consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn items_come_out_in_order() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            queue.enqueue(i).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.dequeue(), Some(0));
        assert_eq!(queue.try_dequeue(), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn producer_blocks_until_consumer_drains() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.enqueue(1).unwrap();

        let second_done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let second_done = Arc::clone(&second_done);
            thread::spawn(move || {
                queue.enqueue(2).unwrap();
                second_done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!second_done.load(Ordering::SeqCst));

        assert_eq!(queue.dequeue(), Some(1));
        producer.join().unwrap();
        assert!(second_done.load(Ordering::SeqCst));
        assert_eq!(queue.dequeue(), Some(2));
    }

    #[test]
    fn close_drains_then_stops_consumers() {
        let queue = BoundedQueue::new(4);
        queue.enqueue("a").unwrap();
        queue.close();

        assert_eq!(queue.enqueue("b"), Err(Closed("b")));
        assert_eq!(queue.dequeue(), Some("a"));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }
}
