use std::collections::VecDeque;
use std::sync::Mutex;

/// Mutex-guarded FIFO shared between producer threads and the event loop. `put` never
/// blocks beyond the lock and `get` returns immediately with `None` when empty.
pub struct Fifo<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Fifo<T> {
    #[inline]
    pub fn new() -> Fifo<T> {
        Fifo {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an element at the tail of the queue.
    #[inline]
    pub fn put(&self, item: T) {
        self.items.lock().expect("Queue lock poisoned").push_back(item);
    }

    /// Pop the element at the head of the queue, if any.
    #[inline]
    pub fn get(&self) -> Option<T> {
        self.items.lock().expect("Queue lock poisoned").pop_front()
    }

    /// Returns the number of queued elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.lock().expect("Queue lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = Fifo::new();

        queue.put(1);
        queue.put(2);
        queue.put(3);

        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), Some(3));
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn test_empty_get() {
        let queue: Fifo<u32> = Fifo::new();

        assert_eq!(queue.get(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_multi_producer() {
        let queue = Arc::new(Fifo::new());

        let producers: Vec<_> = (0..4usize)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for item in 0..100 {
                        queue.put((producer, item));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut last_seen = [None; 4];
        let mut count = 0;

        while let Some((producer, item)) = queue.get() {
            // Per-producer ordering must survive the interleaving.
            if let Some(last) = last_seen[producer] {
                assert!(item > last);
            }
            last_seen[producer] = Some(item);
            count += 1;
        }

        assert_eq!(count, 400);
    }
}
