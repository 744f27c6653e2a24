use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded multi-producer/multi-consumer queue. `push` blocks while full,
/// `pop` blocks while empty, `pop_timed` bounds that wait. `close` causes
/// pending and future pops to drain whatever remains and then return `None`
/// rather than block forever, mirroring the producer-closes-first contract
/// of the original pipe library this replaces.
pub struct Pipe<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Pipe<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Pipe {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    /// Blocks while the queue is full. Returns `false` if the pipe was
    /// closed before room became available.
    pub fn push(&self, value: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return false;
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(value);
                self.not_empty.notify_one();
                return true;
            }
            inner = self.not_full.wait(inner).unwrap();
        }
    }

    /// Blocks until an item is available or the pipe is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Like `pop`, but gives up after `timeout` and returns `None` either
    /// way — callers distinguish timeout from closed-and-drained by
    /// checking `is_closed()` if needed.
    pub fn pop_timed(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if result.timed_out() && inner.queue.is_empty() {
                return None;
            }
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_then_pop() {
        let pipe = Pipe::new(2);
        assert!(pipe.push(1));
        assert!(pipe.push(2));
        assert_eq!(pipe.pop(), Some(1));
        assert_eq!(pipe.pop(), Some(2));
    }

    #[test]
    fn close_drains_then_returns_none() {
        let pipe = Pipe::new(2);
        pipe.push(1);
        pipe.close();
        assert_eq!(pipe.pop(), Some(1));
        assert_eq!(pipe.pop(), None);
        assert!(!pipe.push(2));
    }

    #[test]
    fn pop_timed_times_out_when_empty() {
        let pipe: Arc<Pipe<u32>> = Pipe::new(1);
        let start = Instant::now();
        assert_eq!(pipe.pop_timed(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn blocked_push_unblocks_on_pop() {
        let pipe = Pipe::new(1);
        pipe.push(1);
        let producer = {
            let pipe = pipe.clone();
            thread::spawn(move || pipe.push(2))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(pipe.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(pipe.pop(), Some(2));
    }
}
