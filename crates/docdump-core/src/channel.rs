use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Fixed-capacity MPMC queue connecting network threads to writer threads.
///
/// `push` blocks while the queue is full, `pop` blocks while it is empty.
/// Both report whether they had to block so callers can feed the block
/// counters. `close` wakes everyone up: blocked producers return
/// `stopped = true`, blocked consumers get `None`.
pub struct BoundedChannel<T> {
    state: Mutex<ChannelState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct ChannelState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    producers: usize,
}

impl<T> BoundedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        BoundedChannel {
            state: Mutex::new(ChannelState {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
                producers: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Returns `(stopped, blocked)`. `stopped` is set when the channel was
    /// closed before the item could be enqueued (the item is dropped);
    /// `blocked` when this call had to wait for a free slot.
    pub fn push(&self, item: T) -> (bool, bool) {
        let mut st = self.state.lock().unwrap();
        let mut blocked = false;
        loop {
            if st.closed {
                return (true, blocked);
            }
            if st.queue.len() < st.capacity {
                st.queue.push_back(item);
                self.not_empty.notify_one();
                return (false, blocked);
            }
            blocked = true;
            st = self.not_full.wait(st).unwrap();
        }
    }

    /// Returns `(item, blocked)`. `item` is `None` once the channel is closed
    /// and drained; `blocked` when this call had to wait for an item.
    pub fn pop(&self) -> (Option<T>, bool) {
        let mut st = self.state.lock().unwrap();
        let mut blocked = false;
        loop {
            if let Some(item) = st.queue.pop_front() {
                self.not_full.notify_one();
                return (Some(item), blocked);
            }
            if st.closed {
                return (None, blocked);
            }
            blocked = true;
            st = self.not_empty.wait(st).unwrap();
        }
    }

    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

/// Registers a producer on the channel; the last guard to drop closes it, so
/// consumers drain the queue and then see `None`.
pub struct ProducerGuard<T> {
    channel: Arc<BoundedChannel<T>>,
}

impl<T> ProducerGuard<T> {
    pub fn new(channel: Arc<BoundedChannel<T>>) -> Self {
        channel.state.lock().unwrap().producers += 1;
        ProducerGuard { channel }
    }
}

impl<T> Drop for ProducerGuard<T> {
    fn drop(&mut self) {
        let remaining = {
            let mut st = self.channel.state.lock().unwrap();
            st.producers -= 1;
            st.producers
        };
        if remaining == 0 {
            self.channel.close();
        }
    }
}
