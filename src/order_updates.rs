use std::collections::{HashSet, VecDeque};

/// Bounded memory of `(order_id, updated_time)` pairs already handled.
/// The private stream may redeliver an update after a reconnect; the oldest
/// key is evicted once `capacity` is reached.
pub struct RecentUpdates {
    capacity: usize,
    order: VecDeque<(String, i64)>,
    seen: HashSet<(String, i64)>,
}

impl RecentUpdates {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RecentUpdates {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// `true` the first time a key is seen, `false` for a duplicate.
    pub fn insert(&mut self, order_id: &str, updated_time: i64) -> bool {
        let key = (order_id.to_string(), updated_time);
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
