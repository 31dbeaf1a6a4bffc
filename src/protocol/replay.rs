//! Bounded duplicate detection for message ids.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Recently seen message ids, evicted oldest first
#[derive(Debug)]
pub struct ReplayWindow {
    capacity: usize,
    inner: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl ReplayWindow {
    /// Create a window remembering at most `capacity` ids
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(WindowState::default()),
        }
    }

    /// Record `message_id`; returns true if it was already present
    pub fn check_and_record(&self, message_id: Uuid) -> bool {
        let mut state = self.inner.lock();
        if state.seen.contains(&message_id) {
            return true;
        }

        if state.order.len() >= self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        state.seen.insert(message_id);
        state.order.push_back(message_id);
        false
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// True if no id has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(super::REPLAY_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_detection() {
        let window = ReplayWindow::default();
        let id = Uuid::new_v4();

        assert!(!window.check_and_record(id));
        assert!(window.check_and_record(id));
        assert!(!window.check_and_record(Uuid::new_v4()));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_fifo_eviction() {
        let window = ReplayWindow::new(3);
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert!(!window.check_and_record(*id));
        }
        assert_eq!(window.len(), 3);

        // The oldest id fell out and is accepted again.
        assert!(!window.check_and_record(ids[0]));
        assert!(window.check_and_record(ids[3]));
    }

    #[test]
    fn test_concurrent_record_reports_one_original() {
        let window = Arc::new(ReplayWindow::default());
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || window.check_and_record(id))
            })
            .collect();
        let originals = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|duplicate| !duplicate)
            .count();

        assert_eq!(originals, 1);
    }
}
