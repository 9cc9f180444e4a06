use std::collections::HashSet;
use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// Bounded memory of recently committed cursors.
///
/// A node whose cursor was committed by an earlier batch of this process is
/// skipped before it reaches the store. Oldest cursors are evicted first.
#[derive(Debug)]
pub struct CursorQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl CursorQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn contains(
        &self,
        cursor: &str,
    ) -> bool {
        self.inner.lock().members.contains(cursor)
    }

    /// Remembers committed cursors, evicting the oldest beyond capacity.
    pub fn push_all<'a>(
        &self,
        cursors: impl IntoIterator<Item = &'a str>,
    ) {
        let mut inner = self.inner.lock();
        for cursor in cursors {
            if !inner.members.insert(cursor.to_string()) {
                continue;
            }
            inner.order.push_back(cursor.to_string());
            while inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.members.remove(&oldest);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
