use std::collections::VecDeque;

use crate::protocol::SessionId;

/// FIFO of sessions seeking a partner. An id is held at most once.
#[derive(Debug, Default)]
pub(crate) struct WaitingQueue {
    entries: VecDeque<SessionId>,
}

impl WaitingQueue {
    /// Appends `id` and returns its 1-based position, or `None` if already queued.
    pub(crate) fn push_back(&mut self, id: SessionId) -> Option<usize> {
        if self.contains(id) {
            return None;
        }
        self.entries.push_back(id);
        Some(self.entries.len())
    }

    pub(crate) fn pop_front(&mut self) -> Option<SessionId> {
        self.entries.pop_front()
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> bool {
        match self.entries.iter().position(|entry| *entry == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// 1-based position of `id`, if queued.
    pub(crate) fn position(&self, id: SessionId) -> Option<usize> {
        self.entries.iter().position(|entry| *entry == id).map(|index| index + 1)
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.entries.contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.entries.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn keeps_fifo_order_across_removals() {
        let mut queue = WaitingQueue::default();
        let ids: Vec<SessionId> = (0..4).map(|_| SessionId::new()).collect();
        for (index, id) in ids.iter().enumerate() {
            assert_eq!(queue.push_back(*id), Some(index + 1));
        }

        assert!(queue.remove(ids[1]));
        assert!(!queue.remove(ids[1]));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.position(ids[2]), Some(2));
        assert_eq!(queue.position(ids[1]), None);
        assert_eq!(queue.pop_front(), Some(ids[0]));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![ids[2], ids[3]]);
    }

    #[test_timeout::timeout]
    fn rejects_duplicate_entries() {
        let mut queue = WaitingQueue::default();
        let id = SessionId::new();
        assert_eq!(queue.push_back(id), Some(1));
        assert_eq!(queue.push_back(id), None);
        assert_eq!(queue.len(), 1);
    }
}
