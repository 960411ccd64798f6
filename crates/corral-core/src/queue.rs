use std::collections::VecDeque;

use tokio::time::Instant;

struct Entry<T> {
    item: T,
    delay_until: Option<Instant>,
}

/// FIFO queue where an entry may be held back until a point in time.
///
/// `shift` skips entries whose delay has not expired yet; those entries
/// still count towards `len`. Pushing never reorders existing entries.
pub struct DelayedQueue<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayedQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append an item, optionally not ready before `delay_until`.
    pub fn push(&mut self, item: T, delay_until: Option<Instant>) {
        self.entries.push_back(Entry { item, delay_until });
    }

    /// Remove and return the first entry that is ready now.
    pub fn shift(&mut self) -> Option<T> {
        self.shift_at(Instant::now())
    }

    /// Remove and return the first entry that is ready at `now`.
    pub fn shift_at(&mut self, now: Instant) -> Option<T> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.delay_until.is_none_or(|until| until <= now))?;
        self.entries.remove(index).map(|entry| entry.item)
    }

    /// Total number of entries, delayed ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry regardless of delay.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..).map(|entry| entry.item)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn shift_is_fifo_for_ready_entries() {
        let mut queue = DelayedQueue::new();
        queue.push(1, None);
        queue.push(2, None);
        queue.push(3, None);

        assert_eq!(queue.shift(), Some(1));
        assert_eq!(queue.shift(), Some(2));
        assert_eq!(queue.shift(), Some(3));
        assert_eq!(queue.shift(), None);
    }

    #[test]
    fn delayed_entries_are_skipped_but_counted() {
        let now = Instant::now();
        let mut queue = DelayedQueue::new();
        queue.push("later", Some(now + Duration::from_secs(10)));

        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
        assert_eq!(queue.shift_at(now), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn ready_entry_behind_delayed_one_is_returned() {
        let now = Instant::now();
        let mut queue = DelayedQueue::new();
        queue.push("later", Some(now + Duration::from_secs(10)));
        queue.push("now", None);

        assert_eq!(queue.shift_at(now), Some("now"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.shift_at(now + Duration::from_secs(10)), Some("later"));
        assert!(queue.is_empty());
    }

    #[test]
    fn delay_expiring_exactly_now_is_ready() {
        let now = Instant::now();
        let mut queue = DelayedQueue::new();
        queue.push(7, Some(now));
        assert_eq!(queue.shift_at(now), Some(7));
    }

    #[test]
    fn expired_delay_keeps_insertion_order() {
        let now = Instant::now();
        let mut queue = DelayedQueue::new();
        queue.push("a", Some(now + Duration::from_millis(5)));
        queue.push("b", None);
        let later = now + Duration::from_millis(10);

        assert_eq!(queue.shift_at(later), Some("a"));
        assert_eq!(queue.shift_at(later), Some("b"));
    }

    #[test]
    fn drain_empties_everything() {
        let now = Instant::now();
        let mut queue = DelayedQueue::new();
        queue.push(1, Some(now + Duration::from_secs(60)));
        queue.push(2, None);

        let drained: Vec<_> = queue.drain().collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
    }
}
