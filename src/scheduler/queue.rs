//! Priority queue with FIFO order inside each priority tier

use super::task::TaskPriority;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

type QueueKey = (Reverse<TaskPriority>, u64);

pub(crate) struct TaskQueue<T> {
    entries: BTreeMap<QueueKey, (String, T)>,
    keys: HashMap<String, QueueKey>,
    next_seq: u64,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            keys: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, id: String, priority: TaskPriority, item: T) {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.keys.insert(id.clone(), key);
        self.entries.insert(key, (id, item));
    }

    /// Highest priority first, oldest first within a priority
    pub fn pop(&mut self) -> Option<(String, T)> {
        let (_, (id, item)) = self.entries.pop_first()?;
        self.keys.remove(&id);
        Some((id, item))
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let key = self.keys.remove(id)?;
        self.entries.remove(&key).map(|(_, item)| item)
    }

    /// Ids in dispatch order
    pub fn ids(&self) -> Vec<String> {
        self.entries.values().map(|(id, _)| id.clone()).collect()
    }

    pub fn drain(&mut self) -> Vec<(String, T)> {
        self.keys.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::new();
        queue.push("low-1".into(), TaskPriority::Low, ());
        queue.push("normal-1".into(), TaskPriority::Normal, ());
        queue.push("low-2".into(), TaskPriority::Low, ());
        queue.push("critical".into(), TaskPriority::Critical, ());
        queue.push("normal-2".into(), TaskPriority::Normal, ());

        assert_eq!(
            queue.ids(),
            vec!["critical", "normal-1", "normal-2", "low-1", "low-2"]
        );

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|(id, _)| id)).collect();
        assert_eq!(order, vec!["critical", "normal-1", "normal-2", "low-1", "low-2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_and_drain() {
        let mut queue = TaskQueue::new();
        queue.push("a".into(), TaskPriority::High, 1);
        queue.push("b".into(), TaskPriority::High, 2);
        queue.push("c".into(), TaskPriority::Low, 3);

        assert_eq!(queue.remove("b"), Some(2));
        assert_eq!(queue.remove("b"), None);
        assert_eq!(queue.len(), 2);

        let drained: Vec<i32> = queue.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(drained, vec![1, 3]);
        assert!(queue.remove("a").is_none());
    }
}
