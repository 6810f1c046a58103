//! Bounded per-item notification queues.
//!
//! Values and events wait here between arrival from the publish pipeline
//! and consumption by the application. When a queue is full the oldest
//! entry is dropped.

use opcua_api::{DataValue, EventFieldList, Variant};
use std::collections::VecDeque;

/// Default depth of a data-change queue
pub const DEFAULT_DATA_QUEUE_SIZE: usize = 1;

/// Default depth of an event queue
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;

/// Bounded FIFO that remembers the most recent entry
#[derive(Debug, Clone)]
pub struct NotificationQueue<T> {
    queue: VecDeque<T>,
    queue_size: usize,
    last: Option<T>,
}

impl<T: Clone> NotificationQueue<T> {
    pub fn new(queue_size: usize) -> Self {
        let queue_size = queue_size.max(1);
        Self {
            queue: VecDeque::with_capacity(queue_size.min(DEFAULT_EVENT_QUEUE_SIZE)),
            queue_size,
            last: None,
        }
    }

    pub fn push(&mut self, entry: T) {
        self.last = Some(entry.clone());
        self.queue.push_back(entry);
        while self.queue.len() > self.queue_size {
            self.queue.pop_front();
        }
    }

    /// Take every queued entry, oldest first
    pub fn drain(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }

    /// Most recent entry, kept after `drain`
    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Resize the queue, floored at 1; excess entries are dropped oldest first
    pub fn set_queue_size(&mut self, queue_size: usize) {
        self.queue_size = queue_size.max(1);
        while self.queue.len() > self.queue_size {
            self.queue.pop_front();
        }
    }
}

/// Cache of one monitored item, shaped by the item kind
#[derive(Debug, Clone)]
pub enum ItemCache {
    Data(NotificationQueue<DataValue>),
    Events(NotificationQueue<Vec<Variant>>),
}

impl ItemCache {
    pub fn for_data() -> Self {
        ItemCache::Data(NotificationQueue::new(DEFAULT_DATA_QUEUE_SIZE))
    }

    pub fn for_events() -> Self {
        ItemCache::Events(NotificationQueue::new(DEFAULT_EVENT_QUEUE_SIZE))
    }

    pub fn queue_size(&self) -> usize {
        match self {
            ItemCache::Data(queue) => queue.queue_size(),
            ItemCache::Events(queue) => queue.queue_size(),
        }
    }

    pub fn set_queue_size(&mut self, queue_size: usize) {
        match self {
            ItemCache::Data(queue) => queue.set_queue_size(queue_size),
            ItemCache::Events(queue) => queue.set_queue_size(queue_size),
        }
    }

    /// Returns false if the value does not fit the cache kind
    pub fn save_value(&mut self, value: DataValue) -> bool {
        match self {
            ItemCache::Data(queue) => {
                queue.push(value);
                true
            }
            ItemCache::Events(_) => false,
        }
    }

    /// Returns false if the event does not fit the cache kind
    pub fn save_event(&mut self, event: &EventFieldList) -> bool {
        match self {
            ItemCache::Events(queue) => {
                queue.push(event.event_fields.clone());
                true
            }
            ItemCache::Data(_) => false,
        }
    }

    pub fn dequeue_values(&mut self) -> Vec<DataValue> {
        match self {
            ItemCache::Data(queue) => queue.drain(),
            ItemCache::Events(_) => Vec::new(),
        }
    }

    pub fn dequeue_events(&mut self) -> Vec<Vec<Variant>> {
        match self {
            ItemCache::Events(queue) => queue.drain(),
            ItemCache::Data(_) => Vec::new(),
        }
    }

    pub fn last_value(&self) -> Option<&DataValue> {
        match self {
            ItemCache::Data(queue) => queue.last(),
            ItemCache::Events(_) => None,
        }
    }

    pub fn last_event(&self) -> Option<&Vec<Variant>> {
        match self {
            ItemCache::Events(queue) => queue.last(),
            ItemCache::Data(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drops_oldest() {
        let mut queue = NotificationQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.last(), Some(&3));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert!(queue.is_empty());
        // last survives the drain
        assert_eq!(queue.last(), Some(&3));
    }

    #[test]
    fn test_queue_size_floor_and_trim() {
        let mut queue = NotificationQueue::new(0);
        assert_eq!(queue.queue_size(), 1);

        queue.set_queue_size(5);
        for i in 0..5 {
            queue.push(i);
        }
        queue.set_queue_size(2);
        assert_eq!(queue.drain(), vec![3, 4]);

        queue.set_queue_size(0);
        assert_eq!(queue.queue_size(), 1);
    }

    #[test]
    fn test_item_cache_kinds() {
        let mut data = ItemCache::for_data();
        assert_eq!(data.queue_size(), DEFAULT_DATA_QUEUE_SIZE);
        assert!(data.save_value(DataValue::new(1)));
        assert!(data.save_value(DataValue::new(2)));
        assert!(!data.save_event(&EventFieldList {
            client_handle: 1,
            event_fields: vec![],
        }));
        assert_eq!(data.dequeue_values(), vec![DataValue::new(2)]);
        assert_eq!(data.last_value(), Some(&DataValue::new(2)));
        assert!(data.dequeue_events().is_empty());

        let mut events = ItemCache::for_events();
        assert_eq!(events.queue_size(), DEFAULT_EVENT_QUEUE_SIZE);
        assert!(!events.save_value(DataValue::new(1)));
        assert!(events.save_event(&EventFieldList {
            client_handle: 1,
            event_fields: vec![Variant::from("e1")],
        }));
        assert_eq!(events.dequeue_events(), vec![vec![Variant::from("e1")]]);
        assert!(events.last_value().is_none());
        assert_eq!(events.last_event(), Some(&vec![Variant::from("e1")]));
    }
}
