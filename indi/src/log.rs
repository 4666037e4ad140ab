//! Capped connection/device log
//!
//! Entries are kept in insertion order and the oldest entry is evicted once
//! the ring is full. A device-scoped entry replaces the previous entry from
//! the same device, so each device contributes only its latest line.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub device: Option<String>,
}

#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    items: Mutex<VecDeque<LogItem>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry and return it.
    pub fn append(&self, message: impl Into<String>, device: Option<&str>) -> LogItem {
        let item = LogItem {
            timestamp: Utc::now(),
            message: message.into(),
            device: device.map(str::to_string),
        };
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = device {
            items.retain(|i| i.device.as_deref() != Some(device));
        }
        while items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item.clone());
        item
    }

    /// Copy of the current entries, oldest first
    pub fn snapshot(&self) -> Vec<LogItem> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = LogRing::new(5);
        for i in 0..8 {
            ring.append(format!("entry {}", i), None);
        }
        let messages: Vec<String> = ring.snapshot().into_iter().map(|i| i.message).collect();
        assert_eq!(messages, vec!["entry 3", "entry 4", "entry 5", "entry 6", "entry 7"]);
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn test_device_entry_replaces_previous() {
        let ring = LogRing::new(10);
        ring.append("Connected", None);
        ring.append("Exposure started", Some("CCD Simulator"));
        ring.append("Focuser is online", Some("Focuser Simulator"));
        ring.append("Exposure done", Some("CCD Simulator"));
        let items = ring.snapshot();
        let messages: Vec<&str> = items.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages, vec!["Connected", "Focuser is online", "Exposure done"]);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let ring = LogRing::new(0);
        ring.append("a", None);
        ring.append("b", None);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.snapshot()[0].message, "b");
    }

    #[test]
    fn test_concurrent_append() {
        let ring = Arc::new(LogRing::new(100));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        ring.append(format!("{}-{}", t, i), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.len(), 100);
        // per-thread order survives interleaving
        for t in 0..4 {
            let seq: Vec<u32> = ring
                .snapshot()
                .iter()
                .filter_map(|i| i.message.strip_prefix(&format!("{}-", t)).map(|n| n.parse().unwrap()))
                .collect();
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
