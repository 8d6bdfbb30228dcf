//! Ring buffer of recent raw message payloads keyed by external id.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub struct MessageCache {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Default)]
struct Ring {
    order: VecDeque<String>,
    payloads: HashMap<String, serde_json::Value>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Ring::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store a payload. Re-inserting an id replaces the payload in place.
    pub fn insert(&self, id: &str, payload: serde_json::Value) {
        let mut ring = self.lock();
        if ring.payloads.insert(id.to_string(), payload).is_some() {
            return;
        }
        ring.order.push_back(id.to_string());
        while ring.order.len() > self.capacity {
            if let Some(old) = ring.order.pop_front() {
                ring.payloads.remove(&old);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.lock().payloads.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
