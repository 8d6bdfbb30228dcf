//! In-memory per-contact activity: last inbound/outbound times and the most
//! recent inbound texts. Shared by the sequence engine and the outbound
//! sender of one session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Inbound texts kept per contact.
const RECENT_TEXTS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct ContactActivity {
    pub last_inbound: Option<DateTime<Utc>>,
    pub last_outbound: Option<DateTime<Utc>>,
    /// Newest last.
    pub recent_inbound: VecDeque<String>,
}

impl ContactActivity {
    fn touched(&self) -> Option<DateTime<Utc>> {
        self.last_inbound.max(self.last_outbound)
    }
}

pub struct ActivityTracker {
    max_contacts: usize,
    contacts: Mutex<HashMap<String, ContactActivity>>,
}

impl ActivityTracker {
    pub fn new(max_contacts: usize) -> Self {
        Self {
            max_contacts: max_contacts.max(1),
            contacts: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ContactActivity>> {
        self.contacts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn entry<'a>(
        &self,
        map: &'a mut HashMap<String, ContactActivity>,
        phone: &str,
    ) -> &'a mut ContactActivity {
        if !map.contains_key(phone) && map.len() >= self.max_contacts {
            let stalest = map
                .iter()
                .min_by_key(|(_, a)| a.touched())
                .map(|(p, _)| p.clone());
            if let Some(p) = stalest {
                map.remove(&p);
            }
        }
        map.entry(phone.to_string()).or_default()
    }

    pub fn record_inbound(&self, phone: &str, text: Option<&str>, at: DateTime<Utc>) {
        let mut map = self.lock();
        let activity = self.entry(&mut map, phone);
        activity.last_inbound = activity.last_inbound.max(Some(at));
        if let Some(text) = text {
            activity.recent_inbound.push_back(text.to_string());
            while activity.recent_inbound.len() > RECENT_TEXTS {
                activity.recent_inbound.pop_front();
            }
        }
    }

    pub fn record_outbound(&self, phone: &str, at: DateTime<Utc>) {
        let mut map = self.lock();
        let activity = self.entry(&mut map, phone);
        activity.last_outbound = activity.last_outbound.max(Some(at));
    }

    pub fn get(&self, phone: &str) -> Option<ContactActivity> {
        self.lock().get(phone).cloned()
    }

    /// Up to `n` most recent inbound texts, newest first.
    pub fn recent_inbound(&self, phone: &str, n: usize) -> Vec<String> {
        self.lock()
            .get(phone)
            .map(|a| a.recent_inbound.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn keeps_latest_timestamps_and_texts() {
        let tracker = ActivityTracker::new(10);
        let t0 = Utc::now();
        tracker.record_inbound("521", Some("uno"), t0);
        tracker.record_inbound("521", Some("dos"), t0 - Duration::seconds(5));
        tracker.record_outbound("521", t0 + Duration::seconds(1));

        let a = tracker.get("521").unwrap();
        assert_eq!(a.last_inbound, Some(t0));
        assert_eq!(a.last_outbound, Some(t0 + Duration::seconds(1)));
        assert_eq!(tracker.recent_inbound("521", 2), vec!["dos", "uno"]);
    }

    #[test]
    fn text_history_and_contacts_are_bounded() {
        let tracker = ActivityTracker::new(2);
        let t0 = Utc::now();
        for i in 0..8 {
            tracker.record_inbound("a", Some(&i.to_string()), t0);
        }
        assert_eq!(tracker.recent_inbound("a", 10).len(), RECENT_TEXTS);

        tracker.record_inbound("b", None, t0 + Duration::seconds(1));
        tracker.record_inbound("c", None, t0 + Duration::seconds(2));
        assert_eq!(tracker.len(), 2);
        assert!(tracker.get("a").is_none());
    }
}
