//! Which contacts may auto-start a sequence.

use chrono::{DateTime, Utc};

use crate::config::SequenceConfig;
use crate::store::Contact;

pub trait EligibilityPolicy: Send + Sync {
    fn is_eligible(&self, contact: &Contact, now: DateTime<Utc>) -> bool;
}

/// Name allow-list plus a recency gate on contact creation.
///
/// An empty allow-list admits any name, including none. Otherwise the
/// contact's display name must contain one of the entries, ignoring case.
#[derive(Debug, Clone)]
pub struct NameAndRecencyPolicy {
    allowed_names: Vec<String>,
    max_age: chrono::Duration,
}

impl NameAndRecencyPolicy {
    pub fn new(allowed_names: &[String], max_age: std::time::Duration) -> Self {
        Self {
            allowed_names: allowed_names
                .iter()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
            max_age: chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &SequenceConfig) -> Self {
        Self::new(&config.allowed_names, config.max_contact_age)
    }

    fn name_allowed(&self, name: Option<&str>) -> bool {
        if self.allowed_names.is_empty() {
            return true;
        }
        let Some(name) = name.map(str::to_lowercase) else {
            return false;
        };
        self.allowed_names.iter().any(|a| name.contains(a.as_str()))
    }
}

impl EligibilityPolicy for NameAndRecencyPolicy {
    fn is_eligible(&self, contact: &Contact, now: DateTime<Utc>) -> bool {
        let recent = now.signed_duration_since(contact.created_at) <= self.max_age;
        recent && self.name_allowed(contact.name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn contact(name: Option<&str>, age_hours: i64) -> (Contact, DateTime<Utc>) {
        let now = Utc::now();
        let c = Contact {
            id: 1,
            phone: "5215550001".into(),
            name: name.map(str::to_string),
            tag: None,
            attributes: serde_json::json!({}),
            created_at: now - chrono::Duration::hours(age_hours),
        };
        (c, now)
    }

    #[test]
    fn empty_list_checks_recency_only() {
        let policy = NameAndRecencyPolicy::new(&[], Duration::from_secs(24 * 3600));
        let (fresh, now) = contact(None, 1);
        assert!(policy.is_eligible(&fresh, now));
        let (old, now) = contact(Some("Ana"), 25);
        assert!(!policy.is_eligible(&old, now));
    }

    #[test]
    fn allow_list_matches_case_insensitively() {
        let policy = NameAndRecencyPolicy::new(&["ana".into()], Duration::from_secs(24 * 3600));
        let (ana, now) = contact(Some("María Ana López"), 1);
        assert!(policy.is_eligible(&ana, now));
        let (pedro, now) = contact(Some("Pedro"), 1);
        assert!(!policy.is_eligible(&pedro, now));
        let (nameless, now) = contact(None, 1);
        assert!(!policy.is_eligible(&nameless, now));
    }
}
