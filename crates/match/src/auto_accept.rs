use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// One merchant-keyword → subcategory fast-path mapping with usage stats.
/// Statistics move only on confirmed decisions, never on suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAcceptEntry {
    pub merchant: String,
    pub subcategory_id: i64,
    #[serde(default)]
    pub match_count: u64,
    #[serde(default)]
    pub last_matched: Option<DateTime<Utc>>,
}

/// Flat merchant map consulted before rule evaluation. Matching is
/// contains-style over the normalized description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAcceptMap {
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub entries: Vec<AutoAcceptEntry>,
}

impl AutoAcceptMap {
    pub fn from_json(doc: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(doc)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn lookup(&self, description: &str) -> Option<&AutoAcceptEntry> {
        if self.case_sensitive {
            self.entries
                .iter()
                .find(|e| description.contains(e.merchant.as_str()))
        } else {
            let haystack = description.to_lowercase();
            self.entries
                .iter()
                .find(|e| haystack.contains(&e.merchant.to_lowercase()))
        }
    }

    /// Bumps the statistics for a merchant. Returns false when the merchant
    /// is not in the map.
    pub fn record_match(&mut self, merchant: &str, at: DateTime<Utc>) -> bool {
        match self.entries.iter_mut().find(|e| e.merchant == merchant) {
            Some(entry) => {
                entry.match_count += 1;
                entry.last_matched = Some(at);
                true
            }
            None => false,
        }
    }
}

/// Process-wide versioned holder for the auto-accept map. Reload swaps the
/// whole `Arc` so in-flight evaluations keep the snapshot they started with.
pub struct AutoAcceptStore {
    inner: RwLock<Arc<AutoAcceptMap>>,
}

impl AutoAcceptStore {
    pub fn new(map: AutoAcceptMap) -> Self {
        AutoAcceptStore {
            inner: RwLock::new(Arc::new(map)),
        }
    }

    pub fn snapshot(&self) -> Arc<AutoAcceptMap> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, map: AutoAcceptMap) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);
    }

    /// Copy-on-write statistics bump; concurrent readers see either the old
    /// or the new map, never a torn one.
    pub fn record_match(&self, merchant: &str, at: DateTime<Utc>) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = AutoAcceptMap::clone(&guard);
        let hit = next.record_match(merchant, at);
        if hit {
            *guard = Arc::new(next);
        }
        hit
    }
}

impl Default for AutoAcceptStore {
    fn default() -> Self {
        AutoAcceptStore::new(AutoAcceptMap::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(case_sensitive: bool) -> AutoAcceptMap {
        AutoAcceptMap {
            case_sensitive,
            entries: vec![
                AutoAcceptEntry {
                    merchant: "woolworths".to_string(),
                    subcategory_id: 10,
                    match_count: 0,
                    last_matched: None,
                },
                AutoAcceptEntry {
                    merchant: "Netflix".to_string(),
                    subcategory_id: 20,
                    match_count: 3,
                    last_matched: None,
                },
            ],
        }
    }

    #[test]
    fn lookup_is_contains_and_case_folded_by_default() {
        let m = map(false);
        assert_eq!(m.lookup("WOOLWORTHS 123 SYDNEY").unwrap().subcategory_id, 10);
        assert_eq!(m.lookup("netflix.com 874").unwrap().subcategory_id, 20);
        assert!(m.lookup("ALDI STORE").is_none());
    }

    #[test]
    fn case_sensitive_mode_respects_case() {
        let m = map(true);
        assert!(m.lookup("WOOLWORTHS 123").is_none());
        assert!(m.lookup("woolworths 123").is_some());
    }

    #[test]
    fn record_match_bumps_stats() {
        let mut m = map(false);
        let at = Utc::now();
        assert!(m.record_match("Netflix", at));
        let entry = m.entries.iter().find(|e| e.merchant == "Netflix").unwrap();
        assert_eq!(entry.match_count, 4);
        assert_eq!(entry.last_matched, Some(at));
        assert!(!m.record_match("unknown", at));
    }

    #[test]
    fn store_swap_is_atomic_for_existing_snapshots() {
        let store = AutoAcceptStore::new(map(false));
        let before = store.snapshot();
        store.replace(AutoAcceptMap::default());
        // The old snapshot is still intact; new readers see the empty map.
        assert!(before.lookup("WOOLWORTHS").is_some());
        assert!(store.snapshot().lookup("WOOLWORTHS").is_none());
    }

    #[test]
    fn store_record_match_persists_through_snapshot() {
        let store = AutoAcceptStore::new(map(false));
        assert!(store.record_match("woolworths", Utc::now()));
        let snap = store.snapshot();
        let entry = snap.entries.iter().find(|e| e.merchant == "woolworths").unwrap();
        assert_eq!(entry.match_count, 1);
    }

    #[test]
    fn json_round_trip() {
        let doc = map(false).to_json().unwrap();
        let back = AutoAcceptMap::from_json(&doc).unwrap();
        assert_eq!(back.entries.len(), 2);
        assert!(!back.case_sensitive);
    }
}
