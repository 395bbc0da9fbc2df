//! Core domain model, record store, and selection filters for Quill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "quill-core";

pub const DEFAULT_AUTHOR: &str = "Unknown";
pub const DEFAULT_CATEGORY: &str = "General";

/// Marker prefix for ids minted locally before the remote has assigned one.
/// A record carrying such an id is still pending publication.
pub const SYNTHETIC_ID_PREFIX: &str = "local-";

/// Category filter value that matches every record.
pub const ALL_CATEGORIES: &str = "all";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("quote text must not be empty")]
    EmptyText,
}

/// A single quote as held by the record store and exchanged with the remote.
///
/// Every stored record carries an id. Ids minted by [`synthetic_id`] (the
/// `local-` prefix) mean the record has no remote identity yet and must be
/// published on the next sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRecord {
    pub id: String,
    pub text: String,
    pub author: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

impl QuoteRecord {
    /// True when this record has never been acknowledged by the remote.
    pub fn needs_publish(&self) -> bool {
        self.id.starts_with(SYNTHETIC_ID_PREFIX)
    }
}

/// Mint a locally-unique id that is recognizably not remote-assigned.
pub fn synthetic_id() -> String {
    format!("{SYNTHETIC_ID_PREFIX}{}", Uuid::new_v4())
}

/// Loosely-shaped quote as found in import files, remote payloads, and user
/// submissions. Missing fields pick up defaults during [`QuoteDraft::normalize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl QuoteDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Trim strings, apply defaults, and mint a synthetic id when the draft
    /// carries none. A provided `updated_at` survives (import relies on it);
    /// otherwise `now` is stamped. Empty text is rejected.
    pub fn normalize(self, now: DateTime<Utc>) -> Result<QuoteRecord, CoreError> {
        let text = self.text.trim().to_string();
        if text.is_empty() {
            return Err(CoreError::EmptyText);
        }

        let author = match self.author.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => DEFAULT_AUTHOR.to_string(),
        };
        let category = match self.category.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => DEFAULT_CATEGORY.to_string(),
        };
        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => synthetic_id(),
        };

        Ok(QuoteRecord {
            id,
            text,
            author,
            category,
            updated_at: self.updated_at.unwrap_or(now),
        })
    }
}

/// The single in-memory owner of all resident quote records, most-recent-first.
///
/// One handle is constructed at boot and passed to every collaborator that
/// mutates it; nothing else holds an independent copy.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: Vec<QuoteRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a loaded snapshot, de-duplicating by id.
    pub fn with_records(records: Vec<QuoteRecord>) -> Self {
        Self {
            records: dedupe_by_id(records),
        }
    }

    /// Normalize and insert a submission at the front. Empty text declines
    /// the mutation; nothing else changes.
    pub fn add(&mut self, draft: QuoteDraft) -> Result<QuoteRecord, CoreError> {
        let now = Utc::now();
        let mut record = draft.normalize(now)?;
        record.updated_at = now;
        self.records.insert(0, record.clone());
        Ok(record)
    }

    /// Delete the record with the given id. Absent ids are a no-op; the
    /// return value reports whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        self.records.len() != before
    }

    /// Swap the entire resident collection, de-duplicating by id in case the
    /// caller handed over a snapshot with accidental doubles.
    pub fn replace_all(&mut self, records: Vec<QuoteRecord>) {
        self.records = dedupe_by_id(records);
    }

    /// Independent copy of the current collection; later store mutations are
    /// never visible through it.
    pub fn snapshot(&self) -> Vec<QuoteRecord> {
        self.records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct categories across the resident records, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> =
            self.records.iter().map(|r| r.category.clone()).collect();
        categories.sort();
        categories.dedup();
        categories
    }
}

/// Keep the last occurrence per id, preserving the relative order of the
/// records that survive.
pub fn dedupe_by_id(records: Vec<QuoteRecord>) -> Vec<QuoteRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<QuoteRecord> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    kept.reverse();
    kept
}

/// Fold `incoming` into `current` by recency: on a duplicate id the record
/// with the newer `updated_at` wins in place, otherwise incoming records are
/// appended. Used by JSON import.
pub fn merge_by_recency(
    current: Vec<QuoteRecord>,
    incoming: Vec<QuoteRecord>,
) -> Vec<QuoteRecord> {
    let mut merged = current;
    for record in incoming {
        match merged.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                if record.updated_at > existing.updated_at {
                    *existing = record;
                }
            }
            None => merged.push(record),
        }
    }
    merged
}

/// Derive the visible subset: case-insensitive category equality (or
/// [`ALL_CATEGORIES`]), then case-insensitive substring match of
/// `search_term` against text or author. Input order is preserved.
pub fn select(
    records: &[QuoteRecord],
    category_filter: &str,
    search_term: &str,
) -> Vec<QuoteRecord> {
    let term = search_term.trim().to_lowercase();
    records
        .iter()
        .filter(|r| {
            category_filter.eq_ignore_ascii_case(ALL_CATEGORIES)
                || r.category.eq_ignore_ascii_case(category_filter)
        })
        .filter(|r| {
            term.is_empty()
                || r.text.to_lowercase().contains(&term)
                || r.author.to_lowercase().contains(&term)
        })
        .cloned()
        .collect()
}

/// Starter quotes used when the durable namespace is empty at first boot.
pub fn seed_quotes() -> Vec<QuoteDraft> {
    [
        ("Stay hungry, stay foolish.", "Motivation"),
        ("Simplicity is the ultimate sophistication.", "Design"),
        (
            "Code is like humor. When you have to explain it, it's bad.",
            "Programming",
        ),
    ]
    .into_iter()
    .map(|(text, category)| QuoteDraft {
        category: Some(category.to_string()),
        ..QuoteDraft::new(text)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("ts")
    }

    fn record(id: &str, text: &str, secs: i64) -> QuoteRecord {
        QuoteRecord {
            id: id.to_string(),
            text: text.to_string(),
            author: DEFAULT_AUTHOR.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            updated_at: ts(secs),
        }
    }

    #[test]
    fn add_assigns_synthetic_id_and_defaults() {
        let mut store = RecordStore::new();
        let stored = store
            .add(QuoteDraft::new("  To be or not to be.  "))
            .expect("valid draft");

        assert_eq!(stored.text, "To be or not to be.");
        assert_eq!(stored.author, DEFAULT_AUTHOR);
        assert_eq!(stored.category, DEFAULT_CATEGORY);
        assert!(stored.needs_publish());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0], stored);
    }

    #[test]
    fn add_keeps_caller_supplied_id() {
        let mut store = RecordStore::new();
        let stored = store
            .add(QuoteDraft {
                id: Some("42".to_string()),
                ..QuoteDraft::new("A quote")
            })
            .expect("valid draft");
        assert_eq!(stored.id, "42");
        assert!(!stored.needs_publish());
    }

    #[test]
    fn add_rejects_blank_text_without_mutating() {
        let mut store = RecordStore::new();
        let err = store.add(QuoteDraft::new("   ")).unwrap_err();
        assert!(matches!(err, CoreError::EmptyText));
        assert!(store.is_empty());
    }

    #[test]
    fn add_inserts_most_recent_first() {
        let mut store = RecordStore::new();
        store.add(QuoteDraft::new("first")).unwrap();
        store.add(QuoteDraft::new("second")).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].text, "second");
        assert_eq!(snapshot[1].text, "first");
    }

    #[test]
    fn remove_is_noop_for_absent_id() {
        let mut store = RecordStore::new();
        let stored = store.add(QuoteDraft::new("keep me")).unwrap();
        assert!(!store.remove("no-such-id"));
        assert!(store.remove(&stored.id));
        assert!(!store.remove(&stored.id));
        assert!(store.snapshot().iter().all(|r| r.id != stored.id));
    }

    #[test]
    fn snapshot_is_a_defensive_copy() {
        let mut store = RecordStore::new();
        store.add(QuoteDraft::new("original")).unwrap();
        let snapshot = store.snapshot();
        store.add(QuoteDraft::new("later")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "original");
    }

    #[test]
    fn replace_all_dedupes_keeping_last_occurrence() {
        let mut store = RecordStore::new();
        store.replace_all(vec![
            record("1", "old", 1),
            record("2", "other", 1),
            record("1", "new", 2),
        ]);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "2");
        assert_eq!(snapshot[1].text, "new");
    }

    #[test]
    fn categories_are_sorted_and_distinct() {
        let store = RecordStore::with_records(vec![
            QuoteRecord {
                category: "Motivation".to_string(),
                ..record("1", "a", 1)
            },
            QuoteRecord {
                category: "Design".to_string(),
                ..record("2", "b", 1)
            },
            QuoteRecord {
                category: "Design".to_string(),
                ..record("3", "c", 1)
            },
        ]);
        assert_eq!(store.categories(), vec!["Design", "Motivation"]);
    }

    #[test]
    fn merge_by_recency_prefers_newer_timestamp() {
        let current = vec![record("1", "stale", 10), record("2", "fresh", 30)];
        let incoming = vec![
            record("1", "updated", 20),
            record("2", "older", 5),
            record("3", "brand new", 1),
        ];
        let merged = merge_by_recency(current, incoming);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].text, "updated");
        assert_eq!(merged[1].text, "fresh");
        assert_eq!(merged[2].text, "brand new");
    }

    #[test]
    fn select_filters_by_category_preserving_order() {
        let records = vec![
            QuoteRecord {
                category: "Design".to_string(),
                ..record("1", "form follows function", 1)
            },
            QuoteRecord {
                category: "Motivation".to_string(),
                ..record("2", "keep going", 1)
            },
            QuoteRecord {
                category: "Design".to_string(),
                ..record("3", "less is more", 1)
            },
        ];
        let visible = select(&records, "design", "");
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].id, "1");
        assert_eq!(visible[1].id, "3");
    }

    #[test]
    fn select_matches_text_or_author_case_insensitively() {
        let mut records = vec![
            record("1", "Brevity is the soul of wit", 1),
            record("2", "Nothing matches here", 1),
        ];
        records[1].author = "Brevity Jones".to_string();
        let visible = select(&records, ALL_CATEGORIES, "BREVITY");
        assert_eq!(visible.len(), 2);

        let none = select(&records, ALL_CATEGORIES, "absent needle");
        assert!(none.is_empty());
    }

    #[test]
    fn draft_json_defaults_missing_fields() {
        let draft: QuoteDraft =
            serde_json::from_str(r#"{"text":"hello"}"#).expect("parse draft");
        let rec = draft.normalize(ts(100)).expect("normalize");
        assert_eq!(rec.author, DEFAULT_AUTHOR);
        assert_eq!(rec.category, DEFAULT_CATEGORY);
        assert_eq!(rec.updated_at, ts(100));
        assert!(rec.needs_publish());
    }

    #[test]
    fn record_json_uses_camel_case_timestamp() {
        let json = serde_json::to_value(record("1", "x", 50)).expect("serialize");
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("updated_at").is_none());
    }
}
