//! Natural keys and the insert-side duplicate filter.
//!
//! The storefront exposes no stable identifier, so a record's identity is
//! its name plus the scope it was listed under:
//!
//! | kind      | key parts                              |
//! |-----------|----------------------------------------|
//! | category  | name, city                             |
//! | merchant  | name, city                             |
//! | menu-item | name, merchant name, city, menu section |
//!
//! Each part is trimmed, lowercased and has inner whitespace collapsed to a
//! single space. Parts are joined with U+001F so `"a b" + "c"` and
//! `"a" + "b c"` never collide.

use crate::extract::{CandidateRecord, RecordKind};
use crate::store::{RecordStore, StoreError};
use std::collections::HashSet;
use tracing::{debug, trace};

const KEY_SEPARATOR: char = '\u{1f}';

/// Normalizes one key component.
pub fn normalize_key_part(part: &str) -> String {
    part.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Joins normalized parts into a key.
pub fn compose_key(parts: &[&str]) -> String {
    let normalized: Vec<String> = parts.iter().map(|p| normalize_key_part(p)).collect();
    normalized.join(&KEY_SEPARATOR.to_string())
}

/// Natural key of `record`. Pure; depends only on the record.
pub fn natural_key(record: &CandidateRecord) -> String {
    let parent = record.parent();
    let name = record.name();

    match record.kind() {
        RecordKind::Category | RecordKind::Merchant => compose_key(&[name, &parent.city]),
        RecordKind::MenuItem => {
            let merchant = parent.merchant.as_deref().unwrap_or_default();
            let section = record.text("category").unwrap_or_default();
            compose_key(&[name, merchant, &parent.city, section])
        }
    }
}

/// A record paired with its natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed {
    pub key: String,
    pub record: CandidateRecord,
}

/// Gate decision for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New(String),
    Duplicate(String),
}

/// A batch split by [`DedupGate::partition`].
#[derive(Debug, Default)]
pub struct Partition {
    pub to_insert: Vec<Keyed>,
    pub duplicates: Vec<Keyed>,
    /// Records whose store lookup failed.
    pub errors: Vec<(CandidateRecord, StoreError)>,
}

/// Filters candidates already present in the store or earlier in the run.
pub struct DedupGate<'a> {
    store: &'a dyn RecordStore,
    admitted: HashSet<(RecordKind, String)>,
}

impl<'a> DedupGate<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store, admitted: HashSet::new() }
    }

    /// Checks one record. A key admitted once is a duplicate from then on,
    /// whether or not the caller's insert succeeded.
    pub fn admit(&mut self, record: &CandidateRecord) -> Result<Admission, StoreError> {
        let key = natural_key(record);
        let slot = (record.kind(), key);

        if self.admitted.contains(&slot) {
            trace!("`{}` repeated within the run", record.name());
            return Ok(Admission::Duplicate(slot.1));
        }
        if self.store.contains_key(slot.0, &slot.1)? {
            trace!("`{}` already stored", record.name());
            return Ok(Admission::Duplicate(slot.1));
        }

        let key = slot.1.clone();
        self.admitted.insert(slot);
        Ok(Admission::New(key))
    }

    /// Splits a batch into new records and duplicates, preserving order.
    pub fn partition(&mut self, batch: Vec<CandidateRecord>) -> Partition {
        let mut out = Partition::default();

        for record in batch {
            match self.admit(&record) {
                Ok(Admission::New(key)) => out.to_insert.push(Keyed { key, record }),
                Ok(Admission::Duplicate(key)) => out.duplicates.push(Keyed { key, record }),
                Err(e) => {
                    debug!("Lookup failed for `{}`: {}", record.name(), e);
                    out.errors.push((record, e));
                }
            }
        }

        debug!(
            "Dedup: {} new, {} duplicate, {} failed",
            out.to_insert.len(),
            out.duplicates.len(),
            out.errors.len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Category, FieldValue, ParentContext};
    use crate::store::{InsertOutcome, SessionLog, SqliteStore};

    fn merchant(name: &str, city: &str) -> CandidateRecord {
        CandidateRecord::named(RecordKind::Merchant, name, ParentContext::city(city))
    }

    #[test]
    fn test_normalize_key_part() {
        assert_eq!(normalize_key_part("  Pizza   PLACE \n"), "pizza place");
        assert_eq!(normalize_key_part("São Paulo"), "são paulo");
        assert_eq!(normalize_key_part(""), "");
    }

    #[test]
    fn test_natural_key_ignores_case_and_whitespace() {
        assert_eq!(natural_key(&merchant("Pizza Place", "X")), natural_key(&merchant(" pizza  place", "x ")));
        assert_ne!(natural_key(&merchant("Pizza Place", "X")), natural_key(&merchant("Pizza Place", "Y")));
    }

    #[test]
    fn test_natural_key_parts_do_not_bleed() {
        assert_ne!(compose_key(&["a b", "c"]), compose_key(&["a", "b c"]));
    }

    #[test]
    fn test_menu_item_key_scope() {
        let parent = ParentContext::city("X").with_merchant("Forno Bom", Some(7));
        let item = |section: &str| {
            CandidateRecord::named(RecordKind::MenuItem, "Calabresa", parent.clone())
                .with_value("category", None, Some(FieldValue::Text(section.into())))
        };

        assert_ne!(natural_key(&item("Pizzas")), natural_key(&item("Promoções")));
        assert_eq!(natural_key(&item("Pizzas")), natural_key(&item("PIZZAS")));

        let elsewhere = CandidateRecord::named(
            RecordKind::MenuItem,
            "Calabresa",
            ParentContext::city("X").with_merchant("Outro", None),
        )
        .with_value("category", None, Some(FieldValue::Text("Pizzas".into())));
        assert_ne!(natural_key(&item("Pizzas")), natural_key(&elsewhere));
    }

    #[test]
    fn test_partition_against_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("t.db")).unwrap();
        let mut gate = DedupGate::new(&store);

        let batch = vec![
            merchant("Pizza Place", "X"),
            merchant("Burger Place", "X"),
            merchant("PIZZA PLACE ", "X"),
        ];
        let out = gate.partition(batch);

        assert_eq!(out.to_insert.len(), 2);
        assert_eq!(out.duplicates.len(), 1);
        assert!(out.errors.is_empty());
        assert_eq!(out.to_insert[0].record.name(), "Pizza Place");
        assert_eq!(out.to_insert[1].record.name(), "Burger Place");
    }

    #[test]
    fn test_partition_sees_stored_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("t.db")).unwrap();
        let stored = merchant("Pizza Place", "X");
        store.insert(&natural_key(&stored), &stored).unwrap();

        let mut gate = DedupGate::new(&store);
        let out = gate.partition(vec![merchant("pizza place", "X"), merchant("Pizza Place", "Y")]);
        assert_eq!(out.duplicates.len(), 1);
        assert_eq!(out.to_insert.len(), 1);
        assert_eq!(out.to_insert[0].record.parent().city, "Y");
    }

    #[test]
    fn test_same_key_in_different_tables_is_not_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("t.db")).unwrap();
        let mut gate = DedupGate::new(&store);

        let category = CandidateRecord::named(RecordKind::Category, "Pizza", ParentContext::city("X"));
        assert!(matches!(gate.admit(&merchant("Pizza", "X")).unwrap(), Admission::New(_)));
        assert!(matches!(gate.admit(&category).unwrap(), Admission::New(_)));
    }

    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn contains_key(&self, _: RecordKind, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
        }
        fn insert(&self, _: &str, _: &CandidateRecord) -> Result<InsertOutcome, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
        }
        fn known_categories(&self, _: &str) -> Result<Vec<Category>, StoreError> {
            Ok(Vec::new())
        }
        fn merchant_id(&self, _: &str, _: &str) -> Result<Option<i64>, StoreError> {
            Ok(None)
        }
        fn log_session(&self, _: &SessionLog) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_lookup_failures_are_collected() {
        let store = BrokenStore;
        let mut gate = DedupGate::new(&store);
        let out = gate.partition(vec![merchant("A place", "X"), merchant("B place", "X")]);
        assert!(out.to_insert.is_empty());
        assert_eq!(out.errors.len(), 2);
    }
}
