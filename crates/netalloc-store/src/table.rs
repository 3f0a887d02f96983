//! Committed row storage for one table.
//!
//! Like the rest of the store, lookups here never create entries: every
//! accessor returns `Option` and only [`Table::put`] inserts.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A committed row.
#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    /// Insertion order across the whole store.
    pub seq: u64,
    /// Bumped on every committed write.
    pub revision: u64,
    pub data: Value,
    pub unique: Option<String>,
    pub index: Vec<String>,
}

/// Rows of one table plus their unique and secondary indexes.
#[derive(Debug, Default)]
pub(crate) struct Table {
    rows: HashMap<String, StoredRow>,
    unique: HashMap<String, String>,
    index: HashMap<String, HashSet<String>>,
}

impl Table {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, key: &str) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    pub fn revision(&self, key: &str) -> Option<u64> {
        self.rows.get(key).map(|row| row.revision)
    }

    /// Primary key of the row holding a unique key.
    pub fn unique_owner(&self, unique_key: &str) -> Option<&str> {
        self.unique.get(unique_key).map(String::as_str)
    }

    /// All rows ordered by insertion.
    pub fn ordered(&self) -> Vec<(&str, &StoredRow)> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|(key, row)| (key.as_str(), row))
            .collect();
        rows.sort_by_key(|(_, row)| row.seq);
        rows
    }

    /// Rows carrying an index key, ordered by insertion.
    pub fn indexed(&self, index_key: &str) -> Vec<(&str, &StoredRow)> {
        let Some(keys) = self.index.get(index_key) else {
            return Vec::new();
        };
        let mut rows: Vec<_> = keys
            .iter()
            .filter_map(|key| self.rows.get_key_value(key))
            .map(|(key, row)| (key.as_str(), row))
            .collect();
        rows.sort_by_key(|(_, row)| row.seq);
        rows
    }

    /// Inserts or replaces a row. `next_seq` is consumed only on insert.
    pub fn put(
        &mut self,
        key: &str,
        data: Value,
        unique: Option<String>,
        index: Vec<String>,
        next_seq: &mut u64,
    ) {
        let (seq, revision) = match self.remove(key) {
            Some(old) => (old.seq, old.revision + 1),
            None => {
                *next_seq += 1;
                (*next_seq, 1)
            }
        };

        if let Some(unique_key) = &unique {
            self.unique.insert(unique_key.clone(), key.to_string());
        }
        for index_key in &index {
            self.index
                .entry(index_key.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.rows.insert(
            key.to_string(),
            StoredRow {
                seq,
                revision,
                data,
                unique,
                index,
            },
        );
    }

    /// Removes a row and its index entries.
    pub fn remove(&mut self, key: &str) -> Option<StoredRow> {
        let row = self.rows.remove(key)?;

        if let Some(unique_key) = &row.unique {
            // another row may already have claimed the key in this commit
            if self.unique.get(unique_key).map(String::as_str) == Some(key) {
                self.unique.remove(unique_key);
            }
        }
        for index_key in &row.index {
            if let Some(keys) = self.index.get_mut(index_key) {
                keys.remove(key);
                if keys.is_empty() {
                    self.index.remove(index_key);
                }
            }
        }
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_get_never_creates_entries() {
        let table = Table::default();
        assert!(table.get("missing").is_none());
        assert!(table.revision("missing").is_none());
        assert!(table.indexed("idx").is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_put_bumps_revision_and_keeps_seq() {
        let mut table = Table::default();
        let mut seq = 0;

        table.put("a", json!(1), None, vec![], &mut seq);
        table.put("b", json!(2), None, vec![], &mut seq);
        table.put("a", json!(3), None, vec![], &mut seq);

        assert_eq!(table.revision("a"), Some(2));
        assert_eq!(table.get("a").map(|r| r.seq), Some(1));
        let order: Vec<&str> = table.ordered().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_indexes_follow_updates() {
        let mut table = Table::default();
        let mut seq = 0;

        table.put("a", json!(1), Some("u1".into()), vec!["x".into()], &mut seq);
        assert_eq!(table.unique_owner("u1"), Some("a"));
        assert_eq!(table.indexed("x").len(), 1);

        table.put("a", json!(2), Some("u2".into()), vec!["y".into()], &mut seq);
        assert_eq!(table.unique_owner("u1"), None);
        assert_eq!(table.unique_owner("u2"), Some("a"));
        assert!(table.indexed("x").is_empty());
        assert_eq!(table.indexed("y").len(), 1);

        table.remove("a");
        assert_eq!(table.unique_owner("u2"), None);
        assert!(table.indexed("y").is_empty());
    }

    #[test]
    fn test_remove_keeps_unique_claimed_by_other_row() {
        let mut table = Table::default();
        let mut seq = 0;

        table.put("a", json!(1), Some("u".into()), vec![], &mut seq);
        table.put("b", json!(2), Some("u".into()), vec![], &mut seq);
        table.remove("a");
        assert_eq!(table.unique_owner("u"), Some("b"));
    }
}
