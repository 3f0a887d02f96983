//! Optimistic in-memory datastore.
//!
//! Transactions read committed rows under a shared lock and stage their
//! writes locally. At commit, under the exclusive lock, every staged row is
//! checked against the revision the transaction first observed and every
//! staged unique key against its current owner. Any mismatch aborts the
//! whole commit with [`StoreError::Conflict`].

use crate::table::Table;
use crate::{Datastore, Record, Scope, StoreError, StoreResult, Transaction};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

type RowId = (&'static str, String);

#[derive(Debug, Default)]
struct State {
    tables: HashMap<&'static str, Table>,
    next_seq: u64,
}

/// In-memory [`Datastore`] shared between threads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn count<R: Record>(&self) -> usize {
        self.state
            .read()
            .tables
            .get(R::TABLE)
            .map_or(0, Table::len)
    }
}

impl Datastore for MemoryStore {
    type Tx<'a> = MemoryTransaction<'a>;

    fn begin(&self) -> MemoryTransaction<'_> {
        MemoryTransaction {
            store: self,
            observed: HashMap::new(),
            staged: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRow {
    data: Value,
    unique: Option<String>,
    index: Vec<String>,
}

#[derive(Debug, Clone)]
enum Staged {
    Put(PendingRow),
    Delete,
}

/// A transaction against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    /// Revision of each row when first read (`None` = absent).
    observed: HashMap<RowId, Option<u64>>,
    staged: Vec<(RowId, Staged)>,
    positions: HashMap<RowId, usize>,
}

fn encode<R: Record>(record: &R) -> StoreResult<PendingRow> {
    let data = serde_json::to_value(record).map_err(|e| StoreError::codec(R::TABLE, e))?;
    Ok(PendingRow {
        data,
        unique: record.unique_key(),
        index: record.index_keys(),
    })
}

fn decode<R: Record>(data: Value) -> StoreResult<R> {
    serde_json::from_value(data).map_err(|e| StoreError::codec(R::TABLE, e))
}

impl MemoryTransaction<'_> {
    fn staged(&self, table: &'static str, key: &str) -> Option<&Staged> {
        self.positions
            .get(&(table, key.to_string()))
            .map(|&pos| &self.staged[pos].1)
    }

    fn stage(&mut self, table: &'static str, key: String, staged: Staged) {
        let id = (table, key);
        match self.positions.get(&id) {
            Some(&pos) => self.staged[pos].1 = staged,
            None => {
                self.positions.insert(id.clone(), self.staged.len());
                self.staged.push((id, staged));
            }
        }
    }

    fn observe(&mut self, table: &'static str, key: &str, revision: Option<u64>) {
        self.observed
            .entry((table, key.to_string()))
            .or_insert(revision);
    }

    /// Row data as this transaction sees it.
    fn visible(&mut self, table: &'static str, key: &str) -> Option<Value> {
        match self.staged(table, key) {
            Some(Staged::Put(row)) => return Some(row.data.clone()),
            Some(Staged::Delete) => return None,
            None => {}
        }

        let (revision, data) = {
            let state = self.store.state.read();
            match state.tables.get(table).and_then(|t| t.get(key)) {
                Some(row) => (Some(row.revision), Some(row.data.clone())),
                None => (None, None),
            }
        };
        self.observe(table, key, revision);
        data
    }

    /// Primary key currently holding a unique key, as this transaction sees it.
    fn visible_unique_owner(&mut self, table: &'static str, unique_key: &str) -> Option<String> {
        let staged_owner = self.staged.iter().find_map(|((t, key), staged)| match staged {
            Staged::Put(row) if *t == table && row.unique.as_deref() == Some(unique_key) => {
                Some(key.clone())
            }
            _ => None,
        });
        if staged_owner.is_some() {
            return staged_owner;
        }

        let committed_owner = {
            let state = self.store.state.read();
            state
                .tables
                .get(table)
                .and_then(|t| t.unique_owner(unique_key))
                .map(str::to_string)
        }?;
        // the committed owner no longer holds the key if this transaction
        // rewrote or removed it
        match self.staged(table, &committed_owner) {
            Some(_) => None,
            None => Some(committed_owner),
        }
    }

    /// Committed rows (from `rows`) merged with this transaction's staged rows.
    fn merge<R: Record>(
        &mut self,
        committed: Vec<(String, u64, Value)>,
        include_staged: impl Fn(&PendingRow) -> bool,
    ) -> Vec<Value> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        for (key, revision, data) in committed {
            seen.insert(key.clone());
            match self.staged(R::TABLE, &key) {
                Some(Staged::Put(row)) => {
                    if include_staged(row) {
                        merged.push(row.data.clone());
                    }
                }
                Some(Staged::Delete) => {}
                None => {
                    self.observe(R::TABLE, &key, Some(revision));
                    merged.push(data);
                }
            }
        }

        for ((table, key), staged) in &self.staged {
            if *table != R::TABLE || seen.contains(key) {
                continue;
            }
            if let Staged::Put(row) = staged {
                if include_staged(row) {
                    merged.push(row.data.clone());
                }
            }
        }
        merged
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get<R: Record>(&mut self, key: &str) -> StoreResult<Option<R>> {
        self.visible(R::TABLE, key).map(decode).transpose()
    }

    fn get_unique<R: Record>(&mut self, unique_key: &str) -> StoreResult<Option<R>> {
        match self.visible_unique_owner(R::TABLE, unique_key) {
            Some(key) => self.get(&key),
            None => Ok(None),
        }
    }

    fn find<R: Record>(
        &mut self,
        filter: &dyn Fn(&R) -> bool,
        scope: Scope,
    ) -> StoreResult<Vec<R>> {
        let committed = {
            let state = self.store.state.read();
            state.tables.get(R::TABLE).map_or_else(Vec::new, |t| {
                t.ordered()
                    .into_iter()
                    .map(|(key, row)| (key.to_string(), row.revision, row.data.clone()))
                    .collect()
            })
        };

        let mut found = Vec::new();
        for data in self.merge::<R>(committed, |_| true) {
            let record: R = decode(data)?;
            if filter(&record) {
                found.push(record);
                if scope == Scope::One {
                    break;
                }
            }
        }
        Ok(found)
    }

    fn find_indexed<R: Record>(&mut self, index_key: &str) -> StoreResult<Vec<R>> {
        let committed = {
            let state = self.store.state.read();
            state.tables.get(R::TABLE).map_or_else(Vec::new, |t| {
                t.indexed(index_key)
                    .into_iter()
                    .map(|(key, row)| (key.to_string(), row.revision, row.data.clone()))
                    .collect()
            })
        };

        self.merge::<R>(committed, |row| row.index.iter().any(|k| k == index_key))
            .into_iter()
            .map(decode)
            .collect()
    }

    fn create<R: Record>(&mut self, record: &R) -> StoreResult<()> {
        let key = record.key();
        if self.visible(R::TABLE, &key).is_some() {
            return Err(StoreError::duplicate(R::TABLE, key));
        }
        let row = encode(record)?;
        if let Some(unique_key) = &row.unique {
            if self.visible_unique_owner(R::TABLE, unique_key).is_some() {
                return Err(StoreError::duplicate(R::TABLE, unique_key.clone()));
            }
        }
        self.stage(R::TABLE, key, Staged::Put(row));
        Ok(())
    }

    fn update<R: Record>(&mut self, record: &R) -> StoreResult<()> {
        let key = record.key();
        if self.visible(R::TABLE, &key).is_none() {
            return Err(StoreError::not_found(R::TABLE, key));
        }
        let row = encode(record)?;
        if let Some(unique_key) = &row.unique {
            match self.visible_unique_owner(R::TABLE, unique_key) {
                Some(owner) if owner != key => {
                    return Err(StoreError::duplicate(R::TABLE, unique_key.clone()));
                }
                _ => {}
            }
        }
        self.stage(R::TABLE, key, Staged::Put(row));
        Ok(())
    }

    fn lock<R: Record>(&mut self, key: &str) -> StoreResult<R> {
        let data = self
            .visible(R::TABLE, key)
            .ok_or_else(|| StoreError::not_found(R::TABLE, key))?;
        let record: R = decode(data)?;
        // rewriting the row unchanged makes its revision part of the commit
        self.stage(R::TABLE, key.to_string(), Staged::Put(encode(&record)?));
        Ok(record)
    }

    fn delete<R: Record>(&mut self, key: &str) -> StoreResult<()> {
        if self.visible(R::TABLE, key).is_none() {
            return Err(StoreError::not_found(R::TABLE, key));
        }
        self.stage(R::TABLE, key.to_string(), Staged::Delete);
        Ok(())
    }

    fn commit(self) -> StoreResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let store = self.store;
        let mut state = store.state.write();

        for ((table, key), staged) in &self.staged {
            let expected = self.observed.get(&(*table, key.clone())).copied().flatten();
            let current = state.tables.get(table).and_then(|t| t.revision(key));
            if current != expected {
                debug!(table = *table, key = %key, ?expected, ?current, "Commit conflict on row revision");
                return Err(StoreError::conflict(*table, key.clone()));
            }

            let Staged::Put(row) = staged else { continue };
            let Some(unique_key) = &row.unique else { continue };
            let owner = state.tables.get(table).and_then(|t| t.unique_owner(unique_key));
            if let Some(owner) = owner {
                // the owner releases the key if this commit rewrites or removes it
                let released = match self.staged(*table, owner) {
                    Some(Staged::Delete) => true,
                    Some(Staged::Put(other)) => other.unique.as_ref() != Some(unique_key),
                    None => false,
                };
                if owner != key.as_str() && !released {
                    debug!(table = *table, unique_key = %unique_key, "Commit conflict on unique key");
                    return Err(StoreError::conflict(*table, unique_key.clone()));
                }
            }
        }

        let State { tables, next_seq } = &mut *state;
        for ((table, key), staged) in self.staged {
            let rows = tables.entry(table).or_default();
            match staged {
                Staged::Put(row) => rows.put(&key, row.data, row.unique, row.index, next_seq),
                Staged::Delete => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{IpAddressEntry, Network, Subnet};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn subnet(network_id: &str, cidr: &str) -> Subnet {
        Subnet::new(network_id, cidr.parse().unwrap(), Utc::now())
    }

    #[test]
    fn test_read_your_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        let network = Network::new("public");
        tx.create(&network).unwrap();

        let read: Option<Network> = tx.get(&network.id).unwrap();
        assert_eq!(read, Some(network.clone()));
        assert_eq!(store.count::<Network>(), 0);

        tx.commit().unwrap();
        assert_eq!(store.count::<Network>(), 1);
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin();
            tx.create(&Network::new("public")).unwrap();
        }
        assert_eq!(store.count::<Network>(), 0);
    }

    #[test]
    fn test_create_duplicate_key_fails() {
        let store = MemoryStore::new();
        let network = Network::new("public");
        let mut tx = store.begin();
        tx.create(&network).unwrap();
        let err = tx.create(&network).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[test]
    fn test_find_preserves_insertion_order() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        let first = subnet("n1", "10.0.0.0/24");
        let second = subnet("n1", "10.0.1.0/24");
        tx.create(&first).unwrap();
        tx.create(&second).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        let third = subnet("n1", "10.0.2.0/24");
        tx.create(&third).unwrap();

        let all: Vec<Subnet> = tx.find(&|_: &Subnet| true, Scope::All).unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str(), third.id.as_str()]);

        let one: Vec<Subnet> = tx.find(&|_: &Subnet| true, Scope::One).unwrap();
        assert_eq!(one.len(), 1);

        let indexed: Vec<Subnet> = tx.find_indexed(&Subnet::by_network("n1")).unwrap();
        assert_eq!(indexed.len(), 3);
    }

    #[test]
    fn test_find_hides_staged_deletes() {
        let store = MemoryStore::new();
        let network = Network::new("public");
        let mut tx = store.begin();
        tx.create(&network).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        tx.delete::<Network>(&network.id).unwrap();
        let all: Vec<Network> = tx.find(&|_: &Network| true, Scope::All).unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_concurrent_lock_conflicts() {
        let store = MemoryStore::new();
        let network = Network::new("public");
        let mut tx = store.begin();
        tx.create(&network).unwrap();
        tx.commit().unwrap();

        let mut a = store.begin();
        let mut b = store.begin();
        a.lock::<Network>(&network.id).unwrap();
        b.lock::<Network>(&network.id).unwrap();

        a.commit().unwrap();
        let err = b.commit().unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_concurrent_create_same_key_conflicts() {
        let store = MemoryStore::new();
        let network = Network::new("public");

        let mut a = store.begin();
        let mut b = store.begin();
        a.create(&network).unwrap();
        b.create(&network).unwrap();

        a.commit().unwrap();
        assert!(b.commit().unwrap_err().is_conflict());
    }

    #[test]
    fn test_unique_key_enforced() {
        let store = MemoryStore::new();
        let s = subnet("n1", "10.0.0.0/24");
        let now = Utc::now();

        let mut a = store.begin();
        let mut b = store.begin();
        a.create(&IpAddressEntry::new(&s, 5, now)).unwrap();
        b.create(&IpAddressEntry::new(&s, 5, now)).unwrap();
        a.commit().unwrap();
        assert!(b.commit().unwrap_err().is_conflict());

        let mut c = store.begin();
        let err = c.create(&IpAddressEntry::new(&s, 5, now)).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        let found: Option<IpAddressEntry> = c
            .get_unique(&IpAddressEntry::unique_key_for("n1", 5))
            .unwrap();
        assert_eq!(found.map(|e| e.address), Some(5));
    }

    #[test]
    fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let mut network = Network::new("public");
        let mut tx = store.begin();
        tx.create(&network).unwrap();
        tx.commit().unwrap();

        let mut a = store.begin();
        let _: Option<Network> = a.get(&network.id).unwrap();

        let mut b = store.begin();
        network.name = "renamed".to_string();
        b.update(&network).unwrap();
        b.commit().unwrap();

        network.name = "stale".to_string();
        a.update(&network).unwrap();
        assert!(a.commit().unwrap_err().is_conflict());
    }

    #[test]
    fn test_missing_rows() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        assert!(matches!(
            tx.lock::<Network>("nope"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            tx.delete::<Network>("nope"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            tx.update(&Network::new("x")),
            Err(StoreError::NotFound { .. })
        ));
    }
}
