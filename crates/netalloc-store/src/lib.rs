//! Persistence abstractions for the address allocation engine.
//!
//! This crate provides the storage seam the allocators are written against:
//!
//! - [`Record`]: a serde document with a table name, primary key and indexes
//! - [`Transaction`]: read/write access with select-for-update semantics
//! - [`Datastore`]: a factory for transactions
//! - [`MemoryStore`]: an optimistic in-memory backend
//! - [`RetryPolicy`]: bounded retry of transactions that lost a commit race
//!
//! # Architecture
//!
//! Every allocation attempt runs in one transaction:
//!
//! 1. The pool row (MAC range or subnet) is taken with [`Transaction::lock`]
//! 2. Candidate addresses are read and a new or reused row is written
//! 3. [`Transaction::commit`] validates every written row against the
//!    revision the transaction observed, and every unique key
//! 4. A lost race surfaces as [`StoreError::Conflict`] and the attempt is
//!    re-run by [`RetryPolicy::run`]
//!
//! # Example
//!
//! ```
//! use netalloc_store::{Datastore, MemoryStore, Transaction, records::Network};
//!
//! let store = MemoryStore::new();
//! let mut tx = store.begin();
//! tx.create(&Network::new("public")).unwrap();
//! tx.commit().unwrap();
//! ```

mod error;
pub mod ids;
mod memory;
pub mod records;
mod retry;
mod table;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryTransaction};
pub use retry::{RetryPolicy, Retryable};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A persisted document.
///
/// Records are stored as JSON values, so any backend can persist them
/// without knowing their shape.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table the record lives in.
    const TABLE: &'static str;

    /// Primary key.
    fn key(&self) -> String;

    /// Secondary unique key, enforced at commit.
    fn unique_key(&self) -> Option<String> {
        None
    }

    /// Non-unique index keys, queried with [`Transaction::find_indexed`].
    fn index_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Cardinality of a [`Transaction::find`] query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Stop at the first match.
    One,
    /// Return every match.
    All,
}

/// A unit of work against a [`Datastore`].
///
/// Reads see the transaction's own staged writes. Dropping a transaction
/// without calling [`Transaction::commit`] discards its writes.
///
/// `find` and `find_indexed` return rows in insertion order.
pub trait Transaction {
    /// Looks up a record by primary key.
    fn get<R: Record>(&mut self, key: &str) -> StoreResult<Option<R>>;

    /// Looks up a record by its unique key.
    fn get_unique<R: Record>(&mut self, unique_key: &str) -> StoreResult<Option<R>>;

    /// Scans a table with a filter predicate.
    fn find<R: Record>(&mut self, filter: &dyn Fn(&R) -> bool, scope: Scope)
        -> StoreResult<Vec<R>>;

    /// Returns the records carrying an index key.
    fn find_indexed<R: Record>(&mut self, index_key: &str) -> StoreResult<Vec<R>>;

    /// Inserts a new record. Fails with [`StoreError::Duplicate`] if the
    /// primary or unique key is already visible.
    fn create<R: Record>(&mut self, record: &R) -> StoreResult<()>;

    /// Replaces an existing record.
    fn update<R: Record>(&mut self, record: &R) -> StoreResult<()>;

    /// Reads a record and claims it for this transaction (select-for-update).
    ///
    /// Two transactions that lock the same row cannot both commit.
    fn lock<R: Record>(&mut self, key: &str) -> StoreResult<R>;

    /// Removes a record.
    fn delete<R: Record>(&mut self, key: &str) -> StoreResult<()>;

    /// Applies all staged writes atomically.
    fn commit(self) -> StoreResult<()>;
}

/// A source of transactions.
pub trait Datastore: Send + Sync {
    /// Transaction type borrowed from the store.
    type Tx<'a>: Transaction
    where
        Self: 'a;

    /// Starts a new transaction.
    fn begin(&self) -> Self::Tx<'_>;
}
