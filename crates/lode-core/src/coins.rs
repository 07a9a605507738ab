//! Coin store interfaces: the backing view and the in-memory cache.
//!
//! The coin set is two tiers. A slow, durable [`CoinView`] (disk in
//! production) answers point lookups and may fail transiently. A fast
//! [`CoinCache`] sits in front of it, holding plain coins plus *spent
//! sentinels*: entries recording that a coin was consumed in memory but the
//! spentness has not been flushed down yet. The sentinel distinction is what
//! makes [`CoinCache::insert_if_absent`] safe to use with data re-read from
//! the backing view.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crate::error::StoreError;
use crate::types::{Coin, OutPoint};

/// Read access to a durable coin store.
///
/// Lookups may block (disk, network) and may fail transiently. `None` means
/// the outpoint does not exist unspent in this view.
pub trait CoinView: Send + Sync {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;
}

/// An entry in the in-memory coin cache.
///
/// `Spent` records that the coin was consumed by an in-memory operation
/// while an unspent copy may still exist in the backing view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEntry {
    Unspent(Coin),
    Spent,
}

type EntryMap = HashMap<OutPoint, CacheEntry>;

/// Fast in-memory front of the coin store.
///
/// Mutation goes through `&mut self`; [`CoinCache::reader`] hands out a
/// read-only handle that concurrent lookups (e.g. prefetch workers) can hold
/// for the duration of one call. The internal lock is uncontended whenever
/// no reader handles are live.
#[derive(Default)]
pub struct CoinCache {
    entries: Arc<RwLock<EntryMap>>,
}

/// Read-only handle onto a [`CoinCache`], safe to share across threads.
#[derive(Clone)]
pub struct CacheReader {
    entries: Arc<RwLock<EntryMap>>,
}

impl CacheReader {
    /// True iff any entry (spent or unspent) exists for the outpoint.
    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(outpoint)
    }
}

impl CoinCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shareable read-only handle onto this cache.
    pub fn reader(&self) -> CacheReader {
        CacheReader {
            entries: Arc::clone(&self.entries),
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, EntryMap> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&mut self) -> RwLockWriteGuard<'_, EntryMap> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff any entry (spent or unspent) exists for the outpoint.
    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.read_entries().contains_key(outpoint)
    }

    /// The entry for an outpoint, if any.
    pub fn get(&self, outpoint: &OutPoint) -> Option<CacheEntry> {
        self.read_entries().get(outpoint).cloned()
    }

    /// The unspent coin for an outpoint. `None` if absent or spent.
    pub fn unspent(&self, outpoint: &OutPoint) -> Option<Coin> {
        match self.read_entries().get(outpoint) {
            Some(CacheEntry::Unspent(coin)) => Some(coin.clone()),
            _ => None,
        }
    }

    /// Insert or replace the entry for an outpoint.
    pub fn insert(&mut self, outpoint: OutPoint, coin: Coin) {
        self.write_entries().insert(outpoint, CacheEntry::Unspent(coin));
    }

    /// Insert only when no entry exists for the outpoint.
    ///
    /// A silent no-op when any entry — including a spent sentinel — is
    /// already present. This is the map-level "emplace, do not overwrite":
    /// a coin re-read from the backing view must never resurrect an output
    /// that was spent in memory. Returns whether the coin was inserted.
    pub fn insert_if_absent(&mut self, outpoint: OutPoint, coin: Coin) -> bool {
        let mut entries = self.write_entries();
        if entries.contains_key(&outpoint) {
            return false;
        }
        entries.insert(outpoint, CacheEntry::Unspent(coin));
        true
    }

    /// Record the outpoint as spent, leaving a sentinel entry.
    pub fn spend(&mut self, outpoint: &OutPoint) {
        self.write_entries().insert(outpoint.clone(), CacheEntry::Spent);
    }

    /// Number of entries, spent sentinels included.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// A point-in-time copy of all entries. Used for inspection and tests.
    pub fn snapshot(&self) -> Vec<(OutPoint, CacheEntry)> {
        self.read_entries()
            .iter()
            .map(|(op, entry)| (op.clone(), entry.clone()))
            .collect()
    }
}

/// Hash-map-backed [`CoinView`] for tests and benchmarks.
///
/// Supports per-outpoint and global failure injection and an optional
/// artificial per-lookup delay to stand in for disk latency. Every lookup is
/// recorded so tests can assert which outpoints were actually requested.
#[derive(Default)]
pub struct MemoryCoinView {
    coins: HashMap<OutPoint, Coin>,
    failing: HashSet<OutPoint>,
    fail_all: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<OutPoint>>,
}

impl MemoryCoinView {
    pub fn new() -> Self {
        Self::default()
    }

    /// A view whose every lookup sleeps for `delay` first.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }

    /// Make lookups of this outpoint fail with [`StoreError::ReadFailed`].
    pub fn fail_on(&mut self, outpoint: OutPoint) {
        self.failing.insert(outpoint);
    }

    /// Make every lookup fail with [`StoreError::ReadFailed`].
    pub fn fail_all(&mut self) {
        self.fail_all = true;
    }

    /// All outpoints requested so far, in request order.
    pub fn requests(&self) -> Vec<OutPoint> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CoinView for MemoryCoinView {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outpoint.clone());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.fail_all || self.failing.contains(outpoint) {
            return Err(StoreError::ReadFailed("injected failure".into()));
        }
        Ok(self.coins.get(outpoint).cloned())
    }
}
