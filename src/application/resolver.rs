use super::clock::{Clock, SystemClock};
use super::coalesce::{CoalesceMetrics, Coalescer};
use crate::config::ResolverConfig;
use crate::domain::account::{AccountId, AccountRecord, InstallPair, InstallationKey};
use crate::domain::context::RequestContext;
use crate::domain::ports::AccountStoreBox;
use crate::error::{Result, TenantError};
use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{Instrument, debug};

/// Result of one store lookup, shared by every index slot it was stored under.
#[derive(Debug, Clone)]
enum Lookup {
    Found(Arc<AccountRecord>),
    NotFound,
}

/// Immutable once built; a stale entry is replaced, never updated.
#[derive(Debug)]
struct CacheEntry {
    loaded_at: DateTime<Utc>,
    lookup: Lookup,
}

impl CacheEntry {
    fn outcome(&self) -> Result<Arc<AccountRecord>> {
        match &self.lookup {
            Lookup::Found(record) => Ok(record.clone()),
            Lookup::NotFound => Err(TenantError::NotFound),
        }
    }
}

#[derive(Default)]
struct Indexes {
    by_account: IndexMap<AccountId, Arc<CacheEntry>>,
    by_install: IndexMap<InstallPair, Arc<CacheEntry>>,
}

impl Indexes {
    fn probe(&self, key: &InstallationKey) -> Option<Arc<CacheEntry>> {
        let by_account = key.account().and_then(|id| self.by_account.get(&id));
        by_account
            .or_else(|| key.installation().and_then(|pair| self.by_install.get(&pair)))
            .cloned()
    }
}

/// Moves `key` to the back of the insertion order and trims the oldest entries beyond `max`.
fn put<K: Hash + Eq>(
    map: &mut IndexMap<K, Arc<CacheEntry>>,
    key: K,
    entry: Arc<CacheEntry>,
    max: Option<usize>,
) -> u64 {
    map.shift_remove(&key);
    map.insert(key, entry);
    let mut evicted = 0;
    if let Some(max) = max {
        while map.len() > max {
            map.shift_remove_index(0);
            evicted += 1;
        }
    }
    evicted
}

/// Counters describing resolver behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub hits: u64,
    pub misses: u64,
    pub store_calls: u64,
    pub evictions: u64,
    pub account_entries: usize,
    pub installation_entries: usize,
    pub coalesce: Option<CoalesceMetrics>,
}

/// TTL-bounded, dual-indexed cache in front of an [`AccountStore`](crate::domain::ports::AccountStore).
///
/// Outcomes (including not-found) are indexed under the request's keys and under the
/// resolved record's own keys, so either identification mode hits afterwards.
/// Transient store errors are returned to the caller and never cached.
pub struct AccountResolver {
    store: AccountStoreBox,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
    max_entries: Option<usize>,
    index: RwLock<Indexes>,
    /// Keyed on the full request key: requests that differ in either mode never share a load.
    coalescer: Option<Coalescer<InstallationKey, Arc<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    store_calls: AtomicU64,
    evictions: AtomicU64,
}

impl AccountResolver {
    pub fn new(store: AccountStoreBox) -> Self {
        Self::with_config(store, ResolverConfig::default())
    }

    pub fn with_config(store: AccountStoreBox, config: ResolverConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ttl: TimeDelta::from_std(config.ttl()).unwrap_or(TimeDelta::MAX),
            max_entries: config.max_entries,
            index: RwLock::new(Indexes::default()),
            coalescer: config
                .coalesce
                .then(|| Coalescer::new(config.join_timeout())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store_calls: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resolves `key` to its account.
    ///
    /// Returns `TenantError::NotFound` for unknown accounts (cached like a hit) and for
    /// keys with no usable identification mode (without consulting the store).
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        key: &InstallationKey,
    ) -> Result<Arc<AccountRecord>> {
        let span = ctx.span("resolve");
        async move {
            if key.account().is_none() && key.installation().is_none() {
                return Err(TenantError::NotFound);
            }

            let cached = self
                .index
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .probe(key);
            let now = self.clock.now();
            if let Some(entry) = cached {
                let age = now - entry.loaded_at;
                if age < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    // A clock set backwards makes `age` negative.
                    let expires_in = self.ttl.checked_sub(&age).unwrap_or(TimeDelta::MAX);
                    debug!(%key, %expires_in, "using cached account");
                    return entry.outcome();
                }
            }
            self.misses.fetch_add(1, Ordering::Relaxed);

            // The caller's deadline covers both its own store call and any wait on a
            // coalesced load led by another request.
            let entry = ctx
                .bound(async {
                    match &self.coalescer {
                        Some(coalescer) => Ok(coalescer
                            .execute_or_join(*key, || self.load(key))
                            .await?
                            .into_inner()),
                        None => self.load(key).await,
                    }
                })
                .await?;
            self.populate(key, entry.clone());
            entry.outcome()
        }
        .instrument(span)
        .await
    }

    /// Drops every entry reachable from `key`, including the resolved record's other key.
    pub fn invalidate(&self, key: &InstallationKey) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let mut keys = vec![*key];
        if let Some(entry) = index.probe(key)
            && let Lookup::Found(record) = &entry.lookup
        {
            keys.push(record.key);
        }
        for k in keys {
            if let Some(id) = k.account() {
                index.by_account.shift_remove(&id);
            }
            if let Some(pair) = k.installation() {
                index.by_install.shift_remove(&pair);
            }
        }
    }

    pub fn stats(&self) -> ResolverStats {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        ResolverStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            store_calls: self.store_calls.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            account_entries: index.by_account.len(),
            installation_entries: index.by_install.len(),
            coalesce: self.coalescer.as_ref().map(Coalescer::metrics),
        }
    }

    async fn load(&self, key: &InstallationKey) -> Result<Arc<CacheEntry>> {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        let lookup = match self.store.get_account_by_id(key).await {
            Ok(record) => Lookup::Found(Arc::new(record)),
            Err(TenantError::NotFound) => {
                debug!(%key, "account not found, caching negative result");
                Lookup::NotFound
            }
            Err(err) => return Err(err),
        };
        Ok(Arc::new(CacheEntry {
            loaded_at: self.clock.now(),
            lookup,
        }))
    }

    fn populate(&self, request: &InstallationKey, entry: Arc<CacheEntry>) {
        let mut accounts: Vec<AccountId> = request.account().into_iter().collect();
        let mut pairs: Vec<InstallPair> = request.installation().into_iter().collect();
        if let Lookup::Found(record) = &entry.lookup {
            accounts.extend(record.key.account());
            pairs.extend(record.key.installation());
        }
        accounts.dedup();
        pairs.dedup();

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        for id in accounts {
            evicted += put(&mut index.by_account, id, entry.clone(), self.max_entries);
        }
        for pair in pairs {
            evicted += put(&mut index.by_install, pair, entry.clone(), self.max_entries);
        }
        drop(index);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }
}
