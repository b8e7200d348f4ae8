//! A thread-safe in-memory snapshot of campaigns, backed by a [`PersistentStore`].
//!
//! Readers (matching) get an `Arc` to an immutable [`CacheSnapshot`] that is not affected by
//! further writes. Writers build a complete new snapshot and swap it in, so a reader never observes
//! a partially-updated list.
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    campaign::{parse_records, Campaign, Timestamp, TryParse},
    store::PersistentStore,
    Result,
};

/// Schema version written into every [`CacheEnvelope`]. Envelopes carrying any other version are
/// discarded on load.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

pub(crate) const CACHE_KEY: &str = "campaign_cache";

/// Persisted form of the cache.
#[derive(Debug, Deserialize)]
pub struct CacheEnvelope {
    #[allow(missing_docs)]
    pub version: u32,
    /// When the campaigns were fetched.
    pub timestamp: Timestamp,
    #[allow(missing_docs)]
    pub campaigns: Vec<TryParse<Campaign>>,
}

#[derive(Serialize)]
struct CacheEnvelopeRef<'a> {
    version: u32,
    timestamp: Timestamp,
    campaigns: &'a [Arc<Campaign>],
}

/// Immutable view of the cached campaigns.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    /// Campaigns in server order.
    pub campaigns: Vec<Arc<Campaign>>,
    /// When the campaigns were fetched. `None` if nothing has been loaded yet.
    pub fetched_at: Option<Timestamp>,
}

impl CacheSnapshot {
    /// Age of the snapshot at `now`. Clock skew never yields a negative age.
    pub fn age(&self, now: Timestamp) -> Option<Duration> {
        let fetched_at = self.fetched_at?;
        Some((now - fetched_at).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Result of [`MemoryCache::load_from_persistent_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedCache {
    /// Number of campaigns now in memory.
    pub count: usize,
    /// Age of the loaded data. `None` when nothing usable was stored.
    pub age: Option<Duration>,
    /// Data is older than the TTL. It is still served, but callers should refresh.
    pub stale: bool,
}

/// Configuration for [`MemoryCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    #[allow(missing_docs)]
    pub ttl: Duration,
    /// Upper bound on the number of campaigns kept in memory.
    pub max_campaigns: usize,
    /// Schema version expected from persisted envelopes.
    pub schema_version: u32,
}

/// Authoritative in-process campaign snapshot.
pub struct MemoryCache {
    snapshot: RwLock<Arc<CacheSnapshot>>,
    store: Arc<dyn PersistentStore>,
    config: MemoryCacheConfig,
}

impl MemoryCache {
    /// Create an empty cache persisting into `store`.
    pub fn new(store: Arc<dyn PersistentStore>, config: MemoryCacheConfig) -> MemoryCache {
        MemoryCache {
            snapshot: RwLock::new(Arc::default()),
            store,
            config,
        }
    }

    /// Get the currently active snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        self.snapshot
            .read()
            .expect("thread holding cache lock should not panic")
            .clone()
    }

    /// Whether the current snapshot is empty or older than the TTL.
    pub fn needs_refresh(&self, now: Timestamp) -> bool {
        let snapshot = self.snapshot();
        match snapshot.age(now) {
            Some(age) => snapshot.campaigns.is_empty() || age > self.config.ttl,
            None => true,
        }
    }

    /// Load the persisted envelope into memory.
    ///
    /// A missing, undecodable or version-mismatched envelope results in an empty cache. Stale data
    /// is returned as-is with [`LoadedCache::stale`] set.
    pub async fn load_from_persistent_store(&self, now: Timestamp) -> Result<LoadedCache> {
        let Some(bytes) = self.store.get(CACHE_KEY).await? else {
            log::debug!(target: "nudge", "no persisted campaign cache");
            self.swap(CacheSnapshot::default());
            return Ok(LoadedCache {
                count: 0,
                age: None,
                stale: false,
            });
        };

        let envelope = match serde_json::from_slice::<CacheEnvelope>(&bytes) {
            Ok(envelope) if envelope.version == self.config.schema_version => envelope,
            Ok(envelope) => {
                log::warn!(target: "nudge",
                           found = envelope.version,
                           expected = self.config.schema_version;
                           "discarding persisted campaign cache with mismatched version");
                self.discard().await;
                return Ok(LoadedCache {
                    count: 0,
                    age: None,
                    stale: false,
                });
            }
            Err(err) => {
                log::warn!(target: "nudge", "discarding corrupted campaign cache: {err}");
                self.discard().await;
                return Ok(LoadedCache {
                    count: 0,
                    age: None,
                    stale: false,
                });
            }
        };

        let records = parse_records(envelope.campaigns);
        let campaigns = cap_campaigns(records, self.config.max_campaigns);
        let snapshot = CacheSnapshot {
            campaigns,
            fetched_at: Some(envelope.timestamp),
        };
        let age = snapshot.age(now);
        let stale = age.is_some_and(|age| age > self.config.ttl);
        let count = snapshot.campaigns.len();
        self.swap(snapshot);

        if stale {
            log::info!(target: "nudge", count; "loaded stale campaign cache, refresh needed");
        } else {
            log::debug!(target: "nudge", count; "loaded campaign cache");
        }

        Ok(LoadedCache { count, age, stale })
    }

    /// Replace the whole campaign list and persist it.
    ///
    /// Memory is swapped before persisting, so an interrupted or failed write never leaves
    /// readers with a partial list.
    pub async fn replace(&self, campaigns: Vec<Arc<Campaign>>, now: Timestamp) -> Result<()> {
        let campaigns = cap_campaigns(campaigns, self.config.max_campaigns);
        let bytes = serde_json::to_vec(&CacheEnvelopeRef {
            version: self.config.schema_version,
            timestamp: now,
            campaigns: &campaigns,
        })?;

        self.swap(CacheSnapshot {
            campaigns,
            fetched_at: Some(now),
        });

        self.store.put(CACHE_KEY, bytes).await?;
        Ok(())
    }

    /// Empty memory and delete the persisted envelope.
    pub async fn clear(&self) -> Result<()> {
        self.swap(CacheSnapshot::default());
        self.store.delete(CACHE_KEY).await?;
        Ok(())
    }

    fn swap(&self, snapshot: CacheSnapshot) {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(snapshot);
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding cache lock should not panic");
        *slot = new_value;
    }

    async fn discard(&self) {
        self.swap(CacheSnapshot::default());
        if let Err(err) = self.store.delete(CACHE_KEY).await {
            log::warn!(target: "nudge", "failed to delete discarded campaign cache: {err}");
        }
    }
}

/// Keep at most `max` campaigns, dropping the lowest-priority and then the oldest first. The
/// relative order of kept campaigns is preserved.
fn cap_campaigns(campaigns: Vec<Arc<Campaign>>, max: usize) -> Vec<Arc<Campaign>> {
    if campaigns.len() <= max {
        return campaigns;
    }

    let mut ranked: Vec<usize> = (0..campaigns.len()).collect();
    ranked.sort_by(|&a, &b| {
        let (a, b) = (&campaigns[a], &campaigns[b]);
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.last_modified().cmp(&b.last_modified()))
    });

    let mut keep = vec![true; campaigns.len()];
    for &index in &ranked[..campaigns.len() - max] {
        keep[index] = false;
    }

    log::debug!(target: "nudge",
                dropped = campaigns.len() - max,
                max;
                "campaign list exceeds cache capacity");

    campaigns
        .into_iter()
        .zip(keep)
        .filter_map(|(campaign, keep)| keep.then_some(campaign))
        .collect()
}
