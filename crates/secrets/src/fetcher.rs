//! TTL-cached secret fetching with request coalescing.
//!
//! [`SecretFetcher`] sits in front of a [`SecretStore`] and guarantees that:
//! - cache hits are served under a shared read lock,
//! - concurrent misses share one in-flight remote call per coalescing key,
//! - every waiter on a flight receives the same value or the same error,
//! - expired entries are swept whenever a new value is written,
//! - a started fetch runs to completion even if every waiter is dropped.
//!
//! Errors are never cached; the next caller after a failed flight starts a
//! fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::SecretError;
use crate::store::{SecretStore, SsmParameterStore};

/// How long a fetched secret is served from memory.
pub const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on a single remote fetch, independent of the caller's own cancellation.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Flight key used by [`CoalesceScope::Global`].
const GLOBAL_FLIGHT_KEY: &str = "fetch_remote";

type Flight = Shared<BoxFuture<'static, Result<String, SecretError>>>;

/// Granularity at which concurrent cache misses are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoalesceScope {
    /// One flight per secret name. Unrelated names never wait on each other.
    #[default]
    PerIdentifier,
    /// One flight for the whole process. A miss for name B arriving while
    /// name A is in flight waits for A to finish, then fetches B.
    Global,
}

struct CacheEntry {
    value: String,
    fetched_at: DateTime<Utc>,
}

struct InFlight {
    name: String,
    flight: Flight,
}

enum Joined {
    Cached(String),
    Flight { name: String, flight: Flight },
}

struct Inner {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    scope: CoalesceScope,
    cache: RwLock<HashMap<String, CacheEntry>>,
    flights: Mutex<HashMap<String, InFlight>>,
}

/// Coalescing, TTL-cached front for a [`SecretStore`].
///
/// Cheap to clone; clones share the same cache and flight table.
#[derive(Clone)]
pub struct SecretFetcher {
    inner: Arc<Inner>,
}

impl SecretFetcher {
    /// Fetcher over `store` using the system clock and default settings.
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        SecretFetcherBuilder::new(store).build()
    }

    pub fn builder(store: Arc<dyn SecretStore>) -> SecretFetcherBuilder {
        SecretFetcherBuilder::new(store)
    }

    /// The process-wide fetcher backed by SSM Parameter Store.
    pub fn global() -> &'static SecretFetcher {
        static GLOBAL: OnceLock<SecretFetcher> = OnceLock::new();
        GLOBAL.get_or_init(|| SecretFetcher::new(Arc::new(SsmParameterStore::new())))
    }

    /// Resolve `name` to its plaintext value.
    ///
    /// When the stored value is a JSON object and `json_key` is given, the
    /// string field `json_key` is returned instead of the raw value. On a
    /// cache hit `json_key` is ignored: the cached value is already extracted.
    pub async fn fetch(&self, name: &str, json_key: Option<&str>) -> Result<String, SecretError> {
        loop {
            if let Some(value) = self.inner.cached(name) {
                debug!(parameter = %name, "secret served from cache");
                return Ok(value);
            }

            match self.join_flight(name, json_key) {
                Joined::Cached(value) => return Ok(value),
                Joined::Flight { name: owner, flight } => {
                    if owner == name {
                        return flight.await;
                    }
                    debug!(parameter = %name, in_flight = %owner, "waiting on unrelated secret fetch");
                    // Only waiting for the slot; the loop re-checks the cache for `name`.
                    let _ = flight.await;
                }
            }
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn cache_len(&self) -> usize {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn scope(&self) -> CoalesceScope {
        self.inner.scope
    }

    fn join_flight(&self, name: &str, json_key: Option<&str>) -> Joined {
        let key = match self.inner.scope {
            CoalesceScope::PerIdentifier => name.to_string(),
            CoalesceScope::Global => GLOBAL_FLIGHT_KEY.to_string(),
        };

        let mut flights = self.inner.flights.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = flights.get(&key) {
            return Joined::Flight {
                name: existing.name.clone(),
                flight: existing.flight.clone(),
            };
        }

        // A flight that completed after our cache check has already filled the cache.
        if let Some(value) = self.inner.cached(name) {
            return Joined::Cached(value);
        }

        // The fetch runs as its own task so it finishes and fills the cache
        // even if every waiter goes away.
        let inner = Arc::clone(&self.inner);
        let owned_name = name.to_string();
        let owned_key = json_key.map(str::to_string);
        let flight_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = inner.fetch_remote(&owned_name, owned_key.as_deref()).await;
            inner
                .flights
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&flight_key);
            result
        });

        let task_name = name.to_string();
        let flight = handle
            .map(move |joined| {
                joined.unwrap_or_else(|e| {
                    Err(SecretError::FetchFailed {
                        name: task_name,
                        reason: format!("fetch task failed: {e}"),
                    })
                })
            })
            .boxed()
            .shared();

        flights.insert(
            key,
            InFlight {
                name: name.to_string(),
                flight: flight.clone(),
            },
        );
        Joined::Flight {
            name: name.to_string(),
            flight,
        }
    }
}

impl Inner {
    fn cached(&self, name: &str) -> Option<String> {
        let now = self.clock.now();
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(name)
            .filter(|entry| age(now, entry.fetched_at) < CACHE_TTL)
            .map(|entry| entry.value.clone())
    }

    async fn fetch_remote(&self, name: &str, json_key: Option<&str>) -> Result<String, SecretError> {
        info!(parameter = %name, store = self.store.store_name(), "get secret from remote store");

        let raw = tokio::time::timeout(self.timeout, self.store.get_secret(name))
            .await
            .map_err(|_| SecretError::FetchTimeout {
                name: name.to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        let value = extract_json_key(name, raw, json_key)?;
        self.insert(name, value.clone());
        Ok(value)
    }

    fn insert(&self, name: &str, value: String) {
        let now = self.clock.now();
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            name.to_string(),
            CacheEntry {
                value,
                fetched_at: now,
            },
        );

        let before = cache.len();
        cache.retain(|_, entry| age(now, entry.fetched_at) < CACHE_TTL);

        let expires_at = chrono::Duration::from_std(CACHE_TTL)
            .map(|ttl| (now + ttl).to_rfc3339())
            .unwrap_or_default();
        info!(
            parameter = %name,
            expires_at = %expires_at,
            evicted = before - cache.len(),
            "cached secret"
        );
    }
}

/// Builder for [`SecretFetcher`].
pub struct SecretFetcherBuilder {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    scope: CoalesceScope,
}

impl SecretFetcherBuilder {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            timeout: FETCH_TIMEOUT,
            scope: CoalesceScope::default(),
        }
    }

    /// Replace the time source used for TTL checks.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the per-fetch timeout (defaults to [`FETCH_TIMEOUT`]).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scope(mut self, scope: CoalesceScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn build(self) -> SecretFetcher {
        SecretFetcher {
            inner: Arc::new(Inner {
                store: self.store,
                clock: self.clock,
                timeout: self.timeout,
                scope: self.scope,
                cache: RwLock::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Age of an entry; a clock that stepped backwards counts as zero.
fn age(now: DateTime<Utc>, fetched_at: DateTime<Utc>) -> Duration {
    (now - fetched_at).to_std().unwrap_or(Duration::ZERO)
}

/// Pull `json_key` out of a JSON-object secret, or pass the raw value through.
fn extract_json_key(name: &str, raw: String, json_key: Option<&str>) -> Result<String, SecretError> {
    let Some(key) = json_key.filter(|k| !k.is_empty()) else {
        return Ok(raw);
    };
    let Ok(serde_json::Value::Object(fields)) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return Ok(raw);
    };

    debug!(parameter = %name, "secret value is json, extracting key");
    let shape_error = |problem: &str| SecretError::BadSecretShape {
        name: name.to_string(),
        key: key.to_string(),
        problem: problem.to_string(),
    };
    match fields.get(key) {
        Some(serde_json::Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(shape_error("key is not string")),
        None => Err(shape_error("key is not found")),
    }
}
