//! Cache-aside store with per-key single-flight loading.
//!
//! The key map sits behind a short synchronous lock that is never held across
//! an await. The first caller to miss on a key becomes its loader; callers that
//! arrive while that load runs subscribe to a `watch` channel and receive the
//! same outcome, success or failure. Failed loads are not cached, so the next
//! call after a failure starts a fresh load. Other keys load in parallel.
//! Expiry and eviction are checked lazily on access.
use crate::error::StoreError;
use crate::models::{ThresholdKey, ThresholdRule};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Threshold rules keyed by (owner client id, sensor key).
pub type ThresholdCache = TtlCache<ThresholdKey, ThresholdRule, StoreError>;

/// Outcome of one load, as seen by the loader and every waiter.
pub type LoadResult<V, E> = Result<V, Arc<E>>;

type Outcome<V, E> = watch::Receiver<Option<LoadResult<V, E>>>;

#[derive(Debug, Clone)]
struct Loaded<V> {
    value: V,
    loaded_at: Instant,
}

enum Entry<V, E> {
    Loading { load_id: u64, outcome: Outcome<V, E> },
    Ready(Loaded<V>),
}

struct Slot<V, E> {
    entry: Entry<V, E>,
    last_access: u64,
}

struct State<K, V, E> {
    slots: HashMap<K, Slot<V, E>>,
    tick: u64,
}

enum Role<V, E> {
    Hit(V),
    Wait { load_id: u64, outcome: Outcome<V, E> },
    Lead { load_id: u64, publish: watch::Sender<Option<LoadResult<V, E>>> },
}

pub struct TtlCache<K, V, E> {
    state: Mutex<State<K, V, E>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                tick: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the cached value for `key`, running `loader` on a miss.
    /// Callers arriving while a load is outstanding share its outcome.
    pub async fn get<F, Fut>(&self, key: K, loader: F) -> LoadResult<V, E>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        loop {
            match self.claim(&key) {
                Role::Hit(value) => return Ok(value),
                Role::Wait { load_id, mut outcome } => {
                    let shared = match outcome.wait_for(Option::is_some).await {
                        Ok(shared) => shared.clone(),
                        Err(_) => None,
                    };
                    if let Some(result) = shared {
                        return result;
                    }
                    // the loading caller went away without an outcome
                    self.abandon(&key, load_id);
                }
                Role::Lead { load_id, publish } => {
                    let result = loader(key.clone()).await.map_err(Arc::new);
                    self.settle(&key, load_id, &result);
                    publish.send_replace(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Drops the entry for `key`. An outstanding load still completes for its
    /// waiters but is not kept.
    pub fn invalidate(&self, key: &K) {
        self.state.lock().slots.remove(key);
    }

    /// Stores a value directly, replacing any entry.
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.tick += 1;
        let slot = Slot {
            entry: Entry::Ready(Loaded {
                value,
                loaded_at: Instant::now(),
            }),
            last_access: state.tick,
        };
        state.slots.insert(key.clone(), slot);
        self.evict_over_capacity(&mut state, &key);
    }

    /// Entries currently held, including in-flight loads and not yet swept expired ones.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, loaded: &Loaded<V>, now: Instant) -> bool {
        now.duration_since(loaded.loaded_at) < self.ttl
    }

    /// Decides under the lock whether this caller hits, waits on a running
    /// load or starts a new one.
    fn claim(&self, key: &K) -> Role<V, E> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let now = Instant::now();

        if let Some(slot) = state.slots.get_mut(key) {
            match &slot.entry {
                Entry::Ready(loaded) if self.is_fresh(loaded, now) => {
                    slot.last_access = tick;
                    return Role::Hit(loaded.value.clone());
                }
                Entry::Loading { load_id, outcome } => {
                    slot.last_access = tick;
                    return Role::Wait {
                        load_id: *load_id,
                        outcome: outcome.clone(),
                    };
                }
                Entry::Ready(_) => {
                    debug!("Cached entry expired, reloading");
                }
            }
        }

        let (publish, outcome) = watch::channel(None);
        state.slots.insert(
            key.clone(),
            Slot {
                entry: Entry::Loading {
                    load_id: tick,
                    outcome,
                },
                last_access: tick,
            },
        );
        self.evict_over_capacity(&mut state, key);
        Role::Lead {
            load_id: tick,
            publish,
        }
    }

    /// Records the outcome of load `load_id` unless the slot was invalidated
    /// or replaced meanwhile. Failures leave no entry behind.
    fn settle(&self, key: &K, load_id: u64, result: &LoadResult<V, E>) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return;
        };
        if !matches!(slot.entry, Entry::Loading { load_id: current, .. } if current == load_id) {
            return;
        }
        match result {
            Ok(value) => {
                slot.entry = Entry::Ready(Loaded {
                    value: value.clone(),
                    loaded_at: Instant::now(),
                });
            }
            Err(_) => {
                state.slots.remove(key);
            }
        }
    }

    /// Clears a load whose caller was dropped before it finished.
    fn abandon(&self, key: &K, load_id: u64) {
        let mut state = self.state.lock();
        let stale = state.slots.get(key).is_some_and(|slot| {
            matches!(slot.entry, Entry::Loading { load_id: current, .. } if current == load_id)
        });
        if stale {
            state.slots.remove(key);
        }
    }

    /// Removes settled entries until the bound holds: expired ones first, then
    /// the least recently used. In-flight loads and `keep` are never evicted.
    fn evict_over_capacity(&self, state: &mut State<K, V, E>, keep: &K) {
        let now = Instant::now();
        while state.slots.len() > self.max_entries {
            let victim = state
                .slots
                .iter()
                .filter(|(key, _)| *key != keep)
                .filter_map(|(key, slot)| match &slot.entry {
                    Entry::Ready(loaded) => Some((self.is_fresh(loaded, now), slot.last_access, key)),
                    Entry::Loading { .. } => None,
                })
                .min_by_key(|(fresh, last_access, _)| (*fresh, *last_access))
                .map(|(_, _, key)| key.clone());

            match victim {
                Some(key) => {
                    state.slots.remove(&key);
                }
                None => {
                    debug!("Cache over capacity with only in-flight entries; deferring eviction.");
                    break;
                }
            }
        }
    }
}
