//
// unit_cache.rs
//
// Generation-tagged, single-flight memoization of unit loads
//

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexSet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::LoadError;
use crate::unit::{CachedUnit, UnitKey};

pub type Outcome<V> = Result<Arc<V>, LoadError>;

enum Slot<V> {
    Loading {
        load_id: u64,
        generation: u64,
        done: watch::Receiver<Option<Outcome<V>>>,
    },
    Ready {
        generation: u64,
        value: Arc<V>,
    },
    Failed {
        generation: u64,
        error: LoadError,
    },
}

struct Inner<V> {
    slots: HashMap<UnitKey, Slot<V>>,
    /// Generation of keys invalidated since the last reset
    generations: HashMap<UnitKey, u64>,
    clock: u64,
    /// Generation of every key not in `generations`
    floor: u64,
    next_load_id: u64,
    /// Ready keys, least recently used first
    recency: IndexSet<UnitKey>,
}

impl<V> Inner<V> {
    fn generation_of(&self, key: &UnitKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(self.floor)
    }

    fn bump(&mut self, key: &UnitKey) {
        self.clock += 1;
        self.generations.insert(key.clone(), self.clock);
    }

    fn touch(&mut self, key: &UnitKey) {
        self.recency.shift_remove(key);
        self.recency.insert(key.clone());
    }

    fn remove(&mut self, key: &UnitKey) {
        self.slots.remove(key);
        self.recency.shift_remove(key);
    }
}

/// Memoizes loads of one kind of unit.
///
/// At most one load per key is in flight. Concurrent callers wait on it and
/// share its outcome. Every key carries a generation that invalidation
/// bumps; a load only publishes its result if the generation it started
/// under is still current.
pub struct UnitCache<V: CachedUnit> {
    name: &'static str,
    capacity: AtomicUsize,
    inner: Mutex<Inner<V>>,
}

impl<V: CachedUnit> std::fmt::Debug for UnitCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitCache")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Removes the in-flight marker if the load is dropped or cancelled before
/// publishing. Dropping the sender wakes waiters, who then retry.
struct InFlight<'a, V: CachedUnit> {
    cache: &'a UnitCache<V>,
    key: &'a UnitKey,
    load_id: u64,
    done: Option<watch::Sender<Option<Outcome<V>>>>,
}

impl<V: CachedUnit> InFlight<'_, V> {
    fn complete(mut self, generation: u64, outcome: Outcome<V>) {
        let Some(done) = self.done.take() else {
            return;
        };
        {
            let mut inner = self.cache.lock();
            let current = inner.generation_of(self.key);
            if current == generation {
                let slot = match &outcome {
                    Ok(value) => Slot::Ready {
                        generation,
                        value: value.clone(),
                    },
                    Err(error) => Slot::Failed {
                        generation,
                        error: error.clone(),
                    },
                };
                inner.slots.insert(self.key.clone(), slot);
                if outcome.is_ok() {
                    inner.touch(self.key);
                    self.cache.evict_locked(&mut inner);
                }
            } else {
                log::trace!(
                    "[{}] discarding stale load of {} (generation {} < {})",
                    self.cache.name,
                    self.key,
                    generation,
                    current
                );
                self.release_slot(&mut inner);
            }
        }
        done.send_replace(Some(outcome));
    }

    fn release_slot(&self, inner: &mut Inner<V>) {
        if matches!(
            inner.slots.get(self.key),
            Some(Slot::Loading { load_id, .. }) if *load_id == self.load_id
        ) {
            inner.slots.remove(self.key);
        }
    }
}

impl<V: CachedUnit> Drop for InFlight<'_, V> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            {
                let mut inner = self.cache.lock();
                self.release_slot(&mut inner);
            }
            log::trace!("[{}] load of {} abandoned", self.cache.name, self.key);
            drop(done);
        }
    }
}

enum Next<V> {
    Wait {
        generation: u64,
        done: watch::Receiver<Option<Outcome<V>>>,
    },
    Load {
        generation: u64,
        load_id: u64,
        done: watch::Sender<Option<Outcome<V>>>,
    },
}

impl<V: CachedUnit> UnitCache<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: AtomicUsize::new(capacity.max(1)),
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                generations: HashMap::new(),
                clock: 0,
                floor: 0,
                next_load_id: 0,
                recency: IndexSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current generation of `key`.
    pub fn generation(&self, key: &UnitKey) -> u64 {
        self.lock().generation_of(key)
    }

    /// Ready value for `key`, without loading.
    pub fn get(&self, key: &UnitKey) -> Option<Arc<V>> {
        let inner = self.lock();
        let generation = inner.generation_of(key);
        match inner.slots.get(key) {
            Some(Slot::Ready {
                generation: g,
                value,
            }) if *g == generation => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_loading(&self, key: &UnitKey) -> bool {
        matches!(self.lock().slots.get(key), Some(Slot::Loading { .. }))
    }

    /// Return the cached value for `key` or run `load` to produce it.
    ///
    /// `load` receives the generation the load runs under. If another caller
    /// is already loading `key` this waits for that load instead. When
    /// `cancel` fires the call returns `LoadError::Cancelled` and, if it was
    /// the loading caller, leaves no entry behind.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &UnitKey,
        cancel: &CancellationToken,
        load: F,
    ) -> Outcome<V>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<V, LoadError>>,
    {
        let (generation, load_id, done) = loop {
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }

            let next = {
                let mut inner = self.lock();
                let generation = inner.generation_of(key);
                match inner.slots.get(key) {
                    Some(Slot::Ready {
                        generation: g,
                        value,
                    }) if *g == generation => {
                        let value = value.clone();
                        inner.touch(key);
                        return Ok(value);
                    }
                    Some(Slot::Failed {
                        generation: g,
                        error,
                    }) if *g == generation && !error.retryable() => {
                        return Err(error.clone());
                    }
                    Some(Slot::Loading {
                        generation: g,
                        done,
                        ..
                    }) if *g == generation => Next::Wait {
                        generation,
                        done: done.clone(),
                    },
                    _ => {
                        inner.next_load_id += 1;
                        let load_id = inner.next_load_id;
                        let (tx, rx) = watch::channel(None);
                        inner.recency.shift_remove(key);
                        inner.slots.insert(
                            key.clone(),
                            Slot::Loading {
                                load_id,
                                generation,
                                done: rx,
                            },
                        );
                        Next::Load {
                            generation,
                            load_id,
                            done: tx,
                        }
                    }
                }
            };

            match next {
                Next::Load {
                    generation,
                    load_id,
                    done,
                } => break (generation, load_id, done),
                Next::Wait {
                    generation,
                    mut done,
                } => {
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                        outcome = done.wait_for(Option::is_some) => {
                            outcome.ok().and_then(|shared| (*shared).clone())
                        }
                    };
                    match outcome {
                        // Only hand out the shared outcome if nothing
                        // invalidated the key while we waited.
                        Some(outcome) if self.generation(key) == generation => return outcome,
                        _ => continue,
                    }
                }
            }
        };

        let in_flight = InFlight {
            cache: self,
            key,
            load_id,
            done: Some(done),
        };
        log::trace!("[{}] loading {} (generation {})", self.name, key, generation);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            result = load(generation) => result,
        };

        match result {
            // Dropping the guard clears the marker and lets waiters retry.
            Err(LoadError::Cancelled) => Err(LoadError::Cancelled),
            result => {
                let outcome = result.map(Arc::new);
                in_flight.complete(generation, outcome.clone());
                outcome
            }
        }
    }

    /// Invalidate every entry built from `path`: units whose directory is the
    /// path's directory (or lies under `path`), and transitively every ready
    /// entry depending on one of those. Returns the invalidated keys.
    pub fn invalidate(&self, path: &Path) -> Vec<UnitKey> {
        let parent = path.parent();
        let touches = |key: &UnitKey| Some(key.dir.as_path()) == parent || key.dir.starts_with(path);

        let mut inner = self.lock();

        let mut dependents: HashMap<&UnitKey, Vec<&UnitKey>> = HashMap::new();
        for (key, slot) in &inner.slots {
            if let Slot::Ready { value, .. } = slot {
                for dep in value.dependencies() {
                    dependents.entry(dep).or_default().push(key);
                }
            }
        }

        let mut queue: VecDeque<&UnitKey> = inner.slots.keys().filter(|k| touches(*k)).collect();
        // Dependencies may be keys of another cache
        queue.extend(dependents.keys().copied().filter(|k| touches(*k)));

        let mut visited: HashSet<&UnitKey> = HashSet::new();
        while let Some(key) = queue.pop_front() {
            if !visited.insert(key) {
                continue;
            }
            if let Some(next) = dependents.get(key) {
                queue.extend(next.iter().copied());
            }
        }

        let affected: Vec<UnitKey> = visited
            .into_iter()
            .filter(|k| inner.slots.contains_key(*k))
            .cloned()
            .collect();

        for key in &affected {
            inner.bump(key);
            if !matches!(inner.slots.get(key), Some(Slot::Loading { .. })) {
                inner.remove(key);
            }
        }
        drop(inner);

        if !affected.is_empty() {
            log::trace!(
                "[{}] {} invalidated {} entries",
                self.name,
                path.display(),
                affected.len()
            );
        }
        affected
    }

    /// Invalidate `key` if its ready entry is still `value`. Returns whether
    /// the entry was dropped.
    pub fn discard(&self, key: &UnitKey, value: &Arc<V>) -> bool {
        let mut inner = self.lock();
        let generation = inner.generation_of(key);
        let current = matches!(
            inner.slots.get(key),
            Some(Slot::Ready { generation: g, value: v }) if *g == generation && Arc::ptr_eq(v, value)
        );
        if current {
            inner.bump(key);
            inner.remove(key);
            log::trace!("[{}] discarded {}", self.name, key);
        }
        current
    }

    /// Drop every entry. Loads in flight finish but never publish.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.clock += 1;
        inner.floor = inner.clock;
        inner.generations.clear();
        inner.slots.clear();
        inner.recency.clear();
        log::debug!("[{}] reset", self.name);
    }

    /// Consistent copy of the ready entries.
    pub fn snapshot(&self) -> Vec<(UnitKey, Arc<V>)> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready { generation, value } if *generation == inner.generation_of(key) => {
                    Some((key.clone(), value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Visit every ready entry. Runs on a snapshot, so `visit` may call back
    /// into the cache.
    pub fn iterate(&self, mut visit: impl FnMut(&UnitKey, &Arc<V>)) {
        for (key, value) in self.snapshot() {
            visit(&key, &value);
        }
    }

    pub fn ready_count(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.evict_to_capacity();
    }

    /// Evict least recently used ready entries beyond capacity.
    pub fn evict_to_capacity(&self) {
        let mut inner = self.lock();
        self.evict_locked(&mut inner);
    }

    fn evict_locked(&self, inner: &mut Inner<V>) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        while inner.recency.len() > capacity {
            let Some(oldest) = inner.recency.shift_remove_index(0) else {
                break;
            };
            if matches!(inner.slots.get(&oldest), Some(Slot::Ready { .. })) {
                inner.slots.remove(&oldest);
                log::trace!("[{}] evicted {}", self.name, oldest);
            }
        }
    }
}
