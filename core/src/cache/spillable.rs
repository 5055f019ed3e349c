/*
 * Copyright 2025 iceberg-compaction
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::disk_store::LazyDiskStore;
use super::size_estimator::{DefaultSizeEstimator, SizeEstimator};
use crate::config::OptimizeServiceConfig;
use crate::{OptimizeError, Result};

#[derive(Debug, Clone)]
pub struct SpillableCacheOptions {
    pub max_in_memory_bytes: u64,
    pub spill_batch_size: usize,
    pub base_dir: Option<PathBuf>,
    pub name: String,
}

impl Default for SpillableCacheOptions {
    fn default() -> Self {
        Self {
            max_in_memory_bytes: 64 * 1024 * 1024,
            spill_batch_size: 1000,
            base_dir: None,
            name: "spill".to_owned(),
        }
    }
}

impl SpillableCacheOptions {
    pub fn from_service_config(config: &OptimizeServiceConfig, name: impl Into<String>) -> Self {
        Self {
            max_in_memory_bytes: config.spill_memory_budget_bytes,
            spill_batch_size: config.spill_batch_size.max(1),
            base_dir: config.spill_base_dir.as_ref().map(PathBuf::from),
            name: name.into(),
        }
    }
}

struct ResidentEntry<V> {
    value: V,
    size: u64,
    tick: u64,
}

struct CacheState<V> {
    resident: HashMap<String, ResidentEntry<V>>,
    /// Access tick -> key, coldest first.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    resident_bytes: u64,
    spilled: HashSet<String>,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            resident: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            resident_bytes: 0,
            spilled: HashSet::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn insert_resident(&mut self, key: String, value: V, size: u64) {
        let tick = self.tick();
        self.recency.insert(tick, key.clone());
        self.resident_bytes += size;
        self.resident
            .insert(key, ResidentEntry { value, size, tick });
    }

    fn remove_resident(&mut self, key: &str) -> Option<V> {
        let entry = self.resident.remove(key)?;
        self.recency.remove(&entry.tick);
        self.resident_bytes -= entry.size;
        Some(entry.value)
    }

    fn touch(&mut self, key: &str) -> Option<&V> {
        let tick = self.tick();
        let entry = self.resident.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.to_owned());
        Some(&entry.value)
    }

    fn clear(&mut self) {
        self.resident.clear();
        self.recency.clear();
        self.resident_bytes = 0;
        self.spilled.clear();
    }
}

/// Key-value map that keeps recently used entries in memory and spills the
/// rest to a private on-disk store once the estimated resident size passes
/// its budget.
///
/// Keys are strings; values are persisted as JSON. The disk store is opened
/// on first spill and released by [`clear`](Self::clear) or
/// [`close`](Self::close), after which the cache stays usable and reopens it
/// on demand.
///
/// Bulk inspection of values is only available through
/// [`values_stream`](Self::values_stream). `contains_value`, `values` and
/// `entries` would have to materialize the disk side and are rejected.
pub struct SpillableCache<V> {
    options: SpillableCacheOptions,
    estimator: Arc<dyn SizeEstimator<V>>,
    state: Mutex<CacheState<V>>,
    disk: LazyDiskStore,
}

impl<V> SpillableCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(options: SpillableCacheOptions) -> Self {
        Self::with_estimator(options, Arc::new(DefaultSizeEstimator::<V>::new()))
    }

    pub fn with_estimator(
        options: SpillableCacheOptions,
        estimator: Arc<dyn SizeEstimator<V>>,
    ) -> Self {
        let disk = LazyDiskStore::new(options.base_dir.clone(), format!("{}-", options.name));
        Self {
            options,
            estimator,
            state: Mutex::new(CacheState::new()),
            disk,
        }
    }

    fn entry_size(&self, key: &str, value: &V) -> u64 {
        key.len() as u64 + self.estimator.estimate(value)
    }

    /// Inserts or replaces `key`. May spill the coldest entries.
    ///
    /// A spilled key is replaced on disk in place. The previous value stays
    /// readable until the new one is written.
    pub async fn put(&self, key: impl Into<String>, value: V) -> Result<()> {
        let key = key.into();
        let mut state = self.state.lock().await;

        let size = self.entry_size(&key, &value);
        if size > self.options.max_in_memory_bytes || state.spilled.contains(&key) {
            let encoded = serde_json::to_vec(&value)?;
            self.disk
                .acquire()
                .await?
                .put_batch(&[(key.clone(), encoded)])
                .await?;
            state.remove_resident(&key);
            state.spilled.insert(key);
            return Ok(());
        }

        state.remove_resident(&key);
        state.insert_resident(key, value, size);
        self.spill_over_budget(&mut state).await
    }

    /// Inserts every entry. Entries bound for disk land in batches of
    /// `spill_batch_size`, each written atomically; a failed batch leaves
    /// the previous values of its keys in place.
    pub async fn put_all<I, K>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        let mut state = self.state.lock().await;
        let mut to_disk: Vec<(String, Vec<u8>)> = vec![];
        for (key, value) in entries {
            let key = key.into();
            let size = self.entry_size(&key, &value);
            if size > self.options.max_in_memory_bytes || state.spilled.contains(&key) {
                to_disk.push((key, serde_json::to_vec(&value)?));
            } else {
                to_disk.retain(|(pending, _)| pending != &key);
                state.remove_resident(&key);
                state.insert_resident(key, value, size);
            }
        }

        if !to_disk.is_empty() {
            let store = self.disk.acquire().await?;
            for chunk in to_disk.chunks(self.options.spill_batch_size) {
                store.put_batch(chunk).await?;
                for (key, _) in chunk {
                    state.remove_resident(key);
                    state.spilled.insert(key.clone());
                }
            }
        }
        self.spill_over_budget(&mut state).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        let mut state = self.state.lock().await;
        if let Some(value) = state.touch(key) {
            return Ok(Some(value.clone()));
        }
        if !state.spilled.contains(key) {
            return Ok(None);
        }
        let store = self.disk.acquire().await?;
        match store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Err(OptimizeError::FatalConsistency(format!(
                "spilled key {key} is missing from the disk store"
            ))),
        }
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state.resident.contains_key(key) || state.spilled.contains(key)
    }

    pub async fn remove(&self, key: &str) -> Result<Option<V>> {
        let mut state = self.state.lock().await;
        if let Some(value) = state.remove_resident(key) {
            return Ok(Some(value));
        }
        if !state.spilled.remove(key) {
            return Ok(None);
        }
        let store = self.disk.acquire().await?;
        let value = match store.get(key).await? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        store.delete(key).await?;
        Ok(value)
    }

    /// Drops every entry and releases the disk store.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.clear();
        self.disk.release().await;
    }

    /// Same as [`clear`](Self::clear). The cache reopens its disk store on the
    /// next spill.
    pub async fn close(&self) {
        self.clear().await;
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.resident.len() + state.spilled.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Estimated bytes held in memory. Never above the configured budget once
    /// an operation returns successfully.
    pub async fn in_memory_size(&self) -> u64 {
        self.state.lock().await.resident_bytes
    }

    pub async fn spilled_len(&self) -> usize {
        self.state.lock().await.spilled.len()
    }

    pub async fn size_of_file_on_disk(&self) -> u64 {
        match self.disk.current().await {
            Some(store) => store.size_on_disk(),
            None => 0,
        }
    }

    pub fn disk_open_count(&self) -> usize {
        self.disk.open_count()
    }

    /// Single pass over current values: resident ones first, then the spilled
    /// ones read lazily from disk.
    pub async fn values_stream(&self) -> BoxStream<'static, Result<V>> {
        let (resident, spilled) = {
            let state = self.state.lock().await;
            let resident: Vec<V> = state
                .resident
                .values()
                .map(|entry| entry.value.clone())
                .collect();
            (resident, !state.spilled.is_empty())
        };
        let store = if spilled {
            self.disk.current().await
        } else {
            None
        };

        let resident = futures::stream::iter(resident.into_iter().map(Ok));
        match store {
            Some(store) => resident
                .chain(
                    store
                        .value_stream()
                        .and_then(|bytes| async move {
                            Ok::<V, OptimizeError>(serde_json::from_slice(&bytes)?)
                        }),
                )
                .boxed(),
            None => resident.boxed(),
        }
    }

    pub fn contains_value(&self, _value: &V) -> Result<bool> {
        Err(OptimizeError::Unsupported(
            "contains_value on a spillable cache".to_owned(),
        ))
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Err(OptimizeError::Unsupported(
            "values on a spillable cache, use values_stream".to_owned(),
        ))
    }

    pub fn entries(&self) -> Result<Vec<(String, V)>> {
        Err(OptimizeError::Unsupported(
            "entries on a spillable cache".to_owned(),
        ))
    }

    /// Moves the coldest entries to disk until the resident estimate fits the
    /// budget. Each batch is committed before its entries leave memory.
    async fn spill_over_budget(&self, state: &mut CacheState<V>) -> Result<()> {
        if state.resident_bytes <= self.options.max_in_memory_bytes {
            return Ok(());
        }

        let mut victims = vec![];
        let mut projected = state.resident_bytes;
        for key in state.recency.values() {
            if projected <= self.options.max_in_memory_bytes {
                break;
            }
            if let Some(entry) = state.resident.get(key) {
                projected -= entry.size;
                victims.push((key.clone(), serde_json::to_vec(&entry.value)?));
            }
        }

        let store = self.disk.acquire().await?;
        for chunk in victims.chunks(self.options.spill_batch_size) {
            store.put_batch(chunk).await?;
            for (key, _) in chunk {
                state.remove_resident(key);
                state.spilled.insert(key.clone());
            }
        }
        tracing::debug!(
            "spilled {} entries of cache {}, {} bytes resident",
            victims.len(),
            self.options.name,
            state.resident_bytes
        );
        Ok(())
    }
}
