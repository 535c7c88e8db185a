//! In-process `ResourceApi`: a namespaced object map with a watch feed,
//! failure injection and per-operation call counters.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use rustc_hash::FxHashMap;
use steward_core::{Delta, ObjectKey, StoreError, StoreResult};
use tokio::sync::broadcast;
use tracing::warn;

use crate::{key_of, Object, ResourceApi};

const FEED_CAPACITY: usize = 1024;

/// Store operation, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    UpdateStatus,
    Delete,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    failures: FxHashMap<Op, u32>,
    calls: FxHashMap<Op, usize>,
}

pub struct MemoryApi<K> {
    state: Arc<Mutex<State<K>>>,
    feed: broadcast::Sender<Delta<K>>,
}

fn lock<K>(state: &Mutex<State<K>>) -> MutexGuard<'_, State<K>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Full listing bracketed by `Init`/`InitDone`, plus a feed subscription
/// taken under the same lock so nothing falls between them.
fn relist<K: Object>(
    state: &Mutex<State<K>>,
    feed: &broadcast::Sender<Delta<K>>,
) -> (broadcast::Receiver<Delta<K>>, VecDeque<Delta<K>>) {
    let st = lock(state);
    let mut listing = VecDeque::with_capacity(st.objects.len() + 2);
    listing.push_back(Delta::Init);
    listing.extend(st.objects.values().cloned().map(Delta::InitApplied));
    listing.push_back(Delta::InitDone);
    (feed.subscribe(), listing)
}

impl<K: Object> Default for MemoryApi<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> MemoryApi<K> {
    pub fn new() -> Self { Self::with_feed_capacity(FEED_CAPACITY) }

    /// Watchers falling more than `capacity` changes behind get a relist.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        let state = State {
            objects: BTreeMap::new(),
            version: 0,
            failures: FxHashMap::default(),
            calls: FxHashMap::default(),
        };
        Self { state: Arc::new(Mutex::new(state)), feed }
    }

    pub fn shared() -> Arc<Self> { Arc::new(Self::new()) }

    fn lock(&self) -> MutexGuard<'_, State<K>> { lock(&self.state) }

    fn stamp(st: &mut State<K>, obj: &mut K) {
        st.version += 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(st.version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    fn check(st: &mut State<K>, op: Op) -> StoreResult<()> {
        *st.calls.entry(op).or_default() += 1;
        match st.failures.get_mut(&op) {
            Some(n) if *n > 0 => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                Err(StoreError::Transient(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }

    fn key(obj: &K) -> StoreResult<ObjectKey> {
        key_of(obj).map_err(|e| StoreError::Transient(e.to_string()))
    }

    /// Create or replace an object the way an outside actor would. A preset
    /// UID is kept.
    pub fn put(&self, mut obj: K) -> StoreResult<K> {
        let key = Self::key(&obj)?;
        let mut st = self.lock();
        Self::stamp(&mut st, &mut obj);
        st.objects.insert(key, obj.clone());
        let _ = self.feed.send(Delta::Applied(obj.clone()));
        Ok(obj)
    }

    /// Delete an object the way an outside actor would.
    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        let mut st = self.lock();
        let gone = st.objects.remove(key)?;
        let _ = self.feed.send(Delta::Deleted(gone.clone()));
        Some(gone)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<K> { self.lock().objects.get(key).cloned() }

    pub fn list(&self) -> Vec<K> { self.lock().objects.values().cloned().collect() }

    /// Fail the next `times` calls of `op` with a transient error.
    pub fn fail_next(&self, op: Op, times: u32) { self.lock().failures.insert(op, times); }

    pub fn fail_always(&self, op: Op) { self.fail_next(op, u32::MAX); }

    pub fn heal(&self, op: Op) { self.lock().failures.remove(&op); }

    pub fn calls(&self, op: Op) -> usize { self.lock().calls.get(&op).copied().unwrap_or(0) }
}

#[async_trait]
impl<K: Object> ResourceApi<K> for MemoryApi<K> {
    fn watch(&self) -> BoxStream<'static, StoreResult<Delta<K>>> {
        let (rx, pending) = relist(&self.state, &self.feed);
        let state = Arc::clone(&self.state);
        let feed = self.feed.clone();
        futures::stream::unfold((rx, pending), move |(mut rx, mut pending)| {
            let state = Arc::clone(&state);
            let feed = feed.clone();
            async move {
                loop {
                    if let Some(d) = pending.pop_front() {
                        return Some((Ok(d), (rx, pending)));
                    }
                    match rx.recv().await {
                        Ok(d) => return Some((Ok(d), (rx, pending))),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(kind = %K::kind(&()), missed, "watch feed lagged; relisting");
                            (rx, pending) = relist(&state, &feed);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<K>> {
        let mut st = self.lock();
        Self::check(&mut st, Op::Get)?;
        Ok(st.objects.get(key).cloned())
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = Self::key(obj)?;
        let mut st = self.lock();
        Self::check(&mut st, Op::Create)?;
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let mut created = obj.clone();
        Self::stamp(&mut st, &mut created);
        st.objects.insert(key, created.clone());
        let _ = self.feed.send(Delta::Applied(created.clone()));
        Ok(created)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let key = Self::key(obj)?;
        let mut st = self.lock();
        Self::check(&mut st, Op::UpdateStatus)?;
        let current = st.objects.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let encode = |v: &K| serde_json::to_value(v).map_err(|e| StoreError::Transient(e.to_string()));
        let status = encode(obj)?.get("status").cloned().unwrap_or(serde_json::Value::Null);
        let mut raw = encode(current)?;
        if let Some(map) = raw.as_object_mut() {
            map.insert("status".to_string(), status);
        }
        let mut updated: K = serde_json::from_value(raw).map_err(|e| StoreError::Transient(e.to_string()))?;
        Self::stamp(&mut st, &mut updated);
        st.objects.insert(key, updated.clone());
        let _ = self.feed.send(Delta::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut st = self.lock();
        Self::check(&mut st, Op::Delete)?;
        let gone = st.objects.remove(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let _ = self.feed.send(Delta::Deleted(gone));
        Ok(())
    }
}
