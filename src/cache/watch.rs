//! Selector-scoped, in-memory mirror of one kind in the object store.
//!
//! `CacheCore` holds the objects, named indexes over them, and the
//! notification handlers. A driver task (`spawn_watcher`) feeds it from a
//! `kube_runtime::watcher` stream; handlers run on that task, in
//! notification order, so per-key delivery is FIFO. Handlers must return
//! quickly: they only touch routing tables and enqueue keys.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use kube::api::Api;
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use crate::netutil::Nsn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no index named {0:?}")]
    UnknownIndex(String),
}

/// A notification about one object. Deletions carry the last-known copy of
/// the object, which may lag what the store last saw (tombstone semantics).
pub enum CacheEvent<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

type IndexFn<K> = Box<dyn Fn(&K) -> Vec<String> + Send + Sync>;
type Handler<K> = Box<dyn Fn(&CacheEvent<K>) + Send + Sync>;

struct Index<K> {
    func: IndexFn<K>,
    map: HashMap<String, HashSet<Nsn>>,
}

impl<K> Index<K> {
    fn update(&mut self, key: &Nsn, old: Option<&K>, new: Option<&K>) {
        if let Some(old) = old {
            for ik in (self.func)(old) {
                if let Some(set) = self.map.get_mut(&ik) {
                    set.remove(key);
                    if set.is_empty() {
                        self.map.remove(&ik);
                    }
                }
            }
        }
        if let Some(new) = new {
            for ik in (self.func)(new) {
                self.map.entry(ik).or_default().insert(key.clone());
            }
        }
    }
}

struct State<K> {
    objects: HashMap<Nsn, Arc<K>>,
    indexes: HashMap<String, Index<K>>,
    // Keys seen during an in-progress initial list; objects absent from it
    // are dropped when the list completes.
    init_keys: Option<HashSet<Nsn>>,
}

pub struct CacheCore<K> {
    state: RwLock<State<K>>,
    handlers: RwLock<Vec<Handler<K>>>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
}

impl<K> CacheCore<K>
where
    K: kube::Resource<DynamicType = ()> + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        let (synced_tx, synced_rx) = watch::channel(false);
        Arc::new(Self {
            state: RwLock::new(State {
                objects: HashMap::new(),
                indexes: HashMap::new(),
                init_keys: None,
            }),
            handlers: RwLock::new(Vec::new()),
            synced_tx,
            synced_rx,
        })
    }

    /// Registers a named index. Existing objects are backfilled.
    pub fn add_index(
        &self,
        name: &str,
        func: impl Fn(&K) -> Vec<String> + Send + Sync + 'static,
    ) {
        let mut st = self.state.write().unwrap();
        let mut index = Index {
            func: Box::new(func),
            map: HashMap::new(),
        };
        for (key, obj) in &st.objects {
            index.update(key, None, Some(obj));
        }
        st.indexes.insert(name.to_owned(), index);
    }

    pub fn add_handler(&self, handler: impl Fn(&CacheEvent<K>) + Send + Sync + 'static) {
        self.handlers.write().unwrap().push(Box::new(handler));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.state
            .read()
            .unwrap()
            .objects
            .get(&Nsn::new(namespace, name))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.state.read().unwrap().objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects whose index function produced `index_key` under the named
    /// index.
    pub fn by_index(&self, index: &str, index_key: &str) -> Result<Vec<Arc<K>>, CacheError> {
        let st = self.state.read().unwrap();
        let idx = st
            .indexes
            .get(index)
            .ok_or_else(|| CacheError::UnknownIndex(index.to_owned()))?;
        Ok(idx
            .map
            .get(index_key)
            .map(|keys| keys.iter().filter_map(|k| st.objects.get(k).cloned()).collect())
            .unwrap_or_default())
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub async fn wait_synced(&self) {
        let mut rx = self.synced_rx.clone();
        // The sender lives in self, so wait_for cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Marks the cache synced without an initial list. Used when the cache
    /// is fed directly.
    pub fn mark_synced(&self) {
        let _ = self.synced_tx.send(true);
    }

    /// Inserts or replaces an object and notifies handlers.
    pub fn apply(&self, obj: K) {
        let key = Nsn::of(&obj);
        let new = Arc::new(obj);
        let event = {
            let mut st = self.state.write().unwrap();
            if let Some(keys) = st.init_keys.as_mut() {
                keys.insert(key.clone());
            }
            let old = st.objects.insert(key.clone(), Arc::clone(&new));
            for index in st.indexes.values_mut() {
                index.update(&key, old.as_deref(), Some(&new));
            }
            match old {
                Some(old) => CacheEvent::Update { old, new },
                None => CacheEvent::Add(new),
            }
        };
        self.dispatch(&event);
    }

    /// Removes an object and notifies handlers. The stored copy, when
    /// present, wins over the (possibly stale) payload.
    pub fn remove(&self, obj: K) {
        let key = Nsn::of(&obj);
        let payload = {
            let mut st = self.state.write().unwrap();
            match st.objects.remove(&key) {
                Some(stored) => {
                    for index in st.indexes.values_mut() {
                        index.update(&key, Some(&stored), None);
                    }
                    stored
                }
                None => Arc::new(obj),
            }
        };
        self.dispatch(&CacheEvent::Delete(payload));
    }

    fn dispatch(&self, event: &CacheEvent<K>) {
        for handler in self.handlers.read().unwrap().iter() {
            handler(event);
        }
    }

    fn begin_init(&self) {
        self.state.write().unwrap().init_keys = Some(HashSet::new());
    }

    /// Completes an initial list: objects absent from it are deleted, and
    /// the cache becomes synced.
    fn finish_init(&self) {
        let stale: Vec<Arc<K>> = {
            let mut st = self.state.write().unwrap();
            let Some(seen) = st.init_keys.take() else {
                return;
            };
            let stale_keys: Vec<Nsn> = st
                .objects
                .keys()
                .filter(|k| !seen.contains(k))
                .cloned()
                .collect();
            let mut stale = Vec::with_capacity(stale_keys.len());
            for key in stale_keys {
                if let Some(obj) = st.objects.remove(&key) {
                    for index in st.indexes.values_mut() {
                        index.update(&key, Some(&obj), None);
                    }
                    stale.push(obj);
                }
            }
            stale
        };
        for obj in stale {
            self.dispatch(&CacheEvent::Delete(obj));
        }
        let _ = self.synced_tx.send(true);
    }

    /// Applies one event from a watch stream.
    pub fn handle_watch_event(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => self.begin_init(),
            watcher::Event::InitApply(obj) => self.apply(obj),
            watcher::Event::InitDone => self.finish_init(),
            watcher::Event::Apply(obj) => self.apply(obj),
            watcher::Event::Delete(obj) => self.remove(obj),
        }
    }
}

/// Drives a cache from a watch on the object store until `stop` resolves.
/// Watch errors are retried with the watcher's default backoff.
pub fn spawn_watcher<K, S>(
    api: Api<K>,
    config: watcher::Config,
    core: Arc<CacheCore<K>>,
    stop: S,
) -> tokio::task::JoinHandle<()>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    S: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let stream = watcher(api, config).default_backoff();
        futures::pin_mut!(stream);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => core.handle_watch_event(event),
                    Some(Err(err)) => warn!(error = %err, "watch stream error, will retry"),
                    None => break,
                },
            }
        }
    })
}
