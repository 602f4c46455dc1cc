/// An implementation of an LRU (Least Recently Used) cache.
///
use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use futures::{
    channel::oneshot::{channel, Sender},
    future::BoxFuture,
};

use parking_lot::Mutex;

use crate::errors::{Error, Result};

/// An LRU (least recently used) cache.
///
/// Values must implement ``Cacheable``, which self reports size, intended to be the number of
/// bytes (more or less) an object takes up in memory. For decoded fragment data this is exactly
/// the number of bytes of cell data.
///
/// The ``limit`` is passed in when instantiating the Cache. When an object is added to the cache
/// which causes the total size of objects stored in the cache to exceed the limit, objects are
/// evicted from the cache until the total size is back under the limit. Objects are evicted in
/// least recently used order.
///
/// The ``Cache`` is thread safe. When interrogating the cache with ``get``, a ``load`` function
/// is passed in that is used to load the object from the underlying store on a cache miss. If
/// multiple requests for the same object come in while it is being loaded, the object is loaded
/// only once, with all requests waiting for the single load to finish.
///
/// Keys are fragment ids and fragments are immutable, so nothing special needs to be done for
/// cache invalidation.
///
pub struct Cache<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// The actual cache
    recent: Mutex<Entries<K, V>>,

    /// Synchronization objects for objects that are currently being loaded from the underlying
    /// data store.
    loaders: Mutex<HashMap<K, Arc<Loader<V>>>>,
}

/// A trait for objects that can be cached
///
pub trait Cacheable: Sized {
    /// Return the number of bytes this object takes up
    fn size(&self) -> u64;
}

/// A structure used to synchronize an object's load operation among all the tasks waiting for
/// that object.
struct Loader<V>
where
    V: Cacheable,
{
    /// The loaded entry. If object is not yet loaded, this will be ``None``. Otherwise, it will
    /// contain the loaded object, or `Err` if the load failed.
    object: Mutex<Option<Result<Arc<V>>>>,

    /// Tasks waiting for this object to be loaded
    waiters: Mutex<Vec<Sender<Result<Arc<V>>>>>,
}

/// Makes sure waiters are released and the loader is forgotten even if the loading task is
/// cancelled part way through a load.
struct LoadGuard<'a, K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    cache: &'a Cache<K, V>,
    key: K,
    loader: Arc<Loader<V>>,
    finished: bool,
}

impl<'a, K, V> LoadGuard<'a, K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    fn finish(&mut self, object: &Result<Arc<V>>) {
        self.loader.finish(object);
        self.cache.loaders.lock().remove(&self.key);
        self.finished = true;
    }
}

impl<'a, K, V> Drop for LoadGuard<'a, K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    fn drop(&mut self) {
        if !self.finished {
            self.finish(&Err(Error::Load));
        }
    }
}

/// A structure containing the entries stored in this cache.
///
/// Entries are directly accessible via ``map`` and also stored in a doubly
/// linked list where ``most_recent`` and ``least_recent`` are the two ends.
///
struct Entries<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// Sum of sizes of all entries must stay below this limit.
    limit: u64,

    /// Current sum of sizes of all entries.
    size: u64,

    /// Direct mapping from key to cache entry
    map: HashMap<K, CacheEntry<K, V>>,

    /// The most recently used key
    most_recent: Option<K>,

    /// The least recently used key
    least_recent: Option<K>,
}

/// An entry in the cache
struct CacheEntry<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    key: K,
    object: Arc<V>,

    /// The next more recent key
    more_recent: Option<K>,

    /// The next less recent key
    less_recent: Option<K>,

    /// The size of this entry, as reported by the object's ``Cacheable::size`` method
    size: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// Instantiate an empty cache with given size limit.
    ///
    pub fn new(limit: u64) -> Self {
        let recent = Mutex::new(Entries {
            limit,
            size: 0,
            map: HashMap::new(),
            most_recent: None,
            least_recent: None,
        });
        let loaders = Mutex::new(HashMap::new());

        Self { recent, loaders }
    }

    /// Get an object by key
    ///
    /// If object isn't in the cache, will call ``load`` to load the object and then store it in
    /// the cache. If the same object is already being loaded by another task, this will wait for
    /// that load to finish and then return.
    ///
    pub async fn get<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: FnOnce(K) -> BoxFuture<'static, Result<V>>,
    {
        let object = match self.lookup(key) {
            Some(object) => object,
            None => self.load(key, load).await?,
        };

        Ok(object)
    }

    /// Total size of the objects currently held.
    ///
    #[cfg(test)]
    fn size(&self) -> u64 {
        self.recent.lock().size
    }

    /// Check if an object is already stored in the cache. If it is, move it to the most recently
    /// used position in the linked list and then return a new reference to it.
    ///
    fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.recent.lock();
        let entry = entries.remove(key);
        match entry {
            None => None,
            Some(entry) => {
                let object = Arc::clone(&entry.object);
                entries.push_most_recent(entry);
                Some(object)
            }
        }
    }

    /// Load an object from the underlying data store.
    ///
    /// If another task is already loading the object, wait for that task.
    ///
    async fn load<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: FnOnce(K) -> BoxFuture<'static, Result<V>>,
    {
        let (first, loader) = {
            let mut loaders = self.loaders.lock();
            match loaders.get(key) {
                Some(loader) => (false, Arc::clone(loader)),
                None => {
                    let loader = Arc::new(Loader::new());
                    loaders.insert(*key, Arc::clone(&loader));

                    (true, loader)
                }
            }
        };

        if first {
            // We're the first task to try and load this object, so we'll load it here
            let mut guard = LoadGuard {
                cache: self,
                key: *key,
                loader,
                finished: false,
            };
            let result = load(*key).await.map(Arc::new);
            if let Ok(object) = &result {
                self.recent.lock().insert(*key, object);
            }
            guard.finish(&result);

            result
        } else {
            // Another task is loading this object already, just wait for it to finish
            loader.wait().await
        }
    }
}

impl<V> Loader<V>
where
    V: Cacheable,
{
    fn new() -> Self {
        Loader {
            object: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Inform any waiting tasks that the object has been loaded, or the loading task has given
    /// up trying.
    ///
    fn finish(&self, object: &Result<Arc<V>>) {
        let copy = || match object {
            Ok(object) => Ok(Arc::clone(object)),
            Err(_) => Err(Error::Load),
        };

        let mut waiters = self.waiters.lock();
        *self.object.lock() = Some(copy());
        for waiter in waiters.drain(..) {
            // A waiter that has gone away doesn't need to hear about it
            let _ = waiter.send(copy());
        }
    }

    /// Wait for the loading task to finish loading the object, or give up trying.
    async fn wait(&self) -> Result<Arc<V>> {
        let receive = {
            let mut waiters = self.waiters.lock();
            if let Some(object) = &*self.object.lock() {
                return match object {
                    Ok(object) => Ok(Arc::clone(object)),
                    Err(_) => Err(Error::Load),
                };
            }
            let (send, receive) = channel::<Result<Arc<V>>>();
            waiters.push(send);

            receive
        };

        receive.await.unwrap_or(Err(Error::Load))
    }
}

impl<K, V> Entries<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// Move an entry to the most recently used spot in the linked list.
    ///
    fn push_most_recent(&mut self, entry: CacheEntry<K, V>) {
        let old_head_key = self.most_recent;

        if let Some(old_head_key) = old_head_key {
            // The old head needs to be updated to point to new head in the more recent link
            if let Some(old_head) = self.map.remove(&old_head_key) {
                let less_recent = old_head.less_recent;
                let old_head = old_head.update(Some(entry.key), less_recent);
                self.map.insert(old_head_key, old_head);
            }
        }

        let entry = entry.update(None, old_head_key);
        self.most_recent = Some(entry.key);
        if self.least_recent.is_none() {
            // This is only object in the list, so it is also the tail
            self.least_recent = Some(entry.key);
        }
        self.map.insert(entry.key, entry);
    }

    /// Remove an entry from the cache
    ///
    fn remove(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let entry = self.map.remove(key)?;
        if self.most_recent == Some(entry.key) {
            self.most_recent = entry.less_recent;
        }

        if self.least_recent == Some(entry.key) {
            self.least_recent = entry.more_recent;
        }

        if let Some(key) = entry.less_recent {
            if let Some(less_recent) = self.map.remove(&key) {
                let less_recent_less_recent = less_recent.less_recent;
                let less_recent = less_recent.update(entry.more_recent, less_recent_less_recent);
                self.map.insert(key, less_recent);
            }
        }

        if let Some(key) = entry.more_recent {
            if let Some(more_recent) = self.map.remove(&key) {
                let more_recent_more_recent = more_recent.more_recent;
                let more_recent = more_recent.update(more_recent_more_recent, entry.less_recent);
                self.map.insert(key, more_recent);
            }
        }

        Some(entry)
    }

    /// Add a new object to the cache.
    ///
    /// If the addition of this object causes ``size`` to exceed ``limit``, entries will be evicted
    /// until ``size`` is at or below ``limit`` again before returning.
    ///
    fn insert(&mut self, key: K, object: &Arc<V>) {
        if let Some(existing) = self.remove(&key) {
            self.size -= existing.size;
        }

        let entry = CacheEntry::new(key, object);
        self.size += entry.size;
        self.push_most_recent(entry);

        // Enforce size limit by removing objects from tail (least recent) until size is within
        // limit
        while self.size > self.limit {
            let evicted = match self.least_recent {
                Some(key) => self.remove(&key),
                None => None,
            };
            match evicted {
                Some(evicted) => self.size -= evicted.size,
                None => break,
            }
        }
    }
}

impl<K, V> CacheEntry<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    fn new(key: K, object: &Arc<V>) -> Self {
        Self {
            key,
            object: Arc::clone(object),
            more_recent: None,
            less_recent: None,
            size: object.size(),
        }
    }

    /// Create a copy of this cache entry with updated links to next entries in chain.
    ///
    fn update(self, more_recent: Option<K>, less_recent: Option<K>) -> Self {
        Self {
            key: self.key,
            object: self.object,
            more_recent,
            less_recent,
            size: self.size,
        }
    }
}
