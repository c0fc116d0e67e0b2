//! Label-to-ID maps for the section registry.
//!
//! Two maps coexist. The shared registry assigns the authoritative ID a
//! section keeps for its whole life and is the enumeration the report
//! phase walks; only its insertions take a lock. The thread-local map is
//! a label-to-ID cache that makes repeated `start`/`stop` lookups cheap;
//! it is an implementation detail and never leaves this module's
//! accessors.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

/// The authoritative label enumeration, shared by all threads.
pub(crate) struct SharedRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    index: HashMap<String, usize>,
    labels: Vec<String>,
}

impl SharedRegistry {
    pub fn new() -> SharedRegistry {
        SharedRegistry {
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                labels: Vec::new(),
            }),
        }
    }

    /// The ID of `label`, if registered.
    pub fn find(&self, label: &str) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(label).copied()
    }

    /// Register `label`, returning its stable ID. Idempotent.
    pub fn add(&self, label: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.index.get(label) {
            return id;
        }
        let id = inner.labels.len();
        inner.labels.push(label.to_string());
        inner.index.insert(label.to_string(), id);
        id
    }

    /// The label behind `id`.
    pub fn label_of(&self, id: usize) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.labels.get(id).cloned()
    }

    /// Number of registered sections.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().labels.len()
    }

    /// Snapshot of all labels in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.inner.lock().unwrap().labels.clone()
    }
}

struct LocalCache {
    serial: u64,
    map: HashMap<String, usize>,
}

thread_local! {
    static CACHE: RefCell<LocalCache> = RefCell::new(LocalCache {
        serial: 0,
        map: HashMap::new(),
    });
}

/// The calling thread's label cache, scoped to one monitor instance.
///
/// Thread-local IDs from a previous monitor in the same process must not
/// leak into a new one, so the cache is tagged with the monitor serial
/// and cleared on mismatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalRegistry {
    serial: u64,
}

impl LocalRegistry {
    pub fn new(serial: u64) -> LocalRegistry {
        LocalRegistry { serial }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, usize>) -> R) -> R {
        CACHE.with(|c| {
            let mut cache = c.borrow_mut();
            if cache.serial != self.serial {
                cache.serial = self.serial;
                cache.map.clear();
            }
            f(&mut cache.map)
        })
    }

    pub fn find(&self, label: &str) -> Option<usize> {
        self.with(|map| map.get(label).copied())
    }

    pub fn put(&self, label: &str, id: usize) {
        self.with(|map| {
            map.insert(label.to_string(), id);
        });
    }

    /// Sections known to the calling thread.
    pub fn count(&self) -> usize {
        self.with(|map| map.len())
    }

    /// Fill the calling thread's cache from the shared enumeration.
    /// Returns the IDs that were missing here, in registration order.
    pub fn complete_from(&self, shared: &SharedRegistry) -> Vec<usize> {
        let labels = shared.labels();
        self.with(|map| {
            let mut added = Vec::new();
            for (id, label) in labels.into_iter().enumerate() {
                if !map.contains_key(&label) {
                    map.insert(label, id);
                    added.push(id);
                }
            }
            added
        })
    }
}
