//! Volume-id to per-volume state, with lazy creation.
//!
//! The factory runs under the registry lock exactly once per volume, which is
//! where rehydration from the on-disk `state` file happens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct VolumeRegistry<V> {
    map: Mutex<HashMap<String, Arc<V>>>,
    make: Box<dyn Fn(&str) -> V + Send + Sync>,
}

impl<V> VolumeRegistry<V> {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn(&str) -> V + Send + Sync + 'static,
    {
        VolumeRegistry {
            map: Mutex::new(HashMap::new()),
            make: Box::new(make),
        }
    }

    pub fn get(&self, vol: &str) -> Arc<V> {
        let mut map = self.map.lock().unwrap();
        if let Some(v) = map.get(vol) {
            return Arc::clone(v);
        }
        let v = Arc::new((self.make)(vol));
        map.insert(vol.to_string(), Arc::clone(&v));
        v
    }

    /// Forget a volume (after `clear-vol`). Existing handles stay valid.
    pub fn remove(&self, vol: &str) {
        self.map.lock().unwrap().remove(vol);
    }

    pub fn list(&self) -> Vec<String> {
        let mut v: Vec<String> = self.map.lock().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}
