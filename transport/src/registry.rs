//! The loop's socket registry.
//!
//! Maps a registry key (the primary descriptor number) to its tracked
//! socket. Keys are kernel-unique for live descriptors. Insertions
//! happen at accept time on the loop thread; removals happen from
//! whichever task performs the second cleanup; lookups happen per epoll
//! event — hence the lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::socket::TrackedSocket;

pub(crate) struct Registry {
    map: Mutex<HashMap<u32, Arc<TrackedSocket>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, socket: Arc<TrackedSocket>) {
        self.map.lock().insert(socket.key(), socket);
    }

    pub fn get(&self, key: u32) -> Option<Arc<TrackedSocket>> {
        self.map.lock().get(&key).cloned()
    }

    pub fn remove(&self, key: u32) -> Option<Arc<TrackedSocket>> {
        self.map.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<TrackedSocket>> {
        self.map.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::FdHandle;
    use crate::sys;

    fn tracked() -> Arc<TrackedSocket> {
        let (r, w) = sys::pipe().unwrap();
        sys::close(w);
        TrackedSocket::pipe_end(FdHandle::new(r))
    }

    #[test]
    fn insert_lookup_remove() {
        let registry = Registry::new();
        let socket = tracked();
        let key = socket.key();

        registry.insert(socket);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(key).is_some());
        assert!(registry.get(key ^ 1).is_none());

        assert!(registry.remove(key).is_some());
        assert!(registry.remove(key).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = Registry::new();
        let socket = tracked();
        let key = socket.key();
        registry.insert(socket);

        let snapshot = registry.snapshot();
        registry.remove(key);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 0);
    }
}
