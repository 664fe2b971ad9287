use crate::net::conn::{Connection, Inner};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, Weak};

/// Maps stable connection uids to application handles so upper-layer callbacks can
/// address connections across threads. Uids increase monotonically and are never
/// reused; the registry holds weak references and never owns a connection.
pub struct Registry {
    next_uid: AtomicU32,
    map: Mutex<HashMap<u32, Weak<Inner>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            next_uid: AtomicU32::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Assigns a uid to the connection and records it.
    pub fn insert(&self, conn: &Connection) -> u32 {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);

        conn.set_uid(uid);
        self.map
            .lock()
            .expect("Registry lock poisoned")
            .insert(uid, conn.downgrade());

        uid
    }

    /// Resolves a uid back to a live connection handle.
    pub fn get(&self, uid: u32) -> Option<Connection> {
        self.map
            .lock()
            .expect("Registry lock poisoned")
            .get(&uid)
            .and_then(Weak::upgrade)
            .map(Connection::from_inner)
    }

    pub fn remove(&self, uid: u32) {
        self.map.lock().expect("Registry lock poisoned").remove(&uid);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("Registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix::keys::KeyPair;

    fn connection() -> Connection {
        Connection::create(KeyPair::generate(), crate::DEFAULT_BUFFER_SIZE)
    }

    #[test]
    fn test_uids_are_unique_and_monotonic() {
        let registry = Registry::new();

        let a = connection();
        let b = connection();

        let uid_a = registry.insert(&a);
        let uid_b = registry.insert(&b);

        assert!(uid_b > uid_a);
        assert_eq!(a.status(), registry.get(uid_a).unwrap().status());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove() {
        let registry = Registry::new();

        let conn = connection();
        let uid = registry.insert(&conn);

        registry.remove(uid);

        assert!(registry.get(uid).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_registry_does_not_keep_connections_alive() {
        let registry = Registry::new();

        let uid = {
            let conn = connection();
            registry.insert(&conn)
        };

        // The handle is gone, the entry must resolve to nothing.
        assert!(registry.get(uid).is_none());
    }
}
