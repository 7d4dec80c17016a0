use std::sync::{Mutex, MutexGuard, PoisonError};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::admission::AdmissionController;
use crate::conn::ConnId;

/// The shared collection of all live connections together with the active count that admission
///  control is based on. These are the only pieces of state touched by more than one thread, and
///  a single mutex protects both. Critical sections are short bookkeeping steps and never
///  include a transport call.
///
/// Outside of a held [RegistryGuard], `0 <= active_count <= max_connections` holds and the
///  active count is equal to the number of registered connections.
pub struct Registry<V> {
    inner: Mutex<RegistryInner<V>>,
    admission: AdmissionController,
}

struct RegistryInner<V> {
    live: FxHashMap<ConnId, V>,
    active_count: usize,
}

/// Proof of a successful admission decision. It reserves one unit of capacity (the active count
///  was already incremented) and must be consumed by either [RegistryGuard::register] or
///  [RegistryGuard::withdraw] within the same critical section.
#[must_use]
#[derive(Debug)]
pub struct AdmissionTicket {
    _private: (),
}

impl<V> Registry<V> {
    pub fn new(max_connections: usize) -> Registry<V> {
        Registry {
            inner: Mutex::new(RegistryInner {
                live: FxHashMap::default(),
                active_count: 0,
            }),
            admission: AdmissionController::new(max_connections),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.admission.max_connections()
    }

    /// Enters the critical section. The guard is the only way to admit and register connections.
    pub fn lock(&self) -> RegistryGuard<'_, V> {
        RegistryGuard {
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            admission: &self.admission,
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().inner.live.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().inner.live.is_empty()
    }

    /// Removes a connection, decrementing the active count. Returns `None` and changes nothing
    ///  if the connection is not (or no longer) registered, so releasing twice is harmless.
    pub fn release(&self, id: ConnId) -> Option<V> {
        self.lock().unregister(id)
    }
}

impl<V: Clone> Registry<V> {
    pub fn get(&self, id: ConnId) -> Option<V> {
        self.lock().inner.live.get(&id).cloned()
    }

    /// A point-in-time copy of all registered connections, ordered by id
    pub fn snapshot(&self) -> Vec<(ConnId, V)> {
        let mut result = self.lock().inner.live
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .collect::<Vec<_>>();
        result.sort_by_key(|(id, _)| *id);
        result
    }
}

pub struct RegistryGuard<'a, V> {
    inner: MutexGuard<'a, RegistryInner<V>>,
    admission: &'a AdmissionController,
}

impl<V> RegistryGuard<'_, V> {
    pub fn active_count(&self) -> usize {
        self.inner.active_count
    }

    /// Runs the admission decision, reserving capacity on success
    pub fn try_admit(&mut self) -> Option<AdmissionTicket> {
        if self.admission.try_admit(&mut self.inner.active_count) {
            trace!("admitted, active count is now {}", self.inner.active_count);
            Some(AdmissionTicket { _private: () })
        }
        else {
            trace!("admission denied at {} active connections", self.inner.active_count);
            None
        }
    }

    /// Gives back capacity reserved by a ticket whose connection could not be created
    pub fn withdraw(&mut self, ticket: AdmissionTicket) {
        let AdmissionTicket { .. } = ticket;
        self.inner.active_count -= 1;
    }

    /// Makes an admitted connection reachable through the registry
    pub fn register(&mut self, ticket: AdmissionTicket, id: ConnId, value: V) {
        let AdmissionTicket { .. } = ticket;
        if self.inner.live.insert(id, value).is_some() {
            // an id is never registered twice, so this is a bug - keep the count consistent anyway
            debug_assert!(false, "connection {} was registered twice", id);
            self.inner.active_count -= 1;
        }
    }

    pub fn unregister(&mut self, id: ConnId) -> Option<V> {
        let removed = self.inner.live.remove(&id);
        if removed.is_some() {
            self.inner.active_count = self.inner.active_count.saturating_sub(1);
            trace!("unregistered connection {}, active count is now {}", id, self.inner.active_count);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use super::*;

    fn admit(registry: &Registry<&'static str>, id: u64, value: &'static str) -> bool {
        let mut guard = registry.lock();
        match guard.try_admit() {
            Some(ticket) => {
                guard.register(ticket, ConnId::from_raw(id), value);
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_admit_up_to_limit() {
        let registry = Registry::new(2);

        assert!(admit(&registry, 1, "a"));
        assert!(admit(&registry, 2, "b"));
        assert!(!admit(&registry, 3, "c"));

        assert_eq!(registry.active_count(), 2);
        assert!(registry.contains(ConnId::from_raw(1)));
        assert!(registry.contains(ConnId::from_raw(2)));
        assert!(!registry.contains(ConnId::from_raw(3)));
    }

    #[test]
    fn test_release_frees_capacity() {
        let registry = Registry::new(1);

        assert!(admit(&registry, 1, "p1"));
        assert!(!admit(&registry, 2, "p2"));
        assert_eq!(registry.active_count(), 1);

        assert_eq!(registry.release(ConnId::from_raw(1)), Some("p1"));
        assert_eq!(registry.active_count(), 0);

        assert!(admit(&registry, 2, "p2"));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = Registry::new(3);
        assert!(admit(&registry, 1, "a"));
        assert!(admit(&registry, 2, "b"));

        assert_eq!(registry.release(ConnId::from_raw(1)), Some("a"));
        assert_eq!(registry.release(ConnId::from_raw(1)), None);
        assert_eq!(registry.release(ConnId::from_raw(99)), None);

        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_withdraw() {
        let registry = Registry::<&str>::new(1);
        {
            let mut guard = registry.lock();
            let ticket = guard.try_admit().unwrap();
            assert_eq!(guard.active_count(), 1);
            guard.withdraw(ticket);
            assert_eq!(guard.active_count(), 0);
        }
        assert!(registry.is_empty());
        assert!(admit(&registry, 1, "a"));
    }

    #[test]
    fn test_snapshot_and_get() {
        let registry = Registry::new(5);
        assert!(admit(&registry, 3, "c"));
        assert!(admit(&registry, 1, "a"));
        assert!(admit(&registry, 2, "b"));

        assert_eq!(registry.snapshot(), vec![
            (ConnId::from_raw(1), "a"),
            (ConnId::from_raw(2), "b"),
            (ConnId::from_raw(3), "c"),
        ]);
        assert_eq!(registry.get(ConnId::from_raw(2)), Some("b"));
        assert_eq!(registry.get(ConnId::from_raw(4)), None);
    }

    #[test]
    fn test_concurrent_admission_respects_limit() {
        let registry = Arc::new(Registry::<u64>::new(10));

        let handles = (0..8u64)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut admitted = 0;
                    for i in 0..100u64 {
                        let id = ConnId::from_raw(t * 1000 + i);
                        let mut guard = registry.lock();
                        if let Some(ticket) = guard.try_admit() {
                            assert!(guard.active_count() <= 10);
                            guard.register(ticket, id, i);
                            admitted += 1;
                        }
                        drop(guard);

                        if i % 3 == 0 {
                            registry.release(id);
                        }
                    }
                    admitted
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().unwrap();
        }

        let active = registry.active_count();
        assert!(active <= 10);
        assert_eq!(active, registry.snapshot().len());
    }
}
