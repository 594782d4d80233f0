//! Live connections indexed by session and by domain

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::connection::Connection;

#[derive(Debug, Default)]
struct Indices {
    /// Transport session id -> connection
    by_session: HashMap<String, Arc<Connection>>,
    /// Domain -> connections in registration order
    by_domain: HashMap<String, Vec<Arc<Connection>>>,
}

/// Both indices live behind one lock so every mutation updates them together
///
/// When a caller needs the registry lock and a connection's own lock, the
/// registry lock is taken first.
#[derive(Debug, Default)]
pub struct Registry {
    indices: RwLock<Indices>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection under its session and domain
    pub fn add(&self, connection: Arc<Connection>) {
        let session_id = connection.session().session_id();
        let mut indices = self.write();

        if let Some(previous) = indices
            .by_session
            .insert(session_id.clone(), connection.clone())
        {
            // Same session registered twice; keep the domain index in step
            remove_from_domain(&mut indices.by_domain, &previous);
        }

        indices
            .by_domain
            .entry(connection.domain().to_string())
            .or_default()
            .push(connection.clone());

        debug!(
            backend_id = %connection.id(),
            domain = %connection.domain(),
            session_id = %session_id,
            "Connection registered"
        );
    }

    /// Remove a connection from both indices
    ///
    /// Returns the removed entry, or None if it was not registered.
    pub fn remove(&self, connection: &Connection) -> Option<Arc<Connection>> {
        let session_id = connection.session().session_id();
        let mut indices = self.write();

        let registered = indices
            .by_session
            .get(&session_id)
            .is_some_and(|current| current.id() == connection.id());
        if !registered {
            return None;
        }

        let removed = indices.by_session.remove(&session_id)?;
        remove_from_domain(&mut indices.by_domain, &removed);

        trace!(backend_id = %removed.id(), "Connection unregistered");
        Some(removed)
    }

    /// Connections registered for `domain`, usable or not
    pub fn snapshot_domain(&self, domain: &str) -> Vec<Arc<Connection>> {
        self.read()
            .by_domain
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot_all(&self) -> Vec<Arc<Connection>> {
        self.read().by_session.values().cloned().collect()
    }

    pub fn find(&self, id: &str) -> Option<Arc<Connection>> {
        self.read()
            .by_session
            .values()
            .find(|connection| connection.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the two indices describe exactly the same set of connections
    pub fn is_consistent(&self) -> bool {
        let indices = self.read();

        let domain_total: usize = indices.by_domain.values().map(Vec::len).sum();
        if domain_total != indices.by_session.len() {
            return false;
        }

        indices.by_domain.iter().all(|(domain, connections)| {
            !connections.is_empty()
                && connections.iter().all(|connection| {
                    connection.domain() == domain.as_str()
                        && indices
                            .by_session
                            .get(&connection.session().session_id())
                            .is_some_and(|registered| Arc::ptr_eq(registered, connection))
                })
        })
    }
}

fn remove_from_domain(by_domain: &mut HashMap<String, Vec<Arc<Connection>>>, target: &Connection) {
    if let Some(connections) = by_domain.get_mut(target.domain()) {
        connections.retain(|connection| connection.id() != target.id());
        if connections.is_empty() {
            by_domain.remove(target.domain());
        }
    }
}
