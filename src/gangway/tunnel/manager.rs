use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use rand::{RngExt, rng};
use tokio::sync::watch;

use crate::gangway::tunnel::{
    control::{ClientCtrl, ClientSnapshot},
    dispatch::ProxyInfo,
};

/// Version counter bumped whenever sessions or their proxies change.
#[derive(Debug)]
pub struct ChangeFeed {
    tx: watch::Sender<u64>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn bump(&self) {
        self.tx.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Live client sessions keyed by client id.
pub struct ClientManager {
    clients: DashMap<String, Arc<ClientCtrl>>,
    changes: Arc<ChangeFeed>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            changes: Arc::new(ChangeFeed::new()),
        }
    }

    pub fn changes(&self) -> Arc<ChangeFeed> {
        self.changes.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientCtrl>> {
        self.clients.get(id).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Inserts a session under `requested` when that id is free, otherwise
    /// under a fresh random id. `build` receives the id actually assigned.
    pub fn register<F>(&self, requested: &str, build: F) -> Arc<ClientCtrl>
    where
        F: FnOnce(String) -> Arc<ClientCtrl>,
    {
        let requested = requested.trim();
        let mut candidate = if requested.is_empty() {
            new_client_id()
        } else {
            requested.to_string()
        };

        let vacant = loop {
            match self.clients.entry(candidate) {
                Entry::Vacant(v) => break v,
                Entry::Occupied(o) => {
                    tracing::debug!(cid=%o.key(), "tunnel: client id in use; assigning a new one");
                    candidate = new_client_id();
                }
            }
        };

        let ctrl = build(vacant.key().clone());
        vacant.insert(ctrl.clone());
        self.changes.bump();
        ctrl
    }

    /// Removes `id` only while it still maps to `ctrl`.
    pub fn remove(&self, id: &str, ctrl: &Arc<ClientCtrl>) -> bool {
        let removed = self
            .clients
            .remove_if(id, |_, v| Arc::ptr_eq(v, ctrl))
            .is_some();
        if removed {
            self.changes.bump();
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let mut out: Vec<ClientSnapshot> = self.clients.iter().map(|c| c.snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn proxies(&self) -> Vec<ProxyInfo> {
        let mut out: Vec<ProxyInfo> = self
            .clients
            .iter()
            .flat_map(|c| c.proxy_infos())
            .collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id).then(a.name.cmp(&b.name)));
        out
    }

    pub fn close_all(&self) {
        let all: Vec<Arc<ClientCtrl>> = self.clients.iter().map(|c| c.value().clone()).collect();
        for c in all {
            c.close();
        }
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

fn new_client_id() -> String {
    hex::encode(rng().random::<[u8; 8]>())
}
