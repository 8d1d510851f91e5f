use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, SocketAddr},
    sync::{PoisonError, RwLock},
};

use rand::{RngExt, rng};
use thiserror::Error;

pub const DEFAULT_MIN_PORT: u16 = 10000;
pub const DEFAULT_MAX_PORT: u16 = 11000;
const LOWEST_ALLOWED_PORT: u16 = 3000;
/// Other free ports probed after the requested one.
const MAX_PROBES: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no port available in {min}-{max} (requested {requested})")]
    Unavailable { requested: u16, min: u16, max: u16 },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PortLease {
    pub port: u16,
    pub proxy: String,
}

#[derive(Debug, Default)]
struct PortTable {
    free: BTreeSet<u16>,
    used: HashMap<u16, String>,
}

/// Server-wide lease table for TCP proxy listen ports.
#[derive(Debug)]
pub struct PortAllocator {
    bind_ip: IpAddr,
    min: u16,
    max: u16,
    table: RwLock<PortTable>,
}

impl PortAllocator {
    /// Ranges that are inverted or dip below 3000 fall back to 10000-11000.
    pub fn new(bind_ip: IpAddr, min: u16, max: u16) -> Self {
        let (min, max) = if min > max || min < LOWEST_ALLOWED_PORT {
            tracing::warn!(min, max, "tunnel: invalid port range; using defaults");
            (DEFAULT_MIN_PORT, DEFAULT_MAX_PORT)
        } else {
            (min, max)
        };

        Self {
            bind_ip,
            min,
            max,
            table: RwLock::new(PortTable {
                free: (min..=max).collect(),
                used: HashMap::new(),
            }),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Leases `requested` when it is free and bindable, otherwise a few other
    /// free ports starting from a random position in the free set.
    pub fn acquire(&self, owner: &str, requested: u16) -> Result<u16, PortError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);

        if requested != 0 && table.free.contains(&requested) && self.probe(requested) {
            lease(&mut table, requested, owner);
            return Ok(requested);
        }

        let candidates: Vec<u16> = table
            .free
            .iter()
            .copied()
            .filter(|p| *p != requested)
            .collect();
        if !candidates.is_empty() {
            let start = rng().random_range(0..candidates.len());
            let window = candidates[start..]
                .iter()
                .chain(candidates[..start].iter())
                .take(MAX_PROBES);
            for &port in window {
                if self.probe(port) {
                    lease(&mut table, port, owner);
                    return Ok(port);
                }
            }
        }

        Err(PortError::Unavailable {
            requested,
            min: self.min,
            max: self.max,
        })
    }

    /// Returns the port to the free set. Releasing an unleased port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.used.remove(&port).is_none() {
            return false;
        }
        table.free.insert(port);
        true
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.used.get(&port).cloned()
    }

    pub fn leases(&self) -> Vec<PortLease> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<PortLease> = table
            .used
            .iter()
            .map(|(port, proxy)| PortLease {
                port: *port,
                proxy: proxy.clone(),
            })
            .collect();
        out.sort_by_key(|l| l.port);
        out
    }

    fn probe(&self, port: u16) -> bool {
        std::net::TcpListener::bind(SocketAddr::new(self.bind_ip, port)).is_ok()
    }
}

fn lease(table: &mut PortTable, port: u16, owner: &str) {
    table.free.remove(&port);
    table.used.insert(port, owner.to_string());
}
