use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("router: {domain}{prefix} is already registered")]
    Conflict { domain: String, prefix: String },
}

struct Entry<T> {
    prefix: String,
    value: T,
}

/// Domain + URL-prefix routing table.
///
/// Each domain keeps its entries sorted by prefix in reverse lexical order, so
/// a prefix always sorts ahead of any shorter prefix of itself and the first
/// match in [`HostRouter::get`] is the most specific one.
pub struct HostRouter<T> {
    domains: RwLock<HashMap<String, Vec<Entry<T>>>>,
}

impl<T> std::fmt::Debug for HostRouter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRouter").finish_non_exhaustive()
    }
}

impl<T> Default for HostRouter<T> {
    fn default() -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
        }
    }
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_prefix(prefix: &str) -> String {
    let p = prefix.trim();
    if p.is_empty() {
        "/".to_string()
    } else {
        p.to_string()
    }
}

impl<T: Clone> HostRouter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `(domain, prefix)` unless that exact pair already exists.
    pub fn register(&self, domain: &str, prefix: &str, value: T) -> Result<(), RouterError> {
        let domain = normalize_domain(domain);
        let prefix = normalize_prefix(prefix);

        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        let entries = domains.entry(domain.clone()).or_default();
        if entries.iter().any(|e| e.prefix == prefix) {
            return Err(RouterError::Conflict { domain, prefix });
        }
        entries.push(Entry { prefix, value });
        entries.sort_by(|a, b| b.prefix.cmp(&a.prefix));
        Ok(())
    }

    /// Most specific entry whose prefix is a prefix of `url`.
    pub fn get(&self, domain: &str, url: &str) -> Option<T> {
        let domain = normalize_domain(domain);
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains
            .get(&domain)?
            .iter()
            .find(|e| url.starts_with(e.prefix.as_str()))
            .map(|e| e.value.clone())
    }

    /// Entry registered under exactly `prefix`.
    pub fn find(&self, domain: &str, prefix: &str) -> Option<T> {
        let domain = normalize_domain(domain);
        let prefix = normalize_prefix(prefix);
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains
            .get(&domain)?
            .iter()
            .find(|e| e.prefix == prefix)
            .map(|e| e.value.clone())
    }

    #[cfg(test)]
    pub fn remove(&self, domain: &str, prefix: &str) -> Option<T> {
        self.remove_if(domain, prefix, |_| true)
    }

    /// Removes the exact `(domain, prefix)` entry when `pred` accepts its value.
    pub fn remove_if(&self, domain: &str, prefix: &str, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let domain = normalize_domain(domain);
        let prefix = normalize_prefix(prefix);

        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        let entries = domains.get_mut(&domain)?;
        let idx = entries.iter().position(|e| e.prefix == prefix)?;
        if !pred(&entries[idx].value) {
            return None;
        }
        let removed = entries.remove(idx);
        if entries.is_empty() {
            domains.remove(&domain);
        }
        Some(removed.value)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains.values().map(Vec::len).sum()
    }
}
