//! Hostname → backend routing table
//!
//! The registry is pure state: a single mutex around the routing table, held
//! only for the duration of one map operation. It never performs I/O and never
//! expires entries on its own; the reconciler and the container watcher
//! drive every mutation.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a routing entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Defined in the configuration file
    Static,
    /// Derived from a running, labeled container
    Dynamic,
}

/// A single routing entry, keyed by hostname in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEntry {
    /// Backend base URL: scheme, authority and an optional path prefix
    pub target_url: String,
    pub source: SourceKind,
    /// Owning container id for dynamic entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl ServiceEntry {
    pub fn fixed(target_url: &str) -> Self {
        Self {
            target_url: target_url.to_string(),
            source: SourceKind::Static,
            origin_id: None,
        }
    }

    pub fn discovered(target_url: &str, origin_id: &str) -> Self {
        Self {
            target_url: target_url.to_string(),
            source: SourceKind::Dynamic,
            origin_id: Some(origin_id.to_string()),
        }
    }

    pub fn is_static(&self) -> bool {
        self.source == SourceKind::Static
    }
}

#[derive(Debug, Default)]
struct Routes {
    services: HashMap<String, ServiceEntry>,
    /// Static targets displaced by a container, restored when it lets go
    shadowed: HashMap<String, String>,
}

impl Routes {
    /// Drop a dynamic entry, putting back the static route it displaced.
    /// Returns the restored target, if any.
    fn release(&mut self, hostname: &str) -> Option<String> {
        self.services.remove(hostname);
        let target = self.shadowed.remove(hostname)?;
        self.services
            .insert(hostname.to_string(), ServiceEntry::fixed(&target));
        Some(target)
    }

    fn release_where<F>(&mut self, owned: F) -> Vec<(String, Option<String>)>
    where
        F: Fn(&str, &ServiceEntry) -> bool,
    {
        let hostnames: Vec<String> = self
            .services
            .iter()
            .filter(|(h, e)| e.source == SourceKind::Dynamic && owned(h.as_str(), e))
            .map(|(h, _)| h.clone())
            .collect();
        hostnames
            .into_iter()
            .map(|h| {
                let restored = self.release(&h);
                (h, restored)
            })
            .collect()
    }
}

/// Concurrency-safe service registry, shared by handle
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    routes: Mutex<Routes>,
}

/// Shared handle passed to the proxy, the watcher and the reconciler
pub type SharedRegistry = Arc<ServiceRegistry>;

fn log_released(released: &[(String, Option<String>)], origin_id: Option<&str>, reason: &str) {
    for (hostname, restored) in released {
        match restored {
            Some(target) => {
                info!(hostname, origin = ?origin_id, target, reason, "Container route removed, static service restored")
            }
            None => info!(hostname, origin = ?origin_id, reason, "Service removed"),
        }
    }
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace the entry for `hostname` (last write wins).
    ///
    /// A dynamic entry that replaces a static one keeps the static target
    /// aside; it comes back once no container claims the hostname.
    pub fn add_service(
        &self,
        hostname: &str,
        target_url: &str,
        source: SourceKind,
        origin_id: Option<&str>,
    ) {
        let entry = ServiceEntry {
            target_url: target_url.to_string(),
            source,
            origin_id: origin_id.map(str::to_string),
        };

        let previous = {
            let mut routes = self.routes.lock();
            let previous = routes.services.insert(hostname.to_string(), entry);
            match (&previous, source) {
                (Some(old), SourceKind::Dynamic) if old.is_static() => {
                    routes
                        .shadowed
                        .insert(hostname.to_string(), old.target_url.clone());
                }
                (_, SourceKind::Static) => {
                    routes.shadowed.remove(hostname);
                }
                _ => {}
            }
            previous
        };

        match previous {
            Some(old) if old.target_url == target_url && old.source == source => {
                debug!(hostname, target = target_url, ?source, "Service refreshed");
            }
            _ => {
                info!(hostname, target = target_url, ?source, origin = ?origin_id, "Service added");
            }
        }
    }

    /// Remove the entry for `hostname`, if any, along with any static route
    /// it displaced. Returns the removed entry.
    pub fn remove_service(&self, hostname: &str) -> Option<ServiceEntry> {
        let removed = {
            let mut routes = self.routes.lock();
            routes.shadowed.remove(hostname);
            routes.services.remove(hostname)
        };
        if removed.is_some() {
            info!(hostname, "Service removed");
        }
        removed
    }

    /// Withdraw the static route for `hostname`.
    ///
    /// A live static entry is removed. When a container owns the hostname its
    /// entry stays, and only the displaced static route is forgotten. The
    /// check and the removal happen under one lock acquisition, so a
    /// container claiming the hostname concurrently is never clobbered.
    pub fn remove_static_service(&self, hostname: &str) -> bool {
        let removed = {
            let mut routes = self.routes.lock();
            match routes.services.get(hostname) {
                Some(entry) if entry.is_static() => routes.services.remove(hostname).is_some(),
                Some(_) => routes.shadowed.remove(hostname).is_some(),
                None => false,
            }
        };
        if removed {
            info!(hostname, "Static service removed");
        }
        removed
    }

    /// Insert a static entry unless the hostname is currently owned by a
    /// container, or the identical static entry is already present. A
    /// container-owned hostname records the target for when it is released.
    pub fn upsert_static_service(&self, hostname: &str, target_url: &str) -> StaticUpsert {
        let outcome = {
            let mut routes = self.routes.lock();
            match routes.services.get(hostname) {
                Some(entry) if entry.source == SourceKind::Dynamic => {
                    routes
                        .shadowed
                        .insert(hostname.to_string(), target_url.to_string());
                    StaticUpsert::OwnedByDynamic
                }
                Some(entry) if entry.target_url == target_url => StaticUpsert::Unchanged,
                existing => {
                    let outcome = if existing.is_some() {
                        StaticUpsert::Updated
                    } else {
                        StaticUpsert::Added
                    };
                    routes
                        .services
                        .insert(hostname.to_string(), ServiceEntry::fixed(target_url));
                    outcome
                }
            }
        };

        match outcome {
            StaticUpsert::Added | StaticUpsert::Updated => {
                info!(hostname, target = target_url, ?outcome, "Static service applied");
            }
            StaticUpsert::Unchanged => {}
            StaticUpsert::OwnedByDynamic => {
                info!(hostname, "Static service deferred, hostname is owned by a container");
            }
        }
        outcome
    }

    /// Remove every dynamic entry owned by `origin_id`; returns the removed hostnames
    pub fn remove_services_by_origin(&self, origin_id: &str) -> Vec<String> {
        let released = self
            .routes
            .lock()
            .release_where(|_, e| e.origin_id.as_deref() == Some(origin_id));

        log_released(&released, Some(origin_id), "container gone");
        released.into_iter().map(|(h, _)| h).collect()
    }

    /// Remove entries owned by `origin_id` whose hostname is not in `keep`.
    ///
    /// Used after a container's labels change, once its new hostnames are in
    /// place, so the routes it still claims never go missing in between.
    pub fn retain_origin_hostnames(&self, origin_id: &str, keep: &[String]) -> Vec<String> {
        let released = self.routes.lock().release_where(|h, e| {
            e.origin_id.as_deref() == Some(origin_id) && !keep.iter().any(|k| k == h)
        });

        log_released(&released, Some(origin_id), "label changed");
        released.into_iter().map(|(h, _)| h).collect()
    }

    /// Remove every dynamic entry; returns the removed hostnames
    pub fn remove_dynamic_services(&self) -> Vec<String> {
        let released = self.routes.lock().release_where(|_, _| true);

        log_released(&released, None, "discovery disabled");
        released.into_iter().map(|(h, _)| h).collect()
    }

    /// Resolve a hostname to its backend base URL
    pub fn resolve(&self, hostname: &str) -> Option<String> {
        self.routes
            .lock()
            .services
            .get(hostname)
            .map(|e| e.target_url.clone())
    }

    /// Get the full entry for a hostname
    pub fn get(&self, hostname: &str) -> Option<ServiceEntry> {
        self.routes.lock().services.get(hostname).cloned()
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> HashMap<String, ServiceEntry> {
        self.routes.lock().services.clone()
    }

    /// Distinct container ids that currently own at least one entry
    pub fn dynamic_origins(&self) -> Vec<String> {
        let routes = self.routes.lock();
        let mut origins: Vec<String> = routes
            .services
            .values()
            .filter(|e| e.source == SourceKind::Dynamic)
            .filter_map(|e| e.origin_id.clone())
            .collect();
        origins.sort();
        origins.dedup();
        origins
    }

    pub fn len(&self) -> usize {
        self.routes.lock().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().services.is_empty()
    }
}

/// Result of applying a static entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticUpsert {
    Added,
    Updated,
    Unchanged,
    /// A container currently owns the hostname; the static route was not applied
    OwnedByDynamic,
}
