//! Applies configuration changes to the running gateway
//!
//! `reconcile(old, new)` brings static routes and the container watcher in
//! line with `new`. Each step is applied on its own, so a failure (a watcher
//! that will not stop, a runtime that cannot be reached) is logged and the
//! remaining steps still run.

use crate::config::{DiscoveryConfig, Settings};
use crate::discovery::{Backoff, ContainerRuntime, RuntimeError, WatcherHandle, WatcherState};
use crate::registry::{SharedRegistry, StaticUpsert};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default bound on waiting for the watcher to stop
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a runtime client for a discovery configuration
pub type RuntimeFactory =
    Arc<dyn Fn(&DiscoveryConfig) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> + Send + Sync>;

/// What happened to the watcher during a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherAction {
    Unchanged,
    Started,
    Restarted,
    Stopped,
    /// Discovery is enabled but no runtime client could be created
    StartFailed,
}

/// Summary of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    /// Static routes not applied because a container owns the hostname
    pub skipped_dynamic: Vec<String>,
    pub watcher: WatcherAction,
}

impl ReconcileReport {
    /// True when nothing was written and the watcher was left alone
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.watcher == WatcherAction::Unchanged
    }
}

pub struct Reconciler {
    registry: SharedRegistry,
    runtime_factory: RuntimeFactory,
    shutdown: CancellationToken,
    backoff: Backoff,
    stop_timeout: Duration,
    watcher: Mutex<Option<WatcherHandle>>,
    /// Serializes reconciliations; the watcher slot itself is only locked briefly
    apply_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    /// `shutdown` is the process-wide token; watchers are children of it
    pub fn new(
        registry: SharedRegistry,
        runtime_factory: RuntimeFactory,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            runtime_factory,
            shutdown,
            backoff: Backoff::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            watcher: Mutex::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Whether a watcher task is alive
    pub fn discovery_active(&self) -> bool {
        self.watcher.lock().as_ref().map_or(false, |w| w.is_running())
    }

    /// Subscribe to the current watcher's state, if there is one
    pub fn watcher_state(&self) -> Option<watch::Receiver<WatcherState>> {
        self.watcher.lock().as_ref().map(|w| w.subscribe())
    }

    /// Bring the registry and the watcher in line with `new`.
    ///
    /// With `old = None` the static routes currently in the registry stand in
    /// for the previous configuration.
    pub async fn reconcile(&self, old: Option<&Settings>, new: &Settings) -> ReconcileReport {
        let _guard = self.apply_lock.lock().await;

        let mut report = ReconcileReport {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            unchanged: 0,
            skipped_dynamic: Vec::new(),
            watcher: WatcherAction::Unchanged,
        };

        // 1. Static routes that disappeared
        let wanted: HashSet<&str> = new
            .static_services
            .iter()
            .map(|s| s.hostname.as_str())
            .collect();
        let previous: Vec<String> = match old {
            Some(old) => old.static_services.iter().map(|s| s.hostname.clone()).collect(),
            None => self
                .registry
                .snapshot()
                .into_iter()
                .filter(|(_, e)| e.is_static())
                .map(|(h, _)| h)
                .collect(),
        };
        for hostname in previous {
            if !wanted.contains(hostname.as_str()) && self.registry.remove_static_service(&hostname) {
                report.removed.push(hostname);
            }
        }

        // 2. Static routes to add or update
        for service in &new.static_services {
            match self
                .registry
                .upsert_static_service(&service.hostname, &service.target_url)
            {
                StaticUpsert::Added => report.added.push(service.hostname.clone()),
                StaticUpsert::Updated => report.updated.push(service.hostname.clone()),
                StaticUpsert::Unchanged => report.unchanged += 1,
                StaticUpsert::OwnedByDynamic => report.skipped_dynamic.push(service.hostname.clone()),
            }
        }

        // 3. Watcher lifecycle
        report.watcher = self.reconcile_watcher(&new.discovery).await;

        report.removed.sort();
        report.added.sort();
        report.updated.sort();
        report.skipped_dynamic.sort();

        if report.is_noop() {
            info!(unchanged = report.unchanged, "Configuration applied, nothing changed");
        } else {
            info!(
                added = ?report.added,
                updated = ?report.updated,
                removed = ?report.removed,
                unchanged = report.unchanged,
                skipped_dynamic = ?report.skipped_dynamic,
                watcher = ?report.watcher,
                "Configuration applied"
            );
        }
        report
    }

    async fn reconcile_watcher(&self, desired: &DiscoveryConfig) -> WatcherAction {
        let current = {
            let mut slot = self.watcher.lock();
            let keep = match slot.as_ref() {
                Some(w) => w.is_running() && desired.enabled && w.config() == desired,
                None => !desired.enabled,
            };
            if keep {
                return WatcherAction::Unchanged;
            }
            slot.take()
        };

        let had_watcher = match current {
            Some(handle) => {
                let was_running = handle.is_running();
                if let Err(e) = handle.stop(self.stop_timeout).await {
                    error!(error = %e, "Failed to stop container watcher cleanly");
                }
                was_running
            }
            None => false,
        };

        if !desired.enabled {
            let removed = self.registry.remove_dynamic_services();
            if !removed.is_empty() {
                info!(count = removed.len(), "Discovery disabled, container routes removed");
            }
            return if had_watcher {
                WatcherAction::Stopped
            } else {
                WatcherAction::Unchanged
            };
        }

        let runtime = match (self.runtime_factory)(desired) {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Cannot create container runtime client, discovery inactive");
                return WatcherAction::StartFailed;
            }
        };

        let handle = WatcherHandle::spawn(
            runtime,
            Arc::clone(&self.registry),
            desired.clone(),
            self.backoff,
            &self.shutdown,
        );
        *self.watcher.lock() = Some(handle);

        if had_watcher {
            WatcherAction::Restarted
        } else {
            WatcherAction::Started
        }
    }

    /// Stop the watcher, waiting at most the stop timeout
    pub async fn shutdown(&self) {
        let _guard = self.apply_lock.lock().await;
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.stop(self.stop_timeout).await {
                warn!(error = %e, "Container watcher did not shut down cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticService;
    use crate::registry::{ServiceRegistry, SourceKind};

    fn failing_factory() -> RuntimeFactory {
        Arc::new(|_: &DiscoveryConfig| -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
            Err(RuntimeError::Unavailable("no runtime in unit tests".into()))
        })
    }

    fn settings(services: &[(&str, &str)]) -> Settings {
        Settings {
            static_services: services
                .iter()
                .map(|(h, t)| StaticService::new(h, t))
                .collect(),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_initial_reconcile_adds_static_routes() {
        let registry = ServiceRegistry::new();
        let reconciler = Reconciler::new(Arc::clone(&registry), failing_factory(), CancellationToken::new());

        let new = settings(&[("a.test", "http://127.0.0.1:1"), ("b.test", "http://127.0.0.1:2")]);
        let report = reconciler.reconcile(None, &new).await;

        assert_eq!(report.added, vec!["a.test".to_string(), "b.test".to_string()]);
        assert_eq!(report.watcher, WatcherAction::Unchanged);
        assert_eq!(registry.resolve("a.test").as_deref(), Some("http://127.0.0.1:1"));
        assert!(!reconciler.discovery_active());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let registry = ServiceRegistry::new();
        let reconciler = Reconciler::new(Arc::clone(&registry), failing_factory(), CancellationToken::new());
        let old = settings(&[("a.test", "http://127.0.0.1:1")]);
        let new = settings(&[("b.test", "http://127.0.0.1:2")]);

        reconciler.reconcile(None, &old).await;
        let first = reconciler.reconcile(Some(&old), &new).await;
        assert_eq!(first.removed, vec!["a.test".to_string()]);
        assert_eq!(first.added, vec!["b.test".to_string()]);

        let before = registry.snapshot();
        let second = reconciler.reconcile(Some(&old), &new).await;
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 1);
        assert_eq!(registry.snapshot(), before);
    }

    #[tokio::test]
    async fn test_removed_static_does_not_clobber_dynamic() {
        let registry = ServiceRegistry::new();
        let reconciler = Reconciler::new(Arc::clone(&registry), failing_factory(), CancellationToken::new());
        let old = settings(&[("c.test", "http://127.0.0.1:1")]);
        reconciler.reconcile(None, &old).await;

        // A container takes the hostname over
        registry.add_service("c.test", "http://c9:80", SourceKind::Dynamic, Some("c9"));

        let report = reconciler.reconcile(Some(&old), &settings(&[])).await;
        assert!(report.removed.is_empty());
        assert_eq!(registry.resolve("c.test").as_deref(), Some("http://c9:80"));
    }

    #[tokio::test]
    async fn test_static_does_not_override_dynamic() {
        let registry = ServiceRegistry::new();
        registry.add_service("c.test", "http://c9:80", SourceKind::Dynamic, Some("c9"));
        let reconciler = Reconciler::new(Arc::clone(&registry), failing_factory(), CancellationToken::new());

        let report = reconciler
            .reconcile(None, &settings(&[("c.test", "http://127.0.0.1:1")]))
            .await;
        assert_eq!(report.skipped_dynamic, vec!["c.test".to_string()]);
        assert_eq!(registry.resolve("c.test").as_deref(), Some("http://c9:80"));
    }

    #[tokio::test]
    async fn test_updated_target() {
        let registry = ServiceRegistry::new();
        let reconciler = Reconciler::new(Arc::clone(&registry), failing_factory(), CancellationToken::new());
        let old = settings(&[("a.test", "http://127.0.0.1:1")]);
        let new = settings(&[("a.test", "http://127.0.0.1:2")]);

        reconciler.reconcile(None, &old).await;
        let report = reconciler.reconcile(Some(&old), &new).await;
        assert_eq!(report.updated, vec!["a.test".to_string()]);
        assert_eq!(registry.resolve("a.test").as_deref(), Some("http://127.0.0.1:2"));
    }

    #[tokio::test]
    async fn test_discovery_start_failure_is_reported() {
        let registry = ServiceRegistry::new();
        let reconciler = Reconciler::new(Arc::clone(&registry), failing_factory(), CancellationToken::new());

        let mut new = settings(&[("a.test", "http://127.0.0.1:1")]);
        new.discovery.enabled = true;
        let report = reconciler.reconcile(None, &new).await;

        assert_eq!(report.watcher, WatcherAction::StartFailed);
        assert_eq!(report.added, vec!["a.test".to_string()]);
        assert!(!reconciler.discovery_active());
    }
}
