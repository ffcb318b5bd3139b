//! Container event watcher
//!
//! Derives dynamic registry entries from container labels and keeps them in
//! step with the container lifecycle. The watcher moves through
//! `Starting → Scanning → Listening`, and back to `Stopped` via `Stopping`
//! when cancelled.
//!
//! The event stream is subscribed before the initial scan, so containers
//! that start while the scan runs are queued rather than missed. After a
//! stream failure the watcher reconnects with backoff and rescans, pruning
//! entries for containers that went away in the meantime.

use crate::config::DiscoveryConfig;
use crate::registry::{SharedRegistry, SourceKind};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending events held while a scan or resync is running
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Errors reported by a container runtime
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container runtime error: {0}")]
    Api(String),
}

/// Errors from managing the watcher task
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("watcher did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("watcher task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A port published on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub private_port: u16,
    pub host_ip: Option<String>,
    pub host_port: u16,
}

/// What the watcher needs to know about a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without the leading slash
    pub name: String,
    pub labels: HashMap<String, String>,
    pub published_ports: Vec<PublishedPort>,
    /// Running and not paused
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Die,
    Pause,
    Unpause,
}

impl ContainerAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(ContainerAction::Start),
            "stop" => Some(ContainerAction::Stop),
            "die" => Some(ContainerAction::Die),
            "pause" => Some(ContainerAction::Pause),
            "unpause" => Some(ContainerAction::Unpause),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Die => "die",
            ContainerAction::Pause => "pause",
            ContainerAction::Unpause => "unpause",
        }
    }

    /// Actions that take a container out of service
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            ContainerAction::Stop | ContainerAction::Die | ContainerAction::Pause
        )
    }

    /// The lifecycle actions the watcher subscribes to
    pub fn all() -> [ContainerAction; 5] {
        [
            ContainerAction::Start,
            ContainerAction::Stop,
            ContainerAction::Die,
            ContainerAction::Pause,
            ContainerAction::Unpause,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub action: ContainerAction,
    pub container_id: String,
}

/// Source of container metadata and lifecycle events
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime API is reachable
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Containers that are currently running
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Current state of one container; `NotFound` if it no longer exists
    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Subscribe to lifecycle events. The stream ends or yields an error
    /// when the connection to the runtime is lost.
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>>;
}

/// Exponential backoff with jitter (0 to 10% on top of the delay)
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}

/// Reconnect delays for the runtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base, self.max)
    }
}

/// Routing decision for one container's labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelDecision {
    Route {
        hostnames: Vec<String>,
        target_url: String,
    },
    /// `<prefix>.enable` is absent or not "true"
    NotEnabled,
    Invalid(String),
}

fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
        && !hostname.starts_with('.')
        && !hostname.ends_with('.')
}

/// Backend URL for a container port: the published host port when there is
/// one, otherwise the container name on the shared network
fn target_for(info: &ContainerInfo, port: u16) -> String {
    let published = info
        .published_ports
        .iter()
        .find(|p| p.private_port == port && p.host_port != 0);

    if let Some(binding) = published {
        let ip = match binding.host_ip.as_deref() {
            None | Some("") | Some("0.0.0.0") | Some("::") => "127.0.0.1".to_string(),
            Some(ip) if ip.contains(':') => format!("[{}]", ip),
            Some(ip) => ip.to_string(),
        };
        return format!("http://{}:{}", ip, binding.host_port);
    }

    let host = if info.name.is_empty() { &info.id } else { &info.name };
    format!("http://{}:{}", host, port)
}

/// Apply the label contract: `<prefix>.enable = "true"`,
/// `<prefix>.hostname` (comma-separated for several names), `<prefix>.port`
pub fn evaluate_labels(info: &ContainerInfo, prefix: &str) -> LabelDecision {
    let label = |key: &str| info.labels.get(&format!("{}.{}", prefix, key)).map(|v| v.trim());

    if label("enable") != Some("true") {
        return LabelDecision::NotEnabled;
    }

    let hostnames: Vec<String> = match label("hostname") {
        Some(value) => value
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect(),
        None => Vec::new(),
    };
    if hostnames.is_empty() {
        return LabelDecision::Invalid(format!("missing {}.hostname label", prefix));
    }
    if let Some(bad) = hostnames.iter().find(|h| !is_valid_hostname(h)) {
        return LabelDecision::Invalid(format!("invalid hostname '{}'", bad));
    }

    let port = match label("port") {
        Some(value) => match value.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return LabelDecision::Invalid(format!("invalid port '{}'", value)),
        },
        None => return LabelDecision::Invalid(format!("missing {}.port label", prefix)),
    };

    LabelDecision::Route {
        hostnames,
        target_url: target_for(info, port),
    }
}

/// Lifecycle of the watcher task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Scanning,
    Listening,
    Stopping,
}

enum WatchMessage {
    Event(ContainerEvent),
    /// The event stream was re-established; events may have been missed
    Resync,
}

/// Handle to a running watcher
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<WatcherState>,
    config: DiscoveryConfig,
}

impl WatcherHandle {
    /// Start watching `runtime`. The watcher also stops when `parent` is cancelled.
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        registry: SharedRegistry,
        config: DiscoveryConfig,
        backoff: Backoff,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let (state_tx, state) = watch::channel(WatcherState::Starting);

        let worker = Worker {
            runtime,
            registry,
            label_prefix: config.label_prefix.clone(),
            backoff,
            state: state_tx,
        };
        let task = tokio::spawn(worker.run(cancel.clone()));

        info!(label_prefix = %config.label_prefix, "Container watcher started");

        Self {
            cancel,
            task,
            state,
            config,
        }
    }

    /// Configuration this watcher was started with
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the watcher to stop and wait up to `timeout` for it to finish.
    /// A watcher that does not finish in time is aborted.
    pub async fn stop(self, timeout: Duration) -> Result<(), WatcherError> {
        let WatcherHandle { cancel, mut task, .. } = self;
        cancel.cancel();

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {
                info!("Container watcher stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(WatcherError::Join(e)),
            Err(_) => {
                task.abort();
                Err(WatcherError::StopTimeout(timeout))
            }
        }
    }
}

struct Worker {
    runtime: Arc<dyn ContainerRuntime>,
    registry: SharedRegistry,
    label_prefix: String,
    backoff: Backoff,
    state: watch::Sender<WatcherState>,
}

impl Worker {
    fn set_state(&self, state: WatcherState) {
        self.state.send_replace(state);
        debug!(?state, "Container watcher state");
    }

    /// Sleep for the backoff delay; false if cancelled first
    async fn wait_backoff(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        self.listen(&cancel).await;
        self.set_state(WatcherState::Stopped);
    }

    async fn listen(&self, cancel: &CancellationToken) {
        self.set_state(WatcherState::Starting);
        let mut attempt = 0u32;
        loop {
            let ping = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.runtime.ping() => result,
            };
            match ping {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Container runtime not reachable, retrying");
                    if !self.wait_backoff(attempt, cancel).await {
                        return;
                    }
                }
            }
        }

        // Subscribe first so nothing that happens during the scan is lost
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let pump_cancel = cancel.child_token();
        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.runtime),
            tx,
            pump_cancel.clone(),
            self.backoff,
        ));

        self.set_state(WatcherState::Scanning);
        let mut attempt = 0u32;
        loop {
            let scan = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.resync() => result,
            };
            match scan {
                Ok(count) => {
                    info!(containers = count, "Initial container scan complete");
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Initial container scan failed, retrying");
                    if !self.wait_backoff(attempt, cancel).await {
                        break;
                    }
                }
            }
        }

        if !cancel.is_cancelled() {
            self.set_state(WatcherState::Listening);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(WatchMessage::Event(event)) => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = self.handle_event(event) => {}
                            }
                        }
                        Some(WatchMessage::Resync) => {
                            let resync = tokio::select! {
                                _ = cancel.cancelled() => break,
                                result = self.resync() => result,
                            };
                            match resync {
                                Ok(count) => info!(containers = count, "Resynchronized after reconnect"),
                                Err(e) => warn!(error = %e, "Resync after reconnect failed"),
                            }
                        }
                        None => {
                            warn!("Container event pump exited");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(WatcherState::Stopping);
        pump_cancel.cancel();
        let _ = pump.await;
    }

    /// Route (or unroute) one container according to its labels
    fn apply_container(&self, info: &ContainerInfo) {
        if !info.running {
            self.remove_container(&info.id, "not running");
            return;
        }

        match evaluate_labels(info, &self.label_prefix) {
            LabelDecision::Route {
                hostnames,
                target_url,
            } => {
                for hostname in &hostnames {
                    match self.registry.get(hostname) {
                        Some(existing) if existing.is_static() => {
                            warn!(hostname, container = %info.name, "Container overrides static service");
                        }
                        Some(existing) if existing.origin_id.as_deref() != Some(info.id.as_str()) => {
                            warn!(hostname, container = %info.name, "Hostname taken over from another container");
                        }
                        _ => {}
                    }
                    self.registry
                        .add_service(hostname, &target_url, SourceKind::Dynamic, Some(&info.id));
                }
                self.registry.retain_origin_hostnames(&info.id, &hostnames);
            }
            LabelDecision::NotEnabled => {
                self.remove_container(&info.id, "routing not enabled");
            }
            LabelDecision::Invalid(reason) => {
                warn!(container = %info.name, id = %info.id, %reason, "Ignoring container with invalid labels");
                self.remove_container(&info.id, "invalid labels");
            }
        }
    }

    fn remove_container(&self, id: &str, reason: &str) {
        let removed = self.registry.remove_services_by_origin(id);
        if !removed.is_empty() {
            debug!(id, reason, ?removed, "Container routes withdrawn");
        }
    }

    /// Route every running container and drop entries for containers that
    /// are gone. Returns the number of running containers seen.
    async fn resync(&self) -> Result<usize, RuntimeError> {
        let containers = self.runtime.list_running().await?;

        let mut seen = HashSet::new();
        for info in &containers {
            seen.insert(info.id.as_str());
            self.apply_container(info);
        }

        for origin in self.registry.dynamic_origins() {
            if !seen.contains(origin.as_str()) {
                self.remove_container(&origin, "no longer running");
            }
        }

        Ok(containers.len())
    }

    async fn handle_event(&self, event: ContainerEvent) {
        debug!(action = event.action.as_str(), id = %event.container_id, "Container event");

        if event.action.is_removal() {
            self.remove_container(&event.container_id, event.action.as_str());
            return;
        }

        match self.runtime.inspect(&event.container_id).await {
            Ok(info) => self.apply_container(&info),
            Err(RuntimeError::NotFound(_)) => {
                self.remove_container(&event.container_id, "vanished before inspection");
            }
            Err(e) => {
                warn!(id = %event.container_id, error = %e, "Failed to inspect container, skipping event");
            }
        }
    }
}

/// Forward runtime events to the watcher, reconnecting with backoff when the
/// stream drops. A `Resync` is queued after every reconnect.
async fn pump_events(
    runtime: Arc<dyn ContainerRuntime>,
    tx: mpsc::Sender<WatchMessage>,
    cancel: CancellationToken,
    backoff: Backoff,
) {
    let mut failures = 0u32;
    let mut reconnecting = false;

    loop {
        if reconnecting {
            let ping = tokio::select! {
                _ = cancel.cancelled() => return,
                result = runtime.ping() => result,
            };
            if let Err(e) = ping {
                failures = failures.saturating_add(1);
                warn!(error = %e, attempt = failures, "Container runtime still unreachable");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff.delay(failures)) => continue,
                }
            }
            info!("Reconnected to container runtime");
            if tx.send(WatchMessage::Resync).await.is_err() {
                return;
            }
        }

        let mut stream = runtime.events();
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    failures = 0;
                    if tx.send(WatchMessage::Event(event)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Container event stream failed");
                    break;
                }
                None => {
                    warn!("Container event stream ended");
                    break;
                }
            }
        }

        failures = failures.saturating_add(1);
        reconnecting = true;
        let delay = backoff.delay(failures);
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting to container runtime");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(labels: &[(&str, &str)]) -> ContainerInfo {
        ContainerInfo {
            id: "abc123".to_string(),
            name: "web".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            published_ports: Vec::new(),
            running: true,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);

        assert_eq!(calculate_backoff(0, base, max), Duration::ZERO);
        assert!(calculate_backoff(1, base, max) >= Duration::from_millis(100));
        assert!(calculate_backoff(1, base, max) < Duration::from_millis(110));
        assert!(calculate_backoff(2, base, max) >= Duration::from_millis(200));

        let capped = calculate_backoff(40, base, max);
        assert!(capped >= max);
        assert!(capped < Duration::from_millis(1100));
    }

    #[test]
    fn test_labels_route_by_container_name() {
        let info = container(&[
            ("moat.enable", "true"),
            ("moat.hostname", "App.Test"),
            ("moat.port", "8080"),
        ]);

        assert_eq!(
            evaluate_labels(&info, "moat"),
            LabelDecision::Route {
                hostnames: vec!["app.test".to_string()],
                target_url: "http://web:8080".to_string(),
            }
        );
    }

    #[test]
    fn test_labels_prefer_published_port() {
        let mut info = container(&[
            ("moat.enable", "true"),
            ("moat.hostname", "app.test"),
            ("moat.port", "80"),
        ]);
        info.published_ports = vec![
            PublishedPort {
                private_port: 443,
                host_ip: None,
                host_port: 8443,
            },
            PublishedPort {
                private_port: 80,
                host_ip: Some("0.0.0.0".to_string()),
                host_port: 32768,
            },
        ];

        assert_eq!(
            evaluate_labels(&info, "moat"),
            LabelDecision::Route {
                hostnames: vec!["app.test".to_string()],
                target_url: "http://127.0.0.1:32768".to_string(),
            }
        );

        info.published_ports[1].host_ip = Some("10.0.0.2".to_string());
        match evaluate_labels(&info, "moat") {
            LabelDecision::Route { target_url, .. } => assert_eq!(target_url, "http://10.0.0.2:32768"),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_labels_multiple_hostnames() {
        let info = container(&[
            ("moat.enable", "true"),
            ("moat.hostname", "a.test, b.test"),
            ("moat.port", "80"),
        ]);
        match evaluate_labels(&info, "moat") {
            LabelDecision::Route { hostnames, .. } => {
                assert_eq!(hostnames, vec!["a.test".to_string(), "b.test".to_string()])
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_labels_not_enabled() {
        let info = container(&[("moat.hostname", "a.test"), ("moat.port", "80")]);
        assert_eq!(evaluate_labels(&info, "moat"), LabelDecision::NotEnabled);

        let info = container(&[
            ("moat.enable", "yes"),
            ("moat.hostname", "a.test"),
            ("moat.port", "80"),
        ]);
        assert_eq!(evaluate_labels(&info, "moat"), LabelDecision::NotEnabled);

        // Labels under another prefix are ignored
        let info = container(&[
            ("edge.enable", "true"),
            ("edge.hostname", "a.test"),
            ("edge.port", "80"),
        ]);
        assert_eq!(evaluate_labels(&info, "moat"), LabelDecision::NotEnabled);
        assert!(matches!(evaluate_labels(&info, "edge"), LabelDecision::Route { .. }));
    }

    #[test]
    fn test_labels_invalid() {
        let cases: &[&[(&str, &str)]] = &[
            &[("moat.enable", "true"), ("moat.port", "80")],
            &[("moat.enable", "true"), ("moat.hostname", " "), ("moat.port", "80")],
            &[("moat.enable", "true"), ("moat.hostname", "a b"), ("moat.port", "80")],
            &[("moat.enable", "true"), ("moat.hostname", "a.test")],
            &[("moat.enable", "true"), ("moat.hostname", "a.test"), ("moat.port", "http")],
            &[("moat.enable", "true"), ("moat.hostname", "a.test"), ("moat.port", "0")],
            &[("moat.enable", "true"), ("moat.hostname", "a.test"), ("moat.port", "70000")],
        ];

        for labels in cases {
            assert!(
                matches!(evaluate_labels(&container(labels), "moat"), LabelDecision::Invalid(_)),
                "expected invalid for {:?}",
                labels
            );
        }
    }

    #[test]
    fn test_container_action_parse() {
        for action in ContainerAction::all() {
            assert_eq!(ContainerAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ContainerAction::parse("kill"), None);
        assert!(ContainerAction::Pause.is_removal());
        assert!(!ContainerAction::Unpause.is_removal());
    }
}
