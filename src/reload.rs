//! Configuration change sources
//!
//! Both the file watcher and SIGHUP go through `reload_settings`, so an
//! invalid file is logged and the running configuration is kept. The signal
//! path runs on the async runtime and uses `reload_settings_async`.

use crate::config::Settings;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Load the configuration file for a reload; `None` if it is unusable
pub fn reload_settings(path: &Path) -> Option<Settings> {
    match Settings::load(path) {
        Ok(settings) => Some(settings),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to reload configuration, keeping current settings");
            None
        }
    }
}

/// `reload_settings` on the blocking pool, for callers on the async runtime
pub async fn reload_settings_async(path: PathBuf) -> Option<Settings> {
    match tokio::task::spawn_blocking(move || reload_settings(&path)).await {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Configuration reload task failed");
            None
        }
    }
}

/// Watches the configuration file and sends every valid version of it
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<Settings>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<Settings>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    ///
    /// The parent directory is watched rather than the file, so editors that
    /// save by renaming a new file into place are still picked up.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !ours {
                        return;
                    }
                    debug!(path = %path.display(), "Configuration file change detected");
                    if let Some(settings) = reload_settings(&path) {
                        let _ = tx.send(settings);
                    }
                }
                Err(e) => error!(error = %e, "Configuration watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!(path = %self.path.display(), "Configuration watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "[auth]\nenabled = false\n";

    #[test]
    fn test_reload_settings_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moat.toml");

        std::fs::write(&path, "this is = = not toml").unwrap();
        assert!(reload_settings(&path).is_none());

        std::fs::write(&path, BASE).unwrap();
        assert!(reload_settings(&path).is_some());
    }

    #[tokio::test]
    async fn test_reload_settings_async() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moat.toml");

        assert!(reload_settings_async(path.clone()).await.is_none());

        std::fs::write(
            &path,
            format!(
                "{}\n[[static_services]]\nhostname = \"a.test\"\ntarget_url = \"http://127.0.0.1:9001\"\n",
                BASE
            ),
        )
        .unwrap();
        let settings = reload_settings_async(path).await.unwrap();
        assert_eq!(settings.static_services.len(), 1);
    }

    #[tokio::test]
    async fn test_watcher_sends_updated_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moat.toml");
        std::fs::write(&path, BASE).unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&path);
        let _guard = watcher.run().unwrap();

        std::fs::write(
            &path,
            format!(
                "{}\n[[static_services]]\nhostname = \"a.test\"\ntarget_url = \"http://127.0.0.1:9001\"\n",
                BASE
            ),
        )
        .unwrap();

        // A single save can produce several events; wait for the final content
        let received = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let settings = rx.recv().await.unwrap();
                if !settings.static_services.is_empty() {
                    return settings;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(received.static_services[0].hostname, "a.test");
    }
}
