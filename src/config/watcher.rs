//! Hot reload of the network file.
//!
//! Editors tend to emit several modify events per save. Each one reloads
//! the file, but a config equal to the last one forwarded is dropped, so
//! the client only reconciles on real changes.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::NetworkConfig;

/// Watches one config file and forwards every new valid version.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<NetworkConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of its update channel.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<NetworkConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. Updates stop when the returned watcher is dropped.
    ///
    /// The file as it is right now counts as already delivered.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let mut last_sent = load_config(&self.path).ok();
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = ?e, "Watch error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }

                let config = match load_config(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(path = ?path, error = %e, "Reload failed, keeping current network");
                        return;
                    }
                };

                if last_sent.as_ref() == Some(&config) {
                    tracing::trace!(path = ?path, "Config unchanged, skipping");
                    return;
                }
                tracing::info!(path = ?path, nodes = config.nodes.len(), "Config changed, forwarding");
                last_sent = Some(config.clone());
                if tx.send(config).is_err() {
                    tracing::debug!("Config receiver dropped");
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_forwards_changed_config() {
        let path = std::env::temp_dir().join(format!("node-network-watch-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "[[nodes]]\nkey = \"0.0.3\"\naddress = \"h1:50211\"\n").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(&path);
        let _watcher = watcher.run().unwrap();

        fs::write(
            &path,
            "[[nodes]]\nkey = \"0.0.3\"\naddress = \"h1:50211\"\n\n[[nodes]]\nkey = \"0.0.4\"\naddress = \"h2:50211\"\n",
        )
        .unwrap();

        let config = tokio::time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .expect("no update within 10s")
            .unwrap();
        assert_eq!(config.nodes.len(), 2);
        fs::remove_file(&path).unwrap();
    }
}
