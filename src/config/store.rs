use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::StreamerConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads, so the frame pump and encoder
/// threads can read settings on every tick without contention.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<StreamerConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Load configuration from a file, writing defaults when it does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        let config: StreamerConfig = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| AppError::Config(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, writing defaults", path.display());
                let config = StreamerConfig::default();
                Self::save_to_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        config.validate()?;
        Ok(Self::with_path(config, Some(path.to_path_buf())))
    }

    /// In-memory store that never persists
    pub fn in_memory(config: StreamerConfig) -> Self {
        Self::with_path(config, None)
    }

    fn with_path(config: StreamerConfig, path: Option<PathBuf>) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    async fn save_to_file(path: &Path, config: &StreamerConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = toml::to_string_pretty(config).map_err(|e| AppError::Config(e.to_string()))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<StreamerConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub async fn set(&self, config: StreamerConfig) -> Result<()> {
        config.validate()?;
        if let Some(ref path) = self.path {
            Self::save_to_file(path, &config).await?;
        }
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "streamer_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; for concurrent updates the last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StreamerConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("streamer.toml");

        let store = ConfigStore::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get().capture.fps, 60);

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.capture.fps = 30;
                c.signalling.send_player_id_as_integer = true;
            })
            .await
            .unwrap();

        assert_eq!(changes.recv().await.unwrap().key, "streamer_config");
        assert_eq!(store.get().capture.fps, 30);

        // Reload from disk
        let store2 = ConfigStore::load(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.capture.fps, 30);
        assert!(config.signalling.send_player_id_as_integer);
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "capture = 5").await.unwrap();

        match ConfigStore::load(&path).await {
            Err(AppError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unencodable_codec_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vp8.toml");
        tokio::fs::write(&path, "[encoder]\ncodec = \"vp8\"\n").await.unwrap();
        assert!(matches!(
            ConfigStore::load(&path).await,
            Err(AppError::Config(_))
        ));

        let store = ConfigStore::in_memory(StreamerConfig::default());
        let result = store.update(|c| c.encoder.codec = crate::config::CodecKind::Vp8).await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(store.get().encoder.codec, crate::config::CodecKind::H264);
    }
}
