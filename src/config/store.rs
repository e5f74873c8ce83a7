use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by an optional TOML file
///
/// Uses `ArcSwap` for lock-free reads; the resolved config is handed to the
/// startup sequence as a snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load from `path`. A missing file gives the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                let config: AppConfig = toml::from_str(&text)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            Some(path) => {
                info!("{} not found, using defaults", path.display());
                AppConfig::default()
            }
            None => AppConfig::default(),
        };

        Ok(Self {
            path: path.map(Path::to_path_buf),
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Apply a modification in memory
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.cache.load_full()).clone();
        f(&mut config);
        self.cache.store(Arc::new(config));
    }

    /// Serialize the current configuration
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(&*self.get())?)
    }

    /// Write the current configuration back to its file
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| AppError::Config("no configuration file to save to".to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(Some(&dir.path().join("absent.toml"))).unwrap();
        let config = store.get();
        assert_eq!(*config, AppConfig::default());
        assert_eq!(config.delivery.queue_size, 10);
        assert_eq!(config.delivery.multicast_ttl, 5);
        assert_eq!(config.delivery.segmented_path, "ts");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
[video]
device = "/dev/video2,hw:1,0"
formats = ["H264", "MJPG"]

[delivery]
segment_secs = 2
multicast_endpoint = "239.0.0.1:30000"
"#,
        )
        .unwrap();

        let config = ConfigStore::load(Some(&path)).unwrap().get();
        assert_eq!(config.video.device, "/dev/video2,hw:1,0");
        assert_eq!(config.video.formats, vec!["H264", "MJPG"]);
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.delivery.segment_secs, 2);
        assert_eq!(
            config.delivery.multicast_endpoint.as_deref(),
            Some("239.0.0.1:30000")
        );
        assert_eq!(config.rtsp.port, 8554);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[video\nwidth = ").unwrap();
        assert!(matches!(
            ConfigStore::load(Some(&path)),
            Err(AppError::TomlDe(_))
        ));
    }

    #[test]
    fn update_then_save_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/relay.toml");
        let store = ConfigStore::load(Some(&path)).unwrap();
        store.update(|c| c.rtsp.port = 9554);
        store.save().unwrap();

        let reloaded = ConfigStore::load(Some(&path)).unwrap().get();
        assert_eq!(reloaded.rtsp.port, 9554);
    }

    #[test]
    fn save_without_path_fails() {
        let store = ConfigStore::load(None).unwrap();
        assert!(matches!(store.save(), Err(AppError::Config(_))));
    }
}
