use super::{SelectorError, types::SelectorConfig};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Where the last accepted selector config is kept between restarts.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<Option<SelectorConfig>, SelectorError>;
    async fn save(&self, config: &SelectorConfig) -> Result<(), SelectorError>;
}

/// JSON file on disk, replaced atomically on save.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn load(&self) -> Result<Option<SelectorConfig>, SelectorError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let config = serde_json::from_str(&raw)?;
        Ok(Some(config))
    }

    async fn save(&self, config: &SelectorConfig) -> Result<(), SelectorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-process store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    slot: tokio::sync::Mutex<Option<SelectorConfig>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with(config: SelectorConfig) -> Self {
        Self {
            slot: tokio::sync::Mutex::new(Some(config)),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self) -> Result<Option<SelectorConfig>, SelectorError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, config: &SelectorConfig) -> Result<(), SelectorError> {
        *self.slot.lock().await = Some(config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::defaults::DEFAULT_SELECTOR_CONFIG;

    #[tokio::test]
    async fn file_store_round_trips_and_creates_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("cache").join("selectors.json"));
        assert!(store.load().await.expect("load").is_none());

        let mut config = DEFAULT_SELECTOR_CONFIG.clone();
        config.version = "1.1.0".into();
        store.save(&config).await.expect("save");
        let loaded = store.load().await.expect("load").expect("config");
        assert_eq!(loaded, config);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("selectors.json");
        std::fs::write(&path, "{not json").expect("write");
        let store = FileStore::new(path);
        assert!(matches!(store.load().await, Err(SelectorError::Decode(_))));
    }
}
