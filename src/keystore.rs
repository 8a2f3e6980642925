use async_trait::async_trait;
use cvcore::keys::KeyBundle;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence seam for recovered credentials. Keys saved after one run are
/// offered back on the next so the operator does not re-enter them.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn save_keys(&self, account: &str, keys: &KeyBundle) -> Result<()>;
    async fn load_keys(&self, account: &str) -> Result<Option<KeyBundle>>;
}

pub struct FileKeyStore {
    base_path: PathBuf,
}

impl FileKeyStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn sanitize_filename(key: &str) -> String {
        key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_")
    }

    fn key_path(&self, account: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.json", Self::sanitize_filename(account)))
    }

    async fn read_json(&self, path: &Path) -> Result<Option<KeyBundle>> {
        match fs::read(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write_json(&self, path: &Path, value: &KeyBundle) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(path, data).await.map_err(StoreError::Io)
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn save_keys(&self, account: &str, keys: &KeyBundle) -> Result<()> {
        self.write_json(&self.key_path(account), keys).await
    }

    async fn load_keys(&self, account: &str) -> Result<Option<KeyBundle>> {
        self.read_json(&self.key_path(account)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> KeyBundle {
        KeyBundle {
            database_key: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                .to_string(),
            xor_key: Some(0xA5),
            aes_key: Some("abcdefghij123456".to_string()),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path()).await.unwrap();

        store.save_keys("user@example.com", &sample_bundle()).await.unwrap();
        let loaded = store.load_keys("user@example.com").await.unwrap();

        assert_eq!(loaded, Some(sample_bundle()));
    }

    #[tokio::test]
    async fn missing_account_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path()).await.unwrap();

        assert_eq!(store.load_keys("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn account_names_are_sanitized_into_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path()).await.unwrap();

        store.save_keys("a/b\\c:d", &sample_bundle()).await.unwrap();

        assert!(dir.path().join("a_b_c_d.json").exists());
        assert_eq!(store.load_keys("a/b\\c:d").await.unwrap(), Some(sample_bundle()));
    }
}
