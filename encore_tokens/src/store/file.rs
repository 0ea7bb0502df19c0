//! A key-value store backed by a local JSON file

use std::{collections::BTreeMap, ffi::OsString, io, path::PathBuf};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{KeyValueStore, StoreError};

type Slots = BTreeMap<String, String>;

/// A key-value store that keeps every slot in a single JSON object on disk
///
/// The file is created on first write with owner-only permissions on unix.
/// A missing file reads as an empty store. Each write goes to a sibling
/// `.tmp` file that is then renamed over the target, so a reader never
/// observes a partially written file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Constructs a new file store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read_slots(&self) -> Result<Slots, StoreError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Slots::new()),
            Err(err) => return Err(err.into()),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(Slots::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    async fn write_slots(&self, slots: &Slots) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let staging = self.staging_path();
        let mut file = file_opts.open(&staging).await?;
        let data = serde_json::to_string_pretty(slots)?;
        file.write_all(data.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn update(&self, edit: impl FnOnce(&mut Slots) -> bool) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut slots = self.read_slots().await?;
        if edit(&mut slots) {
            self.write_slots(&slots).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_slots().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|slots| {
            slots.insert(key.to_owned(), value.to_owned());
            true
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|slots| slots.remove(key).is_some()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use color_eyre::Result;

    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path().join("absent.json"));

        assert_eq!(store.get("spotify_access_token").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn values_survive_a_new_store_instance() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("tokens.json");

        let store = FileStore::new(&path);
        store.set("spotify_access_token", "a1").await?;
        store.set("spotify_refresh_token", "r1").await?;
        store.remove("spotify_refresh_token").await?;

        let reopened = FileStore::new(&path);
        assert_eq!(
            reopened.get("spotify_access_token").await?.as_deref(),
            Some("a1")
        );
        assert_eq!(reopened.get("spotify_refresh_token").await?, None);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tokens.json");
        FileStore::new(&path).set("token", "i1").await?;

        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_never_observe_a_partial_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tokens.json");
        let store = Arc::new(FileStore::new(&path));
        store.set("spotify_access_token", "a1").await?;

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..200 {
                    store
                        .set("spotify_token_expiry", &i.to_string())
                        .await?;
                }
                Ok::<_, StoreError>(())
            })
        };

        for _ in 0..200 {
            assert_eq!(
                store.get("spotify_access_token").await?.as_deref(),
                Some("a1")
            );
        }

        writer.await??;
        assert!(!dir.path().join("tokens.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "not json")?;

        let err = FileStore::new(&path).get("token").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        Ok(())
    }
}
