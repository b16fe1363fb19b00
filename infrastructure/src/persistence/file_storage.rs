// ./infrastructure/src/persistence/file_storage.rs
use application::{KeyValueStorage, StorageError};
use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Key-value area backed by a directory, one `<key>.json` file per slot.
///
/// Writes land in a hidden temporary file first and are renamed over the slot,
/// so a failed write leaves the previous contents in place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens (and creates if needed) the data directory.
    #[instrument(skip_all)]
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::Write {
                key: root.display().to_string(),
                source: Box::new(e),
            })?;
        debug!(root = %root.display(), "File storage ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_path(&self, key: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(format!("{}.json", checked_key(key)?)))
    }

    fn temp_path(&self, key: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(format!(".{}.json.tmp", checked_key(key)?)))
    }

    async fn write_through_temp(&self, key: &str, value: &str) -> io::Result<()> {
        let target = self.slot_path(key)?;
        let temp = self.temp_path(key)?;

        let result = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&temp, &target).await
        }
        .await;

        if result.is_err() {
            // Best effort: the slot itself was never touched.
            if let Err(e) = fs::remove_file(&temp).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(slot = %key, "Could not clean up temporary slot file: {}", e);
                }
            }
        }
        result
    }
}

/// Slot keys become file names, so only `[A-Za-z0-9_-]` is accepted.
fn checked_key(key: &str) -> io::Result<&str> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(key)
    } else {
        Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid slot key '{key}'"),
        ))
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    #[instrument(skip(self))]
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let read_error = |e: io::Error| StorageError::Read {
            key: key.to_string(),
            source: Box::new(e),
        };
        let path = self.slot_path(key).map_err(read_error)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                debug!(slot = %key, bytes = contents.len(), "Slot read from disk");
                Ok(Some(contents))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(read_error(e)),
        }
    }

    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write_through_temp(key, value)
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_string(),
                source: Box::new(e),
            })?;
        debug!(slot = %key, "Slot written to disk");
        Ok(())
    }
}
