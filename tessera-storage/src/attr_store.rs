//! Attribute sidecar files: the durable source of truth.
//!
//! One pretty-printed JSON file per stored object at `<root>/<file_id>.json`.
//! Writes go to a hidden temp file in the same directory, are fsynced, then
//! renamed over the target, so readers only ever see a complete old or a
//! complete new record.

use std::path::{Path, PathBuf};

use tessera_core::{
    AttributeRecord, DurabilityError, FileId, StorageError, TesseraResult,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const RECORD_EXTENSION: &str = ".json";
const TEMP_MARKER: &str = ".tmp-";

/// Directory of attribute sidecars.
#[derive(Debug, Clone)]
pub struct AttributeStore {
    root: PathBuf,
}

impl AttributeStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> TesseraResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_id: FileId) -> PathBuf {
        self.root.join(format!("{}{}", file_id, RECORD_EXTENSION))
    }

    /// Read a record. A missing file is `Ok(None)`; unparsable JSON is an error.
    pub async fn read(&self, file_id: FileId) -> TesseraResult<Option<AttributeRecord>> {
        let path = self.path_for(file_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e).into()),
        };
        let record: AttributeRecord =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptRecord {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if record.file_id != file_id {
            return Err(StorageError::CorruptRecord {
                path: path.display().to_string(),
                reason: format!("sidecar holds record {}", record.file_id),
            }
            .into());
        }
        Ok(Some(record))
    }

    pub async fn exists(&self, file_id: FileId) -> TesseraResult<bool> {
        let path = self.path_for(file_id);
        fs::try_exists(&path).await.map_err(|e| io_error(&path, e).into())
    }

    /// Atomically replace the sidecar of `record.file_id`.
    pub async fn write_atomic(&self, record: &AttributeRecord) -> Result<(), DurabilityError> {
        let file_id = record.file_id;
        let fail = |reason: String| DurabilityError::AtomicWriteFailed { file_id, reason };

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| fail(e.to_string()))?;
        let target = self.path_for(file_id);
        let temp = self.root.join(format!(
            ".{}{}{}{}",
            file_id,
            RECORD_EXTENSION,
            TEMP_MARKER,
            Uuid::now_v7().simple()
        ));

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        ctx_path = %temp.display(),
                        error = %cleanup,
                        "Failed to remove temp sidecar after write failure"
                    );
                }
            }
            return Err(fail(e.to_string()));
        }

        self.sync_dir().await;
        Ok(())
    }

    /// Remove the sidecar. Returns `false` if it was already absent.
    pub async fn remove(&self, file_id: FileId) -> Result<bool, DurabilityError> {
        match fs::remove_file(self.path_for(file_id)).await {
            Ok(()) => {
                self.sync_dir().await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DurabilityError::AtomicWriteFailed {
                file_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Start a streaming scan over the record ids in the directory.
    pub async fn scan(&self) -> TesseraResult<AttrScan> {
        let entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        Ok(AttrScan {
            root: self.root.clone(),
            entries,
        })
    }

    /// Count sidecars with a full directory pass.
    pub async fn count(&self) -> TesseraResult<u64> {
        let mut scan = self.scan().await?;
        let mut count = 0u64;
        while scan.next_id().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Remove temp files left behind by an interrupted write.
    pub async fn cleanup_temp_files(&self) -> TesseraResult<u64> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        let mut removed = 0u64;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.root, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_temp_name(name) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    ctx_path = %entry.path().display(),
                    error = %e,
                    "Failed to remove stray temp sidecar"
                ),
            }
        }
        Ok(removed)
    }

    async fn sync_dir(&self) {
        // Persists the rename itself; not every platform allows opening a directory.
        match fs::File::open(&self.root).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    tracing::debug!(ctx_path = %self.root.display(), error = %e, "Directory fsync skipped");
                }
            }
            Err(e) => {
                tracing::debug!(ctx_path = %self.root.display(), error = %e, "Directory fsync skipped");
            }
        }
    }
}

/// Streaming iterator over sidecar ids. Holds one directory handle, never the
/// full id set.
#[derive(Debug)]
pub struct AttrScan {
    root: PathBuf,
    entries: fs::ReadDir,
}

impl AttrScan {
    /// Next record id, skipping temp files and foreign files.
    pub async fn next_id(&mut self) -> TesseraResult<Option<FileId>> {
        loop {
            let Some(entry) = self
                .entries
                .next_entry()
                .await
                .map_err(|e| io_error(&self.root, e))?
            else {
                return Ok(None);
            };
            let name = entry.file_name();
            if let Some(file_id) = name.to_str().and_then(parse_record_name) {
                return Ok(Some(file_id));
            }
        }
    }
}

fn parse_record_name(name: &str) -> Option<FileId> {
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(RECORD_EXTENSION)?.parse().ok()
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

fn io_error(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
