//! Idempotent RAW record stores + HTTP fetch utilities for foodraw.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use foodraw_core::{RawHash, RawRecord, StoredRawRecord};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod http;
mod pg;

pub use http::{
    classify_reqwest_error, classify_status, parse_retry_after, BackoffPolicy, HttpClientConfig,
    HttpFetcher, HttpResponse, HttpSetupError, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use pg::PgRawStore;

pub const CRATE_NAME: &str = "foodraw-storage";

/// Result of a single idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    AlreadyExists,
}

/// Storage failure other than a uniqueness violation.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database write failed for {raw_hash}: {source}")]
    Database {
        raw_hash: RawHash,
        #[source]
        source: sqlx::Error,
    },
    #[error("filesystem write failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing record {raw_hash}: {source}")]
    Serialize {
        raw_hash: RawHash,
        #[source]
        source: serde_json::Error,
    },
    /// The backend cannot hold this payload, e.g. `\u0000` in a Postgres
    /// `jsonb` column. Other records are unaffected.
    #[error("store cannot represent record {raw_hash}: {reason}")]
    Unrepresentable { raw_hash: RawHash, reason: String },
}

impl WriteError {
    /// True when the failure belongs to this record alone and the run may
    /// move on to the next one.
    pub fn is_record_rejection(&self) -> bool {
        matches!(self, Self::Unrepresentable { .. })
    }
}

/// Insert-or-detect-duplicate on `raw_hash`.
///
/// Implementations must enforce uniqueness in the storage layer itself so that
/// concurrent writers of the same fingerprint cannot both insert.
#[async_trait]
pub trait RawStore: Send + Sync {
    async fn insert(&self, record: &RawRecord) -> Result<WriteOutcome, WriteError>;

    fn describe(&self) -> String;
}

#[async_trait]
impl<T: RawStore + ?Sized> RawStore for Box<T> {
    async fn insert(&self, record: &RawRecord) -> Result<WriteOutcome, WriteError> {
        (**self).insert(record).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[async_trait]
impl<T: RawStore + ?Sized> RawStore for Arc<T> {
    async fn insert(&self, record: &RawRecord) -> Result<WriteOutcome, WriteError> {
        (**self).insert(record).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRawStore {
    records: Mutex<HashMap<RawHash, RawRecord>>,
}

impl MemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, raw_hash: &RawHash) -> Option<RawRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(raw_hash)
            .cloned()
    }
}

#[async_trait]
impl RawStore for MemoryRawStore {
    async fn insert(&self, record: &RawRecord) -> Result<WriteOutcome, WriteError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.entry(record.raw_hash()) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(WriteOutcome::AlreadyExists),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(WriteOutcome::Inserted)
            }
        }
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// One JSON document per record under `<root>/<hh>/<raw_hash>.json`.
#[derive(Debug, Clone)]
pub struct FsRawStore {
    root: PathBuf,
}

impl FsRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_relative_path(raw_hash: &RawHash) -> PathBuf {
        PathBuf::from(raw_hash.shard()).join(format!("{raw_hash}.json"))
    }

    pub async fn get(&self, raw_hash: &RawHash) -> anyhow::Result<Option<RawRecord>> {
        let path = self.root.join(Self::record_relative_path(raw_hash));
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading raw record {}", path.display()))
            }
        };
        let stored: StoredRawRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing raw record {}", path.display()))?;
        let record = RawRecord::try_from(stored)
            .with_context(|| format!("verifying raw record {}", path.display()))?;
        Ok(Some(record))
    }

    /// Number of published records; temp files are not counted.
    pub async fn count(&self) -> anyhow::Result<usize> {
        let mut total = 0usize;
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(shards) => shards,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err).with_context(|| format!("listing {}", self.root.display())),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with('.') && name.ends_with(".json") {
                    total += 1;
                }
            }
        }
        Ok(total)
    }

    async fn write_temp(&self, dir: &Path, bytes: &[u8]) -> Result<PathBuf, std::io::Error> {
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        Ok(temp_path)
    }
}

#[async_trait]
impl RawStore for FsRawStore {
    /// Publish via `hard_link(temp, final)`, which fails atomically when the
    /// fingerprint already exists. Readers never observe a partial document.
    async fn insert(&self, record: &RawRecord) -> Result<WriteOutcome, WriteError> {
        let raw_hash = record.raw_hash();
        let absolute_path = self.root.join(Self::record_relative_path(&raw_hash));
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir).await.map_err(|source| WriteError::Io {
            path: dir.clone(),
            source,
        })?;

        let bytes = serde_json::to_vec(record)
            .map_err(|source| WriteError::Serialize { raw_hash, source })?;
        let temp_path = self
            .write_temp(&dir, &bytes)
            .await
            .map_err(|source| WriteError::Io {
                path: dir.clone(),
                source,
            })?;

        let published = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;

        match published {
            Ok(()) => Ok(WriteOutcome::Inserted),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(WriteOutcome::AlreadyExists)
            }
            Err(source) => Err(WriteError::Io {
                path: absolute_path,
                source,
            }),
        }
    }

    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }
}
