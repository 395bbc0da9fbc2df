//! Durable + session key/value persistence for Quill snapshots.
//!
//! Two directory-backed namespaces, one file per key. The durable namespace
//! survives restarts; the session namespace belongs to exactly one session
//! id and is wiped whenever a different session opens it, mirroring
//! session-scoped browser storage. The adapter is a pure transcoding
//! boundary: it owns no copy of the records and applies no merge logic.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use quill_core::{QuoteDraft, QuoteRecord};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "quill-storage";

/// Durable key holding the full quote-list JSON array.
pub const QUOTES_KEY: &str = "quotes";
/// Durable key holding the last-selected category filter string.
pub const LAST_FILTER_KEY: &str = "last_filter";
/// Durable key holding the last successful sync timestamp (RFC 3339).
pub const LAST_SYNC_KEY: &str = "last_sync";
/// Session key holding the last-displayed record JSON.
pub const LAST_QUOTE_KEY: &str = "last_quote";
/// Session key naming the session id that owns the namespace.
const SESSION_MARKER_KEY: &str = "session_id";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("value under key {key} is not valid JSON: {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("value under key {key} is not a JSON array")]
    NotAnArray { key: String },
    #[error("value under key {key} is not a valid timestamp: {source}")]
    Timestamp {
        key: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl StorageError {
    fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    fn parse(key: &str, source: serde_json::Error) -> Self {
        Self::Parse {
            key: key.to_string(),
            source,
        }
    }
}

/// One string-valued key/value namespace backed by a directory.
#[derive(Debug, Clone)]
pub struct KvNamespace {
    root: PathBuf,
}

impl KvNamespace {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io("<namespace>", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.key_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    /// Overwrite the value under `key` via temp file + atomic rename, so a
    /// crashed write never leaves a half-written value behind.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let target = self.key_path(key);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.flush().await.map_err(|e| StorageError::io(key, e))?;
        drop(file);

        match fs::rename(&temp_path, &target).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::io(key, err))
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }
}

/// The persistence adapter: typed accessors over the durable and session
/// namespaces under one data directory.
#[derive(Debug, Clone)]
pub struct QuoteStorage {
    durable: KvNamespace,
    session: KvNamespace,
}

impl QuoteStorage {
    /// Open both namespaces under `data_dir`. The session namespace carries
    /// a marker naming the session that owns it; opening under a different
    /// `session_id` wipes it first, so each new session starts empty while
    /// reopens within the same session keep their data.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        session_id: &str,
    ) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        let session_dir = data_dir.join("session");

        let session = KvNamespace::open(&session_dir).await?;
        let owner = session.get(SESSION_MARKER_KEY).await?;
        if owner.as_deref() != Some(session_id) {
            match fs::remove_dir_all(&session_dir).await {
                Ok(()) => debug!(path = %session_dir.display(), "session namespace reset"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::io("<session>", err)),
            }
            let session = KvNamespace::open(&session_dir).await?;
            session.set(SESSION_MARKER_KEY, session_id).await?;
        }

        Ok(Self {
            durable: KvNamespace::open(data_dir.join("durable")).await?,
            session: KvNamespace::open(session_dir).await?,
        })
    }

    /// Serialize the snapshot and overwrite the durable quotes key. A failure
    /// here is non-fatal to callers: the in-memory store stays authoritative.
    pub async fn save_quotes(&self, records: &[QuoteRecord]) -> Result<(), StorageError> {
        let json = serde_json::to_string(records)
            .map_err(|e| StorageError::parse(QUOTES_KEY, e))?;
        self.durable.set(QUOTES_KEY, &json).await
    }

    /// Read the durable snapshot. `Ok(None)` means the key has never been
    /// written; malformed or non-array content surfaces as an error so the
    /// caller can apply the fail-open empty default exactly once.
    pub async fn load_quotes(&self) -> Result<Option<Vec<QuoteRecord>>, StorageError> {
        let Some(raw) = self.durable.get(QUOTES_KEY).await? else {
            return Ok(None);
        };
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| StorageError::parse(QUOTES_KEY, e))?;
        if !value.is_array() {
            return Err(StorageError::NotAnArray {
                key: QUOTES_KEY.to_string(),
            });
        }
        let records: Vec<QuoteRecord> =
            serde_json::from_value(value).map_err(|e| StorageError::parse(QUOTES_KEY, e))?;
        Ok(Some(records))
    }

    pub async fn save_last_filter(&self, filter: &str) -> Result<(), StorageError> {
        self.durable.set(LAST_FILTER_KEY, filter).await
    }

    pub async fn load_last_filter(&self) -> Result<Option<String>, StorageError> {
        self.durable.get(LAST_FILTER_KEY).await
    }

    pub async fn save_last_sync(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.durable.set(LAST_SYNC_KEY, &at.to_rfc3339()).await
    }

    pub async fn load_last_sync(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(raw) = self.durable.get(LAST_SYNC_KEY).await? else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(raw.trim())
            .map_err(|e| StorageError::Timestamp {
                key: LAST_SYNC_KEY.to_string(),
                source: e,
            })?
            .with_timezone(&Utc);
        Ok(Some(parsed))
    }

    /// Remember the most recently displayed record for the current session.
    pub async fn save_session_last(&self, record: &QuoteRecord) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StorageError::parse(LAST_QUOTE_KEY, e))?;
        self.session.set(LAST_QUOTE_KEY, &json).await
    }

    pub async fn load_session_last(&self) -> Result<Option<QuoteRecord>, StorageError> {
        let Some(raw) = self.session.get(LAST_QUOTE_KEY).await? else {
            return Ok(None);
        };
        let record =
            serde_json::from_str(&raw).map_err(|e| StorageError::parse(LAST_QUOTE_KEY, e))?;
        Ok(Some(record))
    }
}

/// Read an import file to completion and parse it as a JSON array of
/// coercible quote objects. Missing draft fields default during
/// normalization; a non-array top level is rejected.
pub async fn read_import_file(path: &Path) -> Result<Vec<QuoteDraft>, StorageError> {
    let key = path.display().to_string();
    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| StorageError::io(&key, e))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| StorageError::parse(&key, e))?;
    if !value.is_array() {
        return Err(StorageError::NotAnArray { key });
    }
    serde_json::from_value(value).map_err(|e| StorageError::parse(&key, e))
}

/// Pretty-printed JSON array of the snapshot; byte-identical after a round
/// trip through [`read_import_file`] and re-export.
pub fn export_json(records: &[QuoteRecord]) -> Result<String, StorageError> {
    serde_json::to_string_pretty(records).map_err(|e| StorageError::parse("<export>", e))
}

/// Write the exported snapshot to `path` (atomic, like every other write).
pub async fn write_export_file(path: &Path, records: &[QuoteRecord]) -> Result<(), StorageError> {
    let key = path.display().to_string();
    let json = export_json(records)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::io(&key, e))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, json.as_bytes())
        .await
        .map_err(|e| StorageError::io(&key, e))?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StorageError::io(&key, err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quill_core::{DEFAULT_AUTHOR, DEFAULT_CATEGORY};
    use tempfile::tempdir;

    fn record(id: &str, text: &str, secs: i64) -> QuoteRecord {
        QuoteRecord {
            id: id.to_string(),
            text: text.to_string(),
            author: DEFAULT_AUTHOR.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            updated_at: Utc.timestamp_opt(secs, 0).single().expect("ts"),
        }
    }

    #[tokio::test]
    async fn quotes_round_trip_through_durable_namespace() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");

        let records = vec![record("1", "alpha", 10), record("2", "beta", 20)];
        storage.save_quotes(&records).await.expect("save");
        let loaded = storage.load_quotes().await.expect("load");
        assert_eq!(loaded, Some(records));
    }

    #[tokio::test]
    async fn missing_quotes_key_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");
        assert_eq!(storage.load_quotes().await.expect("load"), None);
    }

    #[tokio::test]
    async fn corrupt_quotes_surface_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");
        let ns = KvNamespace::open(dir.path().join("durable"))
            .await
            .expect("namespace");
        ns.set(QUOTES_KEY, "{not json").await.expect("set");

        let err = storage.load_quotes().await.unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));
    }

    #[tokio::test]
    async fn non_array_quotes_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");
        let ns = KvNamespace::open(dir.path().join("durable"))
            .await
            .expect("namespace");
        ns.set(QUOTES_KEY, r#"{"quotes":[]}"#).await.expect("set");

        let err = storage.load_quotes().await.unwrap_err();
        assert!(matches!(err, StorageError::NotAnArray { .. }));
    }

    #[tokio::test]
    async fn session_namespace_survives_reopen_within_the_same_session() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");
        let last = record("1", "ephemeral", 10);
        storage
            .save_session_last(&last)
            .await
            .expect("save session");

        let reopened = QuoteStorage::open(dir.path(), "tab-1").await.expect("reopen");
        assert_eq!(
            reopened.load_session_last().await.expect("load"),
            Some(last)
        );
    }

    #[tokio::test]
    async fn session_namespace_is_wiped_for_a_new_session() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");
        storage
            .save_session_last(&record("1", "ephemeral", 10))
            .await
            .expect("save session");
        assert!(storage.load_session_last().await.expect("load").is_some());

        let reopened = QuoteStorage::open(dir.path(), "tab-2").await.expect("reopen");
        assert_eq!(reopened.load_session_last().await.expect("load"), None);

        // Durable data survives the session change untouched.
        storage
            .save_last_filter("Design")
            .await
            .expect("save filter");
        assert_eq!(
            reopened.load_last_filter().await.expect("load filter"),
            Some("Design".to_string())
        );
    }

    #[tokio::test]
    async fn last_sync_round_trips_as_rfc3339() {
        let dir = tempdir().expect("tempdir");
        let storage = QuoteStorage::open(dir.path(), "tab-1").await.expect("open");
        let at = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        storage.save_last_sync(at).await.expect("save");
        assert_eq!(storage.load_last_sync().await.expect("load"), Some(at));
    }

    #[tokio::test]
    async fn export_import_round_trip_is_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let records = vec![record("1", "alpha", 10), record("2", "beta", 20)];
        let path = dir.path().join("quotes.json");
        write_export_file(&path, &records).await.expect("export");

        let drafts = read_import_file(&path).await.expect("import");
        let reimported: Vec<QuoteRecord> = drafts
            .into_iter()
            .map(|d| d.normalize(Utc::now()).expect("normalize"))
            .collect();
        assert_eq!(reimported, records);

        let second = export_json(&reimported).expect("re-export");
        let first = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn import_rejects_non_array_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, r#"{"text":"not a list"}"#)
            .await
            .expect("write");
        let err = read_import_file(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::NotAnArray { .. }));
    }
}
