//! Storage collaborators for finished sessions
//!
//! The sample store hands its ordered contents to a `SampleSink` when a
//! session ends. Two backends exist: timestamped JSON snapshots (one file per
//! session) and a SQLite database (one `session_id` per session).

use super::config::{PipelineConfig, StorageBackend};
use super::error::{PipelineError, PipelineResult};
use super::types::{current_timestamp_ms, Sample};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait SampleSink: Send {
    /// Durably store one session's ordered samples
    async fn persist(&mut self, samples: &[Sample]) -> PipelineResult<()>;

    /// Load the most recently persisted session (empty if none)
    async fn load(&mut self) -> PipelineResult<Vec<Sample>>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Build the configured sink
pub fn open_sink(config: &PipelineConfig) -> PipelineResult<Box<dyn SampleSink>> {
    match config.storage_backend {
        StorageBackend::Json => Ok(Box::new(JsonSnapshotSink::new(&config.data_path)?)),
        StorageBackend::Sqlite => Ok(Box::new(SqliteSampleSink::new(&config.data_path)?)),
    }
}

/// Snapshot of one session for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub samples: Vec<Sample>,
    pub saved_at_ms: i64,
}

/// Writes each session to `<dir>/session_<date>.json`
pub struct JsonSnapshotSink {
    dir: PathBuf,
    date_format: String,
}

impl JsonSnapshotSink {
    pub fn new(dir: impl AsRef<Path>) -> PipelineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            date_format: "%Y%m%d_%H%M%S_%3f".to_string(),
        })
    }

    fn snapshot_files(&self) -> PipelineResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().and_then(|s| s.to_str()) == Some("json")
                    && path
                        .file_name()
                        .and_then(|s| s.to_str())
                        .map(|name| name.starts_with("session_"))
                        .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// `session_<stamp>.json`, suffixed when a session already ended in the
    /// same millisecond
    fn next_snapshot_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format(&self.date_format).to_string();
        let mut path = self.dir.join(format!("session_{}.json", stamp));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("session_{}_{}.json", stamp, n));
            n += 1;
        }
        path
    }
}

#[async_trait]
impl SampleSink for JsonSnapshotSink {
    async fn persist(&mut self, samples: &[Sample]) -> PipelineResult<()> {
        if samples.is_empty() {
            log::debug!("Empty session, nothing to save");
            return Ok(());
        }

        let snapshot = SessionSnapshot {
            samples: samples.to_vec(),
            saved_at_ms: current_timestamp_ms(),
        };
        let path = self.next_snapshot_path();

        let json = serde_json::to_string(&snapshot)?;
        fs::write(&path, json)?;

        log::info!("💾 Saved {} samples to {}", samples.len(), path.display());
        Ok(())
    }

    async fn load(&mut self) -> PipelineResult<Vec<Sample>> {
        let Some(latest) = self.snapshot_files()?.pop() else {
            log::info!("No existing session snapshot in {}", self.dir.display());
            return Ok(Vec::new());
        };

        let json = fs::read_to_string(&latest)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&json)?;

        log::info!("Loaded {} samples from {}", snapshot.samples.len(), latest.display());
        Ok(snapshot.samples)
    }

    fn backend_type(&self) -> &'static str {
        "JSON"
    }
}

/// Stores sessions in SQLite, one row per sample
pub struct SqliteSampleSink {
    conn: Connection,
}

impl SqliteSampleSink {
    pub fn new(db_path: impl AsRef<Path>) -> PipelineResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                saved_at_ms INTEGER NOT NULL,
                sample_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS samples (
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                idx INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                features TEXT NOT NULL,
                targets TEXT NOT NULL,
                prediction TEXT,
                PRIMARY KEY (session_id, idx)
            );",
        )?;

        log::info!("✅ SQLite sample store initialized with WAL mode");
        Ok(Self { conn })
    }
}

#[async_trait]
impl SampleSink for SqliteSampleSink {
    async fn persist(&mut self, samples: &[Sample]) -> PipelineResult<()> {
        if samples.is_empty() {
            log::debug!("Empty session, nothing to save");
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (saved_at_ms, sample_count) VALUES (?1, ?2)",
            params![current_timestamp_ms(), samples.len() as i64],
        )?;
        let session_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (session_id, idx, timestamp_ms, features, targets, prediction)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (idx, sample) in samples.iter().enumerate() {
                let prediction = match &sample.prediction {
                    Some(p) => Some(serde_json::to_string(p)?),
                    None => None,
                };
                stmt.execute(params![
                    session_id,
                    idx as i64,
                    sample.timestamp_ms,
                    serde_json::to_string(&sample.features)?,
                    serde_json::to_string(&sample.targets)?,
                    prediction,
                ])?;
            }
        }
        tx.commit()?;

        log::info!("💾 Saved {} samples to SQLite session {}", samples.len(), session_id);
        Ok(())
    }

    async fn load(&mut self) -> PipelineResult<Vec<Sample>> {
        let session_id: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM sessions", [], |row| row.get(0))?;
        let Some(session_id) = session_id else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(
            "SELECT timestamp_ms, features, targets, prediction
             FROM samples WHERE session_id = ?1 ORDER BY idx ASC",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (timestamp_ms, features, targets, prediction) = row?;
            samples.push(Sample {
                timestamp_ms,
                features: serde_json::from_str(&features)?,
                targets: serde_json::from_str(&targets)?,
                prediction: prediction
                    .map(|p| serde_json::from_str(&p))
                    .transpose()
                    .map_err(PipelineError::from)?,
            });
        }

        log::info!("Loaded {} samples from SQLite session {}", samples.len(), session_id);
        Ok(samples)
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
