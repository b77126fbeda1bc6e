//! On-disk backlog for batches the remote store did not accept.
//!
//! One newline-delimited JSON file per failed insert, named
//! `backlog_<collection>_<utc millis>_<id>.ndjson`. Files are written to a
//! `.tmp` sibling and renamed, so a crash mid-write never leaves a partial
//! `.ndjson` behind. A file is deleted only after the store accepted all of
//! its documents; if it cannot be deleted it is renamed to a `.done` marker
//! so it is never replayed twice.

use crate::store::document::Document;
use crate::store::{DocumentStore, StoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const FILE_PREFIX: &str = "backlog_";
const FILE_EXT: &str = "ndjson";
const DONE_EXT: &str = "done";

/// Errors reading a backlog file back.
#[derive(Debug, thiserror::Error)]
pub enum BacklogReadError {
    #[error("could not read backlog file: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// The backlog directory.
#[derive(Debug, Clone)]
pub struct BacklogDir {
    path: PathBuf,
}

impl BacklogDir {
    /// A backlog rooted at `path`. Nothing is created until the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Directory holding the backlog files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory. A plain file in its place is moved aside.
    pub fn ensure(&self) -> io::Result<()> {
        if self.path.exists() && !self.path.is_dir() {
            let mut aside = self.path.clone().into_os_string();
            aside.push(format!(".bak_{}", Utc::now().timestamp()));
            warn!(path = ?self.path, "backlog path is a file, moving it aside");
            fs::rename(&self.path, PathBuf::from(aside))?;
        }
        fs::create_dir_all(&self.path)
    }

    /// Persist `documents` as one new backlog file for `collection`.
    pub fn write(&self, collection: &str, documents: &[Document]) -> io::Result<PathBuf> {
        self.ensure()?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{FILE_PREFIX}{}_{:013}_{}.{FILE_EXT}",
            sanitize_collection(collection),
            Utc::now().timestamp_millis().max(0),
            &id[..8]
        );
        let target = self.path.join(&name);
        let staging = self.path.join(format!("{name}.tmp"));

        let result = (|| -> io::Result<()> {
            let mut writer = BufWriter::new(File::create(&staging)?);
            for doc in documents {
                serde_json::to_writer(&mut writer, doc)?;
                writer.write_all(b"\n")?;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&staging, &target)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(target)
    }

    /// Backlog files for `collection`, oldest first.
    pub fn pending(&self, collection: &str) -> io::Result<Vec<PathBuf>> {
        let wanted = sanitize_collection(collection);
        let mut files: Vec<(u64, PathBuf)> = self
            .entries()?
            .into_iter()
            .filter(|(c, _, _)| *c == wanted)
            .map(|(_, millis, path)| (millis, path))
            .collect();
        files.sort();
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }

    /// Number of pending files per collection.
    pub fn pending_counts(&self) -> io::Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for (collection, _, _) in self.entries()? {
            *counts.entry(collection).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Read every document of a backlog file.
    pub fn read(path: &Path) -> Result<Vec<Document>, BacklogReadError> {
        let reader = BufReader::new(File::open(path)?);
        let mut docs = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let doc = serde_json::from_str(&line)
                .map_err(|source| BacklogReadError::Parse { line: i + 1, source })?;
            docs.push(doc);
        }
        Ok(docs)
    }

    fn entries(&self) -> io::Result<Vec<(String, u64, PathBuf)>> {
        let dir = match fs::read_dir(&self.path) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for entry in dir {
            let path = entry?.path();
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_file_name);
            if let Some((collection, millis)) = parsed {
                entries.push((collection, millis, path));
            }
        }
        Ok(entries)
    }
}

fn sanitize_collection(collection: &str) -> String {
    collection
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Split `backlog_<collection>_<millis>_<id>.ndjson`.
fn parse_file_name(name: &str) -> Option<(String, u64)> {
    let stem = name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_EXT)?
        .strip_suffix('.')?;
    let mut parts = stem.rsplitn(3, '_');
    let _id = parts.next()?;
    let millis = parts.next()?.parse().ok()?;
    let collection = parts.next()?;
    if collection.is_empty() {
        return None;
    }
    Some((collection.to_string(), millis))
}

/// How a batch reached durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The remote store accepted it
    Remote,
    /// The remote store failed; the batch is in this backlog file
    Backlogged { file: PathBuf, cause: StoreError },
}

/// A batch that reached neither the store nor the backlog.
#[derive(Debug, thiserror::Error)]
#[error("insert failed ({remote}) and backlog write failed: {backlog}")]
pub struct SinkError {
    pub remote: StoreError,
    #[source]
    pub backlog: io::Error,
}

/// Result of one backlog sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BacklogReport {
    pub replayed_files: usize,
    pub replayed_documents: usize,
    /// Files left for a later sweep because the store refused them
    pub remaining_files: usize,
    /// Files that could not be parsed; kept on disk
    pub unreadable: Vec<PathBuf>,
    /// A replayed file that could be neither removed nor marked done. The
    /// sweep stopped there; the next sweep will insert it again.
    pub stuck: Option<PathBuf>,
}

impl BacklogReport {
    /// Whether nothing is left for a later sweep.
    pub fn is_clear(&self) -> bool {
        self.remaining_files == 0 && self.unreadable.is_empty() && self.stuck.is_none()
    }
}

/// Retire a replayed backlog file.
///
/// Removal is preferred; a file that cannot be removed is renamed out of the
/// backlog namespace instead.
fn retire(file: &Path) -> io::Result<()> {
    let removal = match fs::remove_file(file) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => e,
    };
    let mut marker = file.as_os_str().to_owned();
    marker.push(format!(".{DONE_EXT}"));
    match fs::rename(file, &marker) {
        Ok(()) => {
            warn!(file = ?file, error = %removal, "replayed backlog file could not be removed, marked done");
            Ok(())
        }
        Err(_) => Err(removal),
    }
}

/// One remote collection plus its backlog.
pub struct BacklogSink {
    store: Arc<dyn DocumentStore>,
    collection: String,
    backlog: BacklogDir,
}

impl BacklogSink {
    /// Pair `collection` of `store` with `backlog`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        backlog: BacklogDir,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            backlog,
        }
    }

    /// Remote collection this sink writes to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Local backlog shared with the other sinks.
    pub fn backlog(&self) -> &BacklogDir {
        &self.backlog
    }

    /// Write `documents` in one call, backlogging them on failure.
    ///
    /// `Ok` means the batch is durable either remotely or on disk.
    pub async fn insert_batch(&self, documents: &[Document]) -> Result<Delivery, SinkError> {
        if documents.is_empty() {
            return Ok(Delivery::Remote);
        }

        let cause = match self.store.insert_many(&self.collection, documents).await {
            Ok(()) => return Ok(Delivery::Remote),
            Err(e) => e,
        };

        warn!(
            collection = %self.collection,
            docs = documents.len(),
            error = %cause,
            "insert failed, writing backlog"
        );
        match self.backlog.write(&self.collection, documents) {
            Ok(file) => {
                debug!(collection = %self.collection, file = ?file, "backlog written");
                Ok(Delivery::Backlogged { file, cause })
            }
            Err(backlog) => Err(SinkError {
                remote: cause,
                backlog,
            }),
        }
    }

    /// Replay this collection's backlog files, oldest first.
    ///
    /// Stops at the first file the store refuses; later files stay for the
    /// next sweep.
    pub async fn flush_backlog(&self) -> BacklogReport {
        let mut report = BacklogReport::default();

        let files = match self.backlog.pending(&self.collection) {
            Ok(files) => files,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "could not list backlog");
                return report;
            }
        };

        for (i, file) in files.iter().enumerate() {
            let docs = match BacklogDir::read(file) {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(file = ?file, error = %e, "unreadable backlog file kept");
                    report.unreadable.push(file.clone());
                    continue;
                }
            };

            if !docs.is_empty() {
                if let Err(e) = self.store.insert_many(&self.collection, &docs).await {
                    debug!(collection = %self.collection, error = %e, "backlog replay deferred");
                    report.remaining_files = files.len() - i;
                    break;
                }
            }

            report.replayed_files += 1;
            report.replayed_documents += docs.len();

            if let Err(e) = retire(file) {
                error!(file = ?file, error = %e, "replayed backlog file could not be retired, stopping replay");
                report.stuck = Some(file.clone());
                report.remaining_files = files.len() - i - 1;
                break;
            }
        }

        if report.replayed_files > 0 {
            info!(
                collection = %self.collection,
                files = report.replayed_files,
                docs = report.replayed_documents,
                "replayed backlog"
            );
        }
        report
    }
}
