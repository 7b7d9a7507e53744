//! Append-only telemetry logs.
//!
//! Eval and audit records are written once and never edited. The in-memory
//! log backs tests and ephemeral nodes; the JSON Lines log is what a node
//! keeps on disk (one record per line, appended under a mutex).

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SearchError};
use crate::store::DocumentId;

/// A telemetry row that belongs to one document.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn document_id(&self) -> DocumentId;
}

pub trait RecordLog<T: Record>: Send + Sync {
    fn append(&self, record: T) -> Result<()>;
    /// Every record of `doc`, oldest first.
    fn for_document(&self, doc: DocumentId) -> Result<Vec<T>>;
}

pub struct MemoryLog<T> {
    rows: RwLock<Vec<T>>,
}

impl<T> Default for MemoryLog<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl<T> MemoryLog<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Record> RecordLog<T> for MemoryLog<T> {
    fn append(&self, record: T) -> Result<()> {
        self.rows
            .write()
            .map_err(|_| SearchError::Storage("log lock poisoned".into()))?
            .push(record);
        Ok(())
    }

    fn for_document(&self, doc: DocumentId) -> Result<Vec<T>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| SearchError::Storage("log lock poisoned".into()))?;
        Ok(rows.iter().filter(|r| r.document_id() == doc).cloned().collect())
    }
}

pub struct JsonlLog<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonlLog<T> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            _record: PhantomData,
        })
    }
}

impl<T: Record> RecordLog<T> for JsonlLog<T> {
    fn append(&self, record: T) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SearchError::Storage("log lock poisoned".into()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Lines that fail to parse (a torn final write) are skipped with a warning.
    fn for_document(&self, doc: DocumentId) -> Result<Vec<T>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut out = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(r) if r.document_id() == doc => out.push(r),
                Ok(_) => {}
                Err(e) => warn!("{}:{}: skipping unreadable record: {}", self.path.display(), n + 1, e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        doc: DocumentId,
        n: u32,
    }

    impl Record for Row {
        fn document_id(&self) -> DocumentId {
            self.doc
        }
    }

    fn exercise(log: &dyn RecordLog<Row>) {
        log.append(Row { doc: 1, n: 1 }).unwrap();
        log.append(Row { doc: 2, n: 2 }).unwrap();
        log.append(Row { doc: 1, n: 3 }).unwrap();
        let rows = log.for_document(1).unwrap();
        assert_eq!(rows.iter().map(|r| r.n).collect::<Vec<_>>(), vec![1, 3]);
        assert!(log.for_document(9).unwrap().is_empty());
    }

    #[test]
    fn memory_log_filters_by_document() {
        exercise(&MemoryLog::new());
    }

    #[test]
    fn jsonl_log_filters_by_document() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&JsonlLog::open(dir.path().join("logs").join("rows.jsonl")).unwrap());
    }

    #[test]
    fn jsonl_log_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let log: JsonlLog<Row> = JsonlLog::open(&path).unwrap();
        log.append(Row { doc: 1, n: 1 }).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"doc\":1,\"n\"").unwrap();
        drop(f);
        assert_eq!(log.for_document(1).unwrap().len(), 1);
    }
}
