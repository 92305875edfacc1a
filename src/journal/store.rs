use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use prost::Message;

use crate::config::JournalConfig;
use crate::error::{JobdError, Result};
use crate::journal::JournalRecord;

/// Append-only storage for journal records.
pub trait JournalStore: Send {
    /// Buffer one record. It is durable only after the next [`flush`].
    ///
    /// [`flush`]: JournalStore::flush
    fn append(&mut self, record: &JournalRecord) -> Result<()>;

    /// Push buffered records to durable storage.
    fn flush(&mut self) -> Result<()>;

    /// Every record, oldest first.
    fn load(&mut self) -> Result<Vec<JournalRecord>>;
}

/// Length-delimited protobuf records in a single file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    writer: BufWriter<File>,
    fsync: bool,
    scratch: Vec<u8>,
}

impl FileJournal {
    pub fn open(config: &JournalConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;

        tracing::info!(path = %config.path.display(), fsync = config.fsync, "Journal opened");
        Ok(Self {
            path: config.path.clone(),
            writer: BufWriter::new(file),
            fsync: config.fsync,
            scratch: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalStore for FileJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.scratch.clear();
        record
            .encode_length_delimited(&mut self.scratch)
            .map_err(|e| JobdError::Journal(format!("encode failed: {}", e)))?;
        self.writer.write_all(&self.scratch)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<JournalRecord>> {
        self.writer.flush()?;
        let mut buf = Bytes::from(fs::read(&self.path)?);
        let total = buf.len();

        let mut records = Vec::new();
        while buf.has_remaining() {
            let offset = total - buf.remaining();
            let record = JournalRecord::decode_length_delimited(&mut buf).map_err(|e| {
                JobdError::Journal(format!(
                    "corrupt record {} at byte {} of {}: {}",
                    records.len(),
                    offset,
                    self.path.display(),
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// In-memory journal. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    records: Arc<Mutex<Vec<JournalRecord>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<JournalRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<JournalRecord>>> {
        self.records
            .lock()
            .map_err(|_| JobdError::Journal("memory journal lock poisoned".into()))
    }
}

impl JournalStore for MemoryJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.guard()?.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<JournalRecord>> {
        Ok(self.guard()?.clone())
    }
}
