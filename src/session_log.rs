use crate::error::PatchError;
use crate::types::{Completion, PatchStateId};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// One completed state, as written to the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub timestamp: DateTime<Utc>,
    pub state: PatchStateId,
    pub interrupted: bool,
    pub error: Option<String>,
    pub next_state: Option<PatchStateId>,
    pub elapsed_secs: f64,
}

impl SessionRecord {
    pub fn new(
        state: PatchStateId,
        completion: &Completion,
        next_state: Option<PatchStateId>,
        elapsed_secs: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            state,
            interrupted: completion.interrupted,
            error: completion.error.clone(),
            next_state,
            elapsed_secs,
        }
    }
}

/// Buffered JSONL writer for session records.
///
/// Records accumulate in memory and flush when the buffer fills or the log
/// is dropped, so a crashed run loses at most one buffer of history.
#[derive(Debug)]
pub struct SessionLog {
    buffer: Vec<SessionRecord>,
    buffer_size: usize,
    file_path: PathBuf,
}

impl SessionLog {
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(std::ffi::OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }
        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            file_path: path,
        }
    }

    pub fn add(&mut self, record: SessionRecord) -> Result<(), PatchError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PatchError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = std::io::BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;

        info!(
            "Flushed {} session records to {:?}",
            self.buffer.len(),
            self.file_path
        );
        self.buffer.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
