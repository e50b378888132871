//! Destinations the core writes to for the assistant side to pick up.
//!
//! Approval verdicts go to a [`ResponseSink`]: write-once on the relay side,
//! read-once on the assistant side. The handle is an opaque string that the
//! relay returns to the assistant and persists alongside the pending approval,
//! so a [`ResponseSinks`] factory can rebuild the sink after a restart.
//!
//! Plain thread replies go to a [`MessageSink`].

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::SinkError;
use crate::models::{Session, Verdict};

pub trait ResponseSink: Send + Sync + fmt::Debug {
    fn handle(&self) -> &str;

    /// Durably records the verdict. A second write fails with `AlreadyWritten`.
    fn write(&self, verdict: Verdict) -> Result<(), SinkError>;
}

pub trait ResponseSinks: Send + Sync {
    /// A fresh sink for a new approval request.
    fn open(&self, session_id: &str) -> Result<Arc<dyn ResponseSink>, SinkError>;

    /// Rebuilds a sink from a handle previously returned by `open`.
    fn restore(&self, handle: &str) -> Result<Arc<dyn ResponseSink>, SinkError>;
}

pub trait MessageSink: Send + Sync {
    fn deliver(&self, session: &Session, text: &str) -> Result<(), SinkError>;
}

// File-backed sinks

/// One file per approval request under a responses directory. The handle is the
/// file's path; the file only appears once the verdict is complete.
#[derive(Debug, Clone)]
pub struct FileSinks {
    dir: PathBuf,
}

impl FileSinks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ResponseSinks for FileSinks {
    fn open(&self, session_id: &str) -> Result<Arc<dyn ResponseSink>, SinkError> {
        fs::create_dir_all(&self.dir)?;
        let name = format!("{}-{}.txt", sanitize_file_stem(session_id), Uuid::new_v4());
        let path = self.dir.join(name);
        Ok(Arc::new(FileSink::new(path)))
    }

    fn restore(&self, handle: &str) -> Result<Arc<dyn ResponseSink>, SinkError> {
        let path = PathBuf::from(handle);
        if path.parent() != Some(self.dir.as_path()) {
            return Err(SinkError::UnknownHandle(handle.to_string()));
        }
        Ok(Arc::new(FileSink::new(path)))
    }
}

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    handle: String,
}

impl FileSink {
    fn new(path: PathBuf) -> Self {
        let handle = path.to_string_lossy().into_owned();
        Self { path, handle }
    }
}

impl ResponseSink for FileSink {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn write(&self, verdict: Verdict) -> Result<(), SinkError> {
        if self.path.exists() {
            return Err(SinkError::AlreadyWritten(self.handle.clone()));
        }
        write_atomic(&self.path, verdict.as_str())
    }
}

/// Assistant-side read of a file sink: returns the verdict once it exists and
/// removes the file so it is consumed exactly once.
pub fn take_verdict(path: &Path) -> Result<Option<Verdict>, SinkError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    fs::remove_file(path)?;
    Ok(contents.parse().ok())
}

// In-process sinks

#[derive(Debug, Default)]
pub struct MemorySinks {
    slots: Mutex<HashMap<String, Arc<MemorySink>>>,
}

impl MemorySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and clears the verdict for a handle.
    pub fn take(&self, handle: &str) -> Option<Verdict> {
        let slots = self.slots.lock().ok()?;
        let slot = slots.get(handle)?;
        let verdict = slot.verdict.lock().ok()?.take();
        verdict
    }
}

impl ResponseSinks for MemorySinks {
    fn open(&self, session_id: &str) -> Result<Arc<dyn ResponseSink>, SinkError> {
        let handle = format!("memory:{}:{}", session_id, Uuid::new_v4());
        let sink = Arc::new(MemorySink {
            handle: handle.clone(),
            verdict: Mutex::new(None),
            written: Mutex::new(false),
        });
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(handle, Arc::clone(&sink));
        }
        Ok(sink)
    }

    fn restore(&self, handle: &str) -> Result<Arc<dyn ResponseSink>, SinkError> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| SinkError::UnknownHandle(handle.to_string()))?;
        match slots.get(handle) {
            Some(sink) => Ok(Arc::clone(sink) as Arc<dyn ResponseSink>),
            None => Err(SinkError::UnknownHandle(handle.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct MemorySink {
    handle: String,
    verdict: Mutex<Option<Verdict>>,
    written: Mutex<bool>,
}

impl ResponseSink for MemorySink {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn write(&self, verdict: Verdict) -> Result<(), SinkError> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| SinkError::AlreadyWritten(self.handle.clone()))?;
        if *written {
            return Err(SinkError::AlreadyWritten(self.handle.clone()));
        }
        if let Ok(mut slot) = self.verdict.lock() {
            *slot = Some(verdict);
        }
        *written = true;
        Ok(())
    }
}

// Inbound messages

/// Writes the newest plain reply for each session to `<dir>/<session>.txt`.
#[derive(Debug, Clone)]
pub struct InboxDir {
    dir: PathBuf,
}

impl InboxDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.txt", sanitize_file_stem(session_id)))
    }
}

impl MessageSink for InboxDir {
    fn deliver(&self, session: &Session, text: &str) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.path_for(&session.id), text)
    }
}

/// Temp file plus rename, so readers never see a partial write.
fn write_atomic(path: &Path, contents: &str) -> Result<(), SinkError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

fn sanitize_file_stem(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}
