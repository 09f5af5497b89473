//! Log sinks the handler appends its side-effect lines to.
//!
//! A sink is write-only and shared by every concurrent call, so
//! implementations must accept appends from many tasks at once.

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

/// Append-only destination for handler log lines.
pub trait LogSink: Send + Sync {
    /// Append one line. Callers swallow the error.
    fn append(&self, line: &str) -> io::Result<()>;
}

/// Writes each line as a `tracing` event on the `sink` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn append(&self, line: &str) -> io::Result<()> {
        tracing::info!(target: "sink", "{line}");
        Ok(())
    }
}

/// Appends timestamped lines to a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Truncate (or create) the file and write the initialization line.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let sink = Self {
            path,
            file: Mutex::new(file),
        };
        sink.append("Log initialized.")?;
        Ok(sink)
    }

    /// Open the file for appending without truncating it.
    pub fn open_append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn append(&self, line: &str) -> io::Result<()> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        writeln!(file, "{stamp} - {line}")?;
        file.flush()
    }
}
