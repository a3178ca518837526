//! Output sinks for streamed records
//!
//! [`LoggerQueryFile`](crate::LoggerQueryFile) writes formatted bytes through
//! the [`OutputSink`] trait so tests can substitute an in-memory sink.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    Overwrite,
    Append,
}

/// What `open` found at the destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpenedSink {
    /// Leading bytes of existing content when appending to a non-empty file
    pub existing_header: Option<Vec<u8>>,
}

pub trait OutputSink {
    /// Open `path`; when appending, report up to `header_len` existing bytes
    fn open(&mut self, path: &Path, mode: FileMode, header_len: usize) -> io::Result<OpenedSink>;

    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

// ----------------------------------------------------------------------------
// File Sink
// ----------------------------------------------------------------------------

/// `std::fs` backed sink
#[derive(Debug, Default)]
pub struct FileSink {
    file: Option<File>,
}

impl FileSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputSink for FileSink {
    fn open(&mut self, path: &Path, mode: FileMode, header_len: usize) -> io::Result<OpenedSink> {
        let mut opened = OpenedSink::default();
        let file = match mode {
            FileMode::Overwrite => File::create(path)?,
            FileMode::Append => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(path)?;
                if file.metadata()?.len() > 0 {
                    let mut existing = Vec::with_capacity(header_len);
                    (&mut file)
                        .take(header_len as u64)
                        .read_to_end(&mut existing)?;
                    opened.existing_header = Some(existing);
                }
                file
            }
        };
        self.file = Some(file);
        Ok(opened)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "sink is not open")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Memory Sink
// ----------------------------------------------------------------------------

/// Observable in-memory sink; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    shared: Rc<RefCell<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    existing: Vec<u8>,
    written: Vec<u8>,
    opened: Option<PathBuf>,
    closed: bool,
    fail_open: bool,
    fail_write: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the destination already holds `bytes`
    pub fn with_existing(bytes: &[u8]) -> Self {
        let sink = Self::default();
        sink.shared.borrow_mut().existing = bytes.to_vec();
        sink
    }

    pub fn fail_open(&self) {
        self.shared.borrow_mut().fail_open = true;
    }

    pub fn fail_write(&self) {
        self.shared.borrow_mut().fail_write = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.borrow().written.clone()
    }

    pub fn opened_path(&self) -> Option<PathBuf> {
        self.shared.borrow().opened.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}

impl OutputSink for MemorySink {
    fn open(&mut self, path: &Path, mode: FileMode, header_len: usize) -> io::Result<OpenedSink> {
        let mut state = self.shared.borrow_mut();
        if state.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "open refused"));
        }
        state.opened = Some(path.to_path_buf());
        state.closed = false;
        match mode {
            FileMode::Overwrite => {
                state.existing.clear();
                Ok(OpenedSink::default())
            }
            FileMode::Append if state.existing.is_empty() => Ok(OpenedSink::default()),
            FileMode::Append => {
                let len = header_len.min(state.existing.len());
                Ok(OpenedSink {
                    existing_header: Some(state.existing[..len].to_vec()),
                })
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.shared.borrow_mut();
        if state.fail_write {
            return Err(io::Error::new(io::ErrorKind::Other, "write refused"));
        }
        state.written.extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.shared.borrow_mut().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("coratools-sink-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_file_sink_append_reports_existing_header() {
        let path = temp_path("append");
        std::fs::write(&path, b"HEADER\nrow1\n").unwrap();

        let mut sink = FileSink::new();
        let opened = sink.open(&path, FileMode::Append, 6).unwrap();
        assert_eq!(opened.existing_header.as_deref(), Some(&b"HEADER"[..]));
        sink.write(b"row2\n").unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"HEADER\nrow1\nrow2\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_sink_overwrite_truncates() {
        let path = temp_path("overwrite");
        std::fs::write(&path, b"old contents").unwrap();

        let mut sink = FileSink::new();
        let opened = sink.open(&path, FileMode::Overwrite, 6).unwrap();
        assert_eq!(opened.existing_header, None);
        sink.write(b"new").unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_before_open_fails() {
        let mut sink = FileSink::new();
        assert_eq!(
            sink.write(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
