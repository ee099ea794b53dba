//! `FileTail` (spec.md section 4.6): tails unread lines of a growing log file, surviving
//! object restarts via a process-scoped offset cache keyed by filename, and detecting
//! both rename-based rotation and copytruncate.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::collector::Stoppable;

static OFFSET_CACHE: Lazy<Mutex<HashMap<PathBuf, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[cfg(unix)]
fn inode_of(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.ino())
}

#[cfg(not(unix))]
fn inode_of(path: &Path) -> std::io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

pub struct FileTail {
    filename: PathBuf,
    file: Option<BufReader<File>>,
    offset: u64,
    inode: u64,
    closed: AtomicBool,
}

impl FileTail {
    /// Opens `filename`, resuming from the process-wide cached offset if present, or
    /// seeking to end-of-file on first sight (spec.md section 4.6: "offset survives
    /// object restarts through a process-scoped cache").
    pub fn open(filename: impl Into<PathBuf>) -> Result<Self> {
        let filename = filename.into();
        let mut cache = OFFSET_CACHE.lock();
        let offset = match cache.get(&filename) {
            Some(&o) => o,
            None => {
                let len = std::fs::metadata(&filename).map(|m| m.len()).unwrap_or(0);
                cache.insert(filename.clone(), len);
                len
            }
        };
        drop(cache);

        let inode = inode_of(&filename).unwrap_or(0);
        Ok(FileTail { filename, file: None, offset, inode, closed: AtomicBool::new(false) })
    }

    fn file_was_rotated(&mut self) -> bool {
        let Ok(new_inode) = inode_of(&self.filename) else {
            return true;
        };

        if new_inode != self.inode {
            return true;
        }

        // Same inode: check for copytruncate (current size fell below our offset).
        if let Ok(meta) = std::fs::metadata(&self.filename) {
            if meta.len() < self.offset {
                return true;
            }
        }
        false
    }

    fn ensure_open(&mut self) -> Result<()> {
        let rotated = self.file.is_none() || self.file_was_rotated();
        if rotated {
            self.file = None;
            if self.file_was_rotated() {
                self.inode = inode_of(&self.filename).unwrap_or(self.inode);
                self.offset = 0;
            }
            let mut f = File::open(&self.filename).with_context(|| format!("opening {}", self.filename.display()))?;
            f.seek(SeekFrom::Start(self.offset))?;
            self.file = Some(BufReader::new(f));
        }
        Ok(())
    }

    /// Returns the next unread line, or `None` at end-of-stream (spec.md section 4.6:
    /// "Yields lines without trailing newline. Updates offset on termination of a batch
    /// read.").
    pub fn next_line(&mut self) -> Result<Option<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.ensure_open()?;

        let reader = self.file.as_mut().expect("ensure_open sets file");
        let mut buf = String::new();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            self.update_offset();
            return Ok(None);
        }

        self.offset += n as u64;
        OFFSET_CACHE.lock().insert(self.filename.clone(), self.offset);
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    pub fn readlines(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(line) = self.next_line()? {
            out.push(line);
        }
        Ok(out)
    }

    fn update_offset(&mut self) {
        OFFSET_CACHE.lock().insert(self.filename.clone(), self.offset);
    }
}

impl Stoppable for FileTail {
    fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
