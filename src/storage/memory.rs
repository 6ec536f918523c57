//! In-memory storage implementation for testing and temporary indexes.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::{KontosError, Result};
use crate::storage::traits::{Storage, StorageInput, StorageOutput};

/// An in-memory storage implementation.
///
/// Files are finalized into `Box<[u8]>` when their output is closed.
#[derive(Debug)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: Arc<Mutex<AHashMap<String, Box<[u8]>>>>,
    /// Whether the storage is closed.
    closed: bool,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new() -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(AHashMap::new())),
            closed: false,
        }
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(KontosError::storage("storage is closed"))
        } else {
            Ok(())
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Clear all files from storage.
    pub fn clear(&self) -> Result<()> {
        self.check_closed()?;
        self.files.lock().clear();
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| KontosError::storage(format!("file not found: {name}")))?;
        Ok(Box::new(MemoryInput::new(data.to_vec())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed {
            return false;
        }
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;
        let files = self.files.lock();
        let mut names: Vec<String> = files.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| KontosError::storage(format!("file not found: {name}")))?;
        Ok(data.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Read handle over a snapshot of one in-memory file.
#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
}

impl MemoryInput {
    fn new(data: Vec<u8>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write handle that publishes into the shared file map on flush or close.
#[derive(Debug)]
struct MemoryOutput {
    name: String,
    files: Arc<Mutex<AHashMap<String, Box<[u8]>>>>,
    buffer: Cursor<Vec<u8>>,
}

impl MemoryOutput {
    fn new(name: String, files: Arc<Mutex<AHashMap<String, Box<[u8]>>>>) -> Self {
        MemoryOutput {
            name,
            files,
            buffer: Cursor::new(Vec::new()),
        }
    }

    fn publish(&self) {
        let data = self.buffer.get_ref().clone().into_boxed_slice();
        self.files.lock().insert(self.name.clone(), data);
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer.flush()
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buffer.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.position())
    }

    fn close(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.publish();
    }
}
