//! File-based storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{KontosError, Result};
use crate::storage::traits::{Storage, StorageInput, StorageOutput};

/// A file-based storage implementation rooted at one directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Whether the storage is closed.
    closed: bool,
}

impl FileStorage {
    /// Create a new file storage in the given directory, creating it if it
    /// does not exist.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        if !directory.exists() {
            fs::create_dir_all(&directory)
                .map_err(|e| KontosError::storage(format!("failed to create directory: {e}")))?;
        }
        if !directory.is_dir() {
            return Err(KontosError::storage(format!(
                "path is not a directory: {}",
                directory.display()
            )));
        }
        Ok(FileStorage {
            directory,
            closed: false,
        })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(KontosError::storage("storage is closed"))
        } else {
            Ok(())
        }
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;
        let path = self.file_path(name);
        let file = File::open(&path)
            .map_err(|e| KontosError::storage(format!("failed to open {name}: {e}")))?;
        let size = file
            .metadata()
            .map_err(|e| KontosError::storage(format!("failed to stat {name}: {e}")))?
            .len();
        Ok(Box::new(FileInput {
            reader: BufReader::new(file),
            size,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| KontosError::storage(format!("failed to create {name}: {e}")))?;
        Ok(Box::new(FileOutput {
            writer: BufWriter::new(file),
            position: 0,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        !self.closed && self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        fs::remove_file(self.file_path(name))
            .map_err(|e| KontosError::storage(format!("failed to delete {name}: {e}")))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.directory)
            .map_err(|e| KontosError::storage(format!("failed to list directory: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| KontosError::storage(e.to_string()))?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;
        let metadata = fs::metadata(self.file_path(name))
            .map_err(|e| KontosError::storage(format!("failed to stat {name}: {e}")))?;
        Ok(metadata.len())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct FileOutput {
    writer: BufWriter<File>,
    position: u64,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.writer.seek(pos)?;
        Ok(self.position)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}
