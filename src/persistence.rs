//! Versioned on-disk persistence for attribute value stores.
//!
//! File layout (all fixed-width fields little-endian):
//!
//! ```text
//! header:  version: u32, create_serial_num: u64, doc_id_limit: u32
//! records: doc_id_limit times { size: u32, payload: size bytes }
//! trailer: crc32: u32 over header and records
//! ```
//!
//! Record `i` holds the payload for document id `i`; size 0 means the
//! document has no payload and no bytes follow. Saving runs under a single
//! generation guard, so the snapshot is self-consistent no matter what the
//! writer does concurrently. Loading validates the format version exactly
//! and never returns a partially-loaded store.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::attribute::{AttributeConfig, AttributeStore};
use crate::blob::BlobRef;
use crate::error::{KontosError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};

/// Supported attribute file format version.
pub const ATTRIBUTE_FORMAT_VERSION: u32 = 0;

struct ChecksumWriter<'a> {
    inner: &'a mut dyn StorageOutput,
    hasher: crc32fast::Hasher,
}

impl Write for ChecksumWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct ChecksumReader<'a> {
    inner: &'a mut dyn StorageInput,
    hasher: crc32fast::Hasher,
}

impl Read for ChecksumReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}

fn read_err(err: io::Error, what: &str) -> KontosError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        KontosError::persistence(format!("truncated stream reading {what}"))
    } else {
        KontosError::Io(err)
    }
}

/// Serialize `store`'s committed documents to `output`.
///
/// Takes one guard for the whole pass, so concurrent writer activity
/// cannot tear the snapshot.
pub fn save(store: &AttributeStore, output: &mut dyn StorageOutput) -> Result<()> {
    let _guard = store.take_guard();
    let refs = store.ref_copy();
    let doc_id_limit = (store.committed_doc_id_limit() as usize).min(refs.len());

    let mut writer = ChecksumWriter {
        inner: output,
        hasher: crc32fast::Hasher::new(),
    };
    writer.write_u32::<LittleEndian>(ATTRIBUTE_FORMAT_VERSION)?;
    writer.write_u64::<LittleEndian>(store.create_serial_num())?;
    writer.write_u32::<LittleEndian>(doc_id_limit as u32)?;

    for &blob_ref in &refs[..doc_id_limit] {
        match store.read_blob(blob_ref) {
            Some(view) => {
                writer.write_u32::<LittleEndian>(view.len() as u32)?;
                writer.write_all(&view)?;
            }
            None => writer.write_u32::<LittleEndian>(0)?,
        }
    }

    let ChecksumWriter { inner, hasher } = writer;
    inner.write_u32::<LittleEndian>(hasher.finalize())?;
    inner.flush_and_sync()?;
    Ok(())
}

/// Reconstruct a store from `input`.
///
/// Every non-empty payload is re-allocated into a fresh blob store; the
/// committed document-id limit is only advanced once every record has been
/// read and the trailing checksum verified.
pub fn load(config: AttributeConfig, input: &mut dyn StorageInput) -> Result<AttributeStore> {
    let mut reader = ChecksumReader {
        inner: input,
        hasher: crc32fast::Hasher::new(),
    };

    let version = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| read_err(e, "format version"))?;
    if version != ATTRIBUTE_FORMAT_VERSION {
        return Err(KontosError::persistence(format!(
            "unsupported attribute format version {version} (expected {ATTRIBUTE_FORMAT_VERSION})"
        )));
    }
    let create_serial_num = reader
        .read_u64::<LittleEndian>()
        .map_err(|e| read_err(e, "create serial number"))?;
    let doc_id_limit = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| read_err(e, "document id limit"))?;

    let mut store = AttributeStore::new(config);
    store.set_create_serial_num(create_serial_num);

    let mut refs = Vec::with_capacity(doc_id_limit as usize);
    for doc_id in 0..doc_id_limit {
        let size = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| read_err(e, &format!("record size for document {doc_id}")))?;
        if size == 0 {
            refs.push(BlobRef::invalid());
            continue;
        }
        let blob_ref = store.alloc_loaded(size as usize, |buf| {
            reader
                .read_exact(buf)
                .map_err(|e| read_err(e, &format!("payload for document {doc_id}")))
        })?;
        refs.push(blob_ref);
    }

    let ChecksumReader { inner, hasher } = reader;
    let computed = hasher.finalize();
    let stored = inner
        .read_u32::<LittleEndian>()
        .map_err(|e| read_err(e, "checksum"))?;
    if stored != computed {
        return Err(KontosError::persistence(format!(
            "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    store.install_refs(refs);
    Ok(store)
}

/// Save `store` into `storage` under `name`.
pub fn save_to(store: &AttributeStore, storage: &dyn Storage, name: &str) -> Result<()> {
    let mut output = storage.create_output(name)?;
    save(store, output.as_mut())?;
    output.close()?;
    Ok(())
}

/// Load an attribute store from `storage` under `name`.
pub fn load_from(
    config: AttributeConfig,
    storage: &dyn Storage,
    name: &str,
) -> Result<AttributeStore> {
    let mut input = storage.open_input(name)?;
    let store = load(config, input.as_mut())?;
    input.close()?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn read_file(storage: &MemoryStorage, name: &str) -> Vec<u8> {
        let mut input = storage.open_input(name).unwrap();
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes).unwrap();
        bytes
    }

    fn write_file(storage: &MemoryStorage, name: &str, bytes: &[u8]) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(bytes).unwrap();
        output.close().unwrap();
    }

    fn sample_store() -> AttributeStore {
        let mut config = AttributeConfig::new("tensors");
        config.create_serial_num = 42;
        let store = AttributeStore::new(config);
        store.set(0, &[0xa0; 10]).unwrap();
        store.set(1, &[]).unwrap();
        store.set(2, &[0xa2; 5]).unwrap();
        store.set_absent(3);
        store.set(4, &[0xa4; 3]).unwrap();
        store.commit();
        store
    }

    #[test]
    fn test_round_trip() {
        let storage = MemoryStorage::new();
        let original = sample_store();
        save_to(&original, &storage, "tensors.dat").unwrap();

        let loaded = load_from(AttributeConfig::new("tensors"), &storage, "tensors.dat").unwrap();
        assert_eq!(loaded.committed_doc_id_limit(), 5);
        assert_eq!(loaded.create_serial_num(), 42);
        assert_eq!(&*loaded.get(0).unwrap(), &[0xa0; 10]);
        assert!(loaded.get(1).is_none());
        assert_eq!(&*loaded.get(2).unwrap(), &[0xa2; 5]);
        assert!(loaded.get(3).is_none());
        assert_eq!(&*loaded.get(4).unwrap(), &[0xa4; 3]);
    }

    #[test]
    fn test_round_trip_empty_store() {
        let storage = MemoryStorage::new();
        let store = AttributeStore::new(AttributeConfig::new("empty"));
        store.commit();
        save_to(&store, &storage, "empty.dat").unwrap();

        let loaded = load_from(AttributeConfig::new("empty"), &storage, "empty.dat").unwrap();
        assert_eq!(loaded.committed_doc_id_limit(), 0);
        assert!(loaded.get(0).is_none());
    }

    #[test]
    fn test_uncommitted_tail_is_not_saved() {
        let storage = MemoryStorage::new();
        let store = sample_store();
        store.set(7, b"uncommitted").unwrap();

        save_to(&store, &storage, "tensors.dat").unwrap();
        let loaded = load_from(AttributeConfig::new("tensors"), &storage, "tensors.dat").unwrap();
        assert_eq!(loaded.committed_doc_id_limit(), 5);
        assert!(loaded.get(7).is_none());
    }

    #[test]
    fn test_version_mismatch_fails() {
        let storage = MemoryStorage::new();
        save_to(&sample_store(), &storage, "tensors.dat").unwrap();

        let mut bytes = read_file(&storage, "tensors.dat");
        bytes[0] = 9;
        write_file(&storage, "tensors.dat", &bytes);

        let err =
            load_from(AttributeConfig::new("tensors"), &storage, "tensors.dat").unwrap_err();
        assert!(matches!(err, KontosError::Persistence(_)), "got {err:?}");
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn test_truncated_stream_fails() {
        let storage = MemoryStorage::new();
        save_to(&sample_store(), &storage, "tensors.dat").unwrap();

        let bytes = read_file(&storage, "tensors.dat");
        // Cut into the middle of a payload record.
        write_file(&storage, "tensors.dat", &bytes[..bytes.len() / 2]);

        let err =
            load_from(AttributeConfig::new("tensors"), &storage, "tensors.dat").unwrap_err();
        assert!(matches!(err, KontosError::Persistence(_)), "got {err:?}");
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let storage = MemoryStorage::new();
        save_to(&sample_store(), &storage, "tensors.dat").unwrap();

        let mut bytes = read_file(&storage, "tensors.dat");
        // Flip one payload byte past the header.
        bytes[20] ^= 0xff;
        write_file(&storage, "tensors.dat", &bytes);

        let err =
            load_from(AttributeConfig::new("tensors"), &storage, "tensors.dat").unwrap_err();
        assert!(matches!(err, KontosError::Persistence(_)), "got {err:?}");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_save_is_guarded_snapshot() {
        let storage = MemoryStorage::new();
        let store = sample_store();
        save_to(&store, &storage, "snap.dat").unwrap();

        // Mutations after the save must not affect the saved image.
        store.set(0, b"changed").unwrap();
        store.commit();

        let loaded = load_from(AttributeConfig::new("tensors"), &storage, "snap.dat").unwrap();
        assert_eq!(&*loaded.get(0).unwrap(), &[0xa0; 10]);
    }
}
