// SPDX-License-Identifier: Apache-2.0

//! Durable JSON snapshot store.
//!
//! Every piece of state the engine persists (server cache, event counter,
//! client mirror, trashbin, error queue) is a named snapshot written through
//! this store. Writes are crash-safe: the payload goes to a temporary file
//! in the target directory, is fsynced, the previous generations are rotated
//! to `.1`..`.N` backups, then the temporary file is atomically renamed into
//! place. A reader never observes a half-written snapshot.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use syncflow_config::StorageConfig;
use tracing::debug;

/// Errors that can occur while persisting or loading snapshots.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O failure while reading or writing a snapshot file.
    #[error("snapshot `{name}`: {details}")]
    Io {
        /// The snapshot name.
        name: String,
        /// The underlying failure.
        details: String,
    },

    /// A snapshot exists but does not deserialize.
    #[error("snapshot `{name}` is corrupt: {details}")]
    Corrupt {
        /// The snapshot name.
        name: String,
        /// The underlying failure.
        details: String,
    },
}

impl Error {
    fn io(name: &str, e: &std::io::Error) -> Self {
        Error::Io {
            name: name.to_string(),
            details: e.to_string(),
        }
    }
}

/// A directory of named, atomically replaced JSON snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    backup_count: u32,
    compression: bool,
}

impl SnapshotStore {
    /// Opens (and creates if needed) a snapshot store.
    pub fn open(config: &StorageConfig) -> Result<Self, Error> {
        fs::create_dir_all(&config.dirpath).map_err(|e| Error::Io {
            name: config.dirpath.display().to_string(),
            details: e.to_string(),
        })?;
        Ok(Self {
            dir: config.dirpath.clone(),
            backup_count: config.backup_count,
            compression: config.enable_compression,
        })
    }

    /// The directory snapshots live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a snapshot under `name`, atomically replacing any previous
    /// generation and rotating backups.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), Error> {
        let payload = serde_json::to_vec(value).map_err(|e| Error::Corrupt {
            name: name.to_string(),
            details: e.to_string(),
        })?;

        let target = self.path_of(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        {
            let mut file = File::create(&tmp).map_err(|e| Error::io(name, &e))?;
            if self.compression {
                let mut encoder = GzEncoder::new(&mut file, Compression::default());
                encoder
                    .write_all(&payload)
                    .and_then(|()| encoder.try_finish())
                    .map_err(|e| Error::io(name, &e))?;
            } else {
                file.write_all(&payload).map_err(|e| Error::io(name, &e))?;
            }
            // The rename is only atomic if the payload made it to disk first.
            file.sync_all().map_err(|e| Error::io(name, &e))?;
        }

        self.rotate_backups(name)?;
        fs::rename(&tmp, &target).map_err(|e| Error::io(name, &e))?;
        debug!(snapshot = name, bytes = payload.len(), "snapshot saved");
        Ok(())
    }

    /// Loads a snapshot, returning `None` when it was never written.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Error> {
        let target = self.path_of(name);
        let raw = match fs::read(&target) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(name, &e)),
        };
        let payload = if self.compression {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut out = Vec::new();
            let _ = decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::io(name, &e))?;
            out
        } else {
            raw
        };
        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| Error::Corrupt {
                name: name.to_string(),
                details: e.to_string(),
            })
    }

    /// Deletes a snapshot and its backups; missing files are fine.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let mut paths = vec![self.path_of(name)];
        for i in 1..=self.backup_count {
            paths.push(self.backup_path(name, i));
        }
        for path in paths {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(Error::io(name, &e));
                }
            }
        }
        Ok(())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        if self.compression {
            self.dir.join(format!("{name}.json.gz"))
        } else {
            self.dir.join(format!("{name}.json"))
        }
    }

    fn backup_path(&self, name: &str, generation: u32) -> PathBuf {
        let mut path = self.path_of(name);
        let file_name = path
            .file_name()
            .map(|f| format!("{}.{generation}", f.to_string_lossy()))
            .unwrap_or_else(|| format!("{name}.{generation}"));
        path.set_file_name(file_name);
        path
    }

    fn rotate_backups(&self, name: &str) -> Result<(), Error> {
        if self.backup_count == 0 {
            return Ok(());
        }
        // Shift name.N-1 -> name.N, ..., name -> name.1; the oldest falls off.
        for generation in (1..self.backup_count).rev() {
            let from = self.backup_path(name, generation);
            if from.exists() {
                fs::rename(&from, self.backup_path(name, generation + 1))
                    .map_err(|e| Error::io(name, &e))?;
            }
        }
        let current = self.path_of(name);
        if current.exists() {
            fs::rename(&current, self.backup_path(name, 1)).map_err(|e| Error::io(name, &e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        n: u64,
        tags: Vec<String>,
    }

    fn store(dir: &Path, compression: bool, backups: u32) -> SnapshotStore {
        SnapshotStore::open(&StorageConfig {
            dirpath: dir.to_path_buf(),
            backup_count: backups,
            enable_compression: compression,
        })
        .unwrap()
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false, 1);
        let sample = Sample {
            n: 7,
            tags: vec!["a".to_string()],
        };
        store.save("cache_Users", &sample).unwrap();
        let back: Option<Sample> = store.load("cache_Users").unwrap();
        assert_eq!(back, Some(sample));
    }

    #[test]
    fn missing_snapshots_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false, 1);
        let got: Option<Sample> = store.load("never_written").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true, 0);
        let sample = Sample {
            n: 42,
            tags: vec!["x".to_string(), "y".to_string()],
        };
        store.save("queue", &sample).unwrap();
        assert!(dir.path().join("queue.json.gz").exists());
        let back: Option<Sample> = store.load("queue").unwrap();
        assert_eq!(back, Some(sample));
    }

    #[test]
    fn backups_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false, 2);
        for n in 0..4u64 {
            store
                .save(
                    "counter",
                    &Sample {
                        n,
                        tags: Vec::new(),
                    },
                )
                .unwrap();
        }
        let current: Option<Sample> = store.load("counter").unwrap();
        assert_eq!(current.map(|s| s.n), Some(3));
        assert!(dir.path().join("counter.json.1").exists());
        assert!(dir.path().join("counter.json.2").exists());
        assert!(!dir.path().join("counter.json.3").exists());
    }

    #[test]
    fn corrupt_snapshots_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false, 0);
        fs::write(dir.path().join("bad.json"), b"not json").unwrap();
        let err = store.load::<Sample>("bad").unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }), "{err:?}");
    }
}
