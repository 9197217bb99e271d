//! Durable storage backends for persisted token entries.
//!
//! Backends move opaque entry bytes keyed by identifier. They know nothing
//! about encryption; the store hands them already-sealed envelopes.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, VaultError};

/// File extension for persisted entries
const ENTRY_EXTENSION: &str = "token";

/// Durable mapping from identifier to entry bytes.
///
/// Implementations must make `write` atomic: a concurrent reader (in this or
/// another process) sees either the previous entry or the new one, never a
/// partial write.
pub trait StorageBackend: Send + Sync {
    /// Returns `Ok(None)` when no entry exists.
    fn read(&self, identifier: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces the entry for `identifier`.
    fn write(&self, identifier: &str, entry: &[u8]) -> Result<()>;

    /// Returns `Ok(true)` if an entry was removed, `Ok(false)` if none existed.
    fn remove(&self, identifier: &str) -> Result<bool>;

    /// All identifiers with a persisted entry, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Removes every entry.
    fn clear(&self) -> Result<()> {
        for identifier in self.list()? {
            self.remove(&identifier)?;
        }
        Ok(())
    }
}

/// One file per identifier in a directory.
///
/// Writes go to a uniquely named temp file in the same directory, are fsynced,
/// then renamed over the entry. Files are created with mode 0600 on unix.
pub struct FileBackend {
    directory: PathBuf,
}

impl FileBackend {
    /// Opens (or creates) the storage directory.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            VaultError::Storage(format!(
                "failed to create token directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&directory, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Identifiers are percent-encoded so any string maps to one safe file name.
    fn entry_path(&self, identifier: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", urlencoding::encode(identifier), ENTRY_EXTENSION))
    }

    fn write_temp(tmp_path: &Path, entry: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(entry)?;
        file.sync_all()
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(identifier);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VaultError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                err
            ))),
        }
    }

    fn write(&self, identifier: &str, entry: &[u8]) -> Result<()> {
        let path = self.entry_path(identifier);
        let tmp_path = path.with_extension(format!("{}.tmp-{}", ENTRY_EXTENSION, Uuid::new_v4()));

        if let Err(err) = Self::write_temp(&tmp_path, entry) {
            let _ = fs::remove_file(&tmp_path);
            return Err(VaultError::Storage(format!(
                "failed to write temporary entry for '{}': {}",
                identifier, err
            )));
        }

        // Atomically rename temp file to final path
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(VaultError::Storage(format!(
                "failed to replace entry for '{}': {}",
                identifier, err
            )));
        }

        // Persist the rename itself
        #[cfg(unix)]
        if let Err(err) = File::open(&self.directory).and_then(|dir| dir.sync_all()) {
            warn!(directory = %self.directory.display(), error = %err, "Failed to sync token directory");
        }

        debug!(identifier = %identifier, bytes = entry.len(), "Entry written");
        Ok(())
    }

    fn remove(&self, identifier: &str) -> Result<bool> {
        let path = self.entry_path(identifier);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(VaultError::Storage(format!(
                "failed to remove {}: {}",
                path.display(),
                err
            ))),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut identifiers = Vec::new();
        for dirent in fs::read_dir(&self.directory)? {
            let path = dirent?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(identifier) => identifiers.push(identifier.into_owned()),
                Err(_) => warn!(path = %path.display(), "Skipping entry with undecodable name"),
            }
        }
        identifiers.sort();
        Ok(identifiers)
    }
}

/// One row per identifier in a SQLite database.
///
/// # Schema
/// ```sql
/// CREATE TABLE token_entries (
///     identifier TEXT PRIMARY KEY,
///     entry      BLOB NOT NULL,    -- sealed envelope
///     updated_at TEXT NOT NULL     -- ISO 8601 timestamp
/// );
/// ```
///
/// Each write is a single upsert statement, so SQLite's transaction guarantee
/// gives the same all-or-nothing replacement as the file backend's rename.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Creates or opens the database at `db_path` (`":memory:"` for tests).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Concurrent processes wait on each other instead of failing fast
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS token_entries (
                identifier TEXT PRIMARY KEY,
                entry      BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Storage("sqlite connection mutex poisoned".to_string()))
    }
}

impl StorageBackend for SqliteBackend {
    fn read(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT entry FROM token_entries WHERE identifier = ?1",
                params![identifier],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(entry)
    }

    fn write(&self, identifier: &str, entry: &[u8]) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO token_entries (identifier, entry, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(identifier) DO UPDATE SET
                entry = excluded.entry,
                updated_at = excluded.updated_at
            "#,
            params![identifier, entry, Utc::now().to_rfc3339()],
        )?;
        debug!(identifier = %identifier, bytes = entry.len(), "Entry written");
        Ok(())
    }

    fn remove(&self, identifier: &str) -> Result<bool> {
        let rows_affected = self.conn()?.execute(
            "DELETE FROM token_entries WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(rows_affected > 0)
    }

    fn list(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT identifier FROM token_entries ORDER BY identifier")?;
        let identifiers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(identifiers)
    }

    fn clear(&self) -> Result<()> {
        self.conn()?.execute("DELETE FROM token_entries", [])?;
        Ok(())
    }
}
