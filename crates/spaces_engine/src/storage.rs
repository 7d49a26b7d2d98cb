//! Durable storage backends for the spaces record.
//!
//! One pretty-printed JSON document per profile, written through a temp
//! file and renamed into place, with three rotating backups.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{StorageError, StorageResult};
use crate::model::{StoredSpaces, SCHEMA_VERSION};

/// A place the engine can persist both space collections to.
///
/// `save` must replace the whole record or leave the previous one intact.
pub trait SpaceStorage: Send + Sync {
    fn load(&self) -> StorageResult<StoredSpaces>;
    fn save(&self, stored: &StoredSpaces) -> StorageResult<()>;
}

/// JSON file storage under `<root>/profiles/<profile>/spaces.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    profile: String,
}

impl FileStorage {
    pub fn new(root: PathBuf, profile: String) -> Self {
        Self { root, profile }
    }

    fn load_from_backup(&self) -> Option<StoredSpaces> {
        let path = self.file_path();
        ["json.bak", "json.bak.1", "json.bak.2"]
            .iter()
            .map(|ext| path.with_extension(ext))
            .filter(|backup| backup.exists())
            .find_map(|backup| {
                let data = fs::read_to_string(&backup).ok()?;
                serde_json::from_str::<StoredSpaces>(&data).ok()
            })
    }

    fn migrate(&self, mut stored: StoredSpaces) -> StorageResult<StoredSpaces> {
        if stored.schema_version < SCHEMA_VERSION {
            stored.schema_version = SCHEMA_VERSION;
        }
        Ok(stored)
    }

    fn rotate_backups(&self, path: &Path) {
        if !path.exists() {
            return;
        }

        let bak2 = path.with_extension("json.bak.2");
        let bak1 = path.with_extension("json.bak.1");
        let bak = path.with_extension("json.bak");

        if let Err(e) = fs::remove_file(&bak2) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "spaces_backup_warning remove bak2 failed");
            }
        }

        if bak1.exists() {
            if let Err(e) = fs::rename(&bak1, &bak2) {
                warn!(error = %e, "spaces_backup_warning rotate bak1->bak2 failed");
            }
        }

        if bak.exists() {
            if let Err(e) = fs::rename(&bak, &bak1) {
                warn!(error = %e, "spaces_backup_warning rotate bak->bak1 failed");
            }
        }

        // Copy rather than rename so the main file never disappears.
        if let Err(e) = fs::copy(path, &bak) {
            warn!(error = %e, "spaces_backup_warning create backup failed");
        }
    }

    pub fn file_path(&self) -> PathBuf {
        let profile_dir = self.root.join("profiles").join(&self.profile);
        profile_dir.join("spaces.json")
    }
}

impl SpaceStorage for FileStorage {
    fn load(&self) -> StorageResult<StoredSpaces> {
        let path = self.file_path();
        if !path.exists() {
            if let Some(backup) = self.load_from_backup() {
                warn!(path = %path.display(), "spaces_main_file_missing loaded backup");
                return self.migrate(backup);
            }
            return Ok(StoredSpaces::default());
        }
        let data =
            fs::read_to_string(&path).map_err(|e| StorageError::ReadError(e.to_string()))?;
        let stored = match serde_json::from_str::<StoredSpaces>(&data) {
            Ok(s) => s,
            Err(parse_err) => {
                if let Some(backup) = self.load_from_backup() {
                    warn!(error = %parse_err, "spaces_main_file_corrupt loaded backup");
                    return self.migrate(backup);
                }
                return Err(StorageError::ParseError(parse_err.to_string()));
            }
        };
        self.migrate(stored)
    }

    fn save(&self, stored: &StoredSpaces) -> StorageResult<()> {
        let path = self.file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::WriteError(e.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let file =
            fs::File::create(&tmp_path).map_err(|e| StorageError::WriteError(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, stored)
            .map_err(|e| StorageError::SerializeError(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| StorageError::WriteError(e.to_string()))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| StorageError::WriteError(e.to_string()))?;
        self.rotate_backups(&path);
        fs::rename(&tmp_path, &path).map_err(|e| StorageError::WriteError(e.to_string()))?;
        Ok(())
    }
}

pub fn default_storage_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new("/").to_path_buf())
        .join(".spaces")
}

#[derive(Debug, Default)]
struct MemoryInner {
    document: Option<String>,
    failing_saves: u32,
    saves: u32,
}

/// In-process storage. Keeps the serialized document, so a load after a
/// save goes through the same JSON path as the file backend. Saves can be
/// made to fail on purpose.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` saves fail with a write error.
    pub fn fail_next_saves(&self, count: u32) {
        self.inner.lock().failing_saves = count;
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u32 {
        self.inner.lock().saves
    }

    /// The last durable document, parsed back.
    pub fn contents(&self) -> Option<StoredSpaces> {
        let inner = self.inner.lock();
        let document = inner.document.as_ref()?;
        serde_json::from_str(document).ok()
    }
}

impl SpaceStorage for MemoryStorage {
    fn load(&self) -> StorageResult<StoredSpaces> {
        let inner = self.inner.lock();
        match inner.document.as_ref() {
            Some(document) => Ok(serde_json::from_str(document)?),
            None => Ok(StoredSpaces::default()),
        }
    }

    fn save(&self, stored: &StoredSpaces) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.failing_saves > 0 {
            inner.failing_saves -= 1;
            return Err(StorageError::WriteError("injected failure".to_string()));
        }
        let document = serde_json::to_string(stored)
            .map_err(|e| StorageError::SerializeError(e.to_string()))?;
        inner.document = Some(document);
        inner.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClosedSpace, PermanentId};
    use tempfile::TempDir;
    use time::OffsetDateTime;

    fn closed(id: &str) -> ClosedSpace {
        ClosedSpace {
            permanent_id: PermanentId::from(id),
            name: format!("Window {}", id),
            custom_name: None,
            tab_urls: vec!["https://example.com/".to_string()],
            version: 2,
            last_modified: OffsetDateTime::UNIX_EPOCH,
            closed_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn stored_with_closed(id: &str) -> StoredSpaces {
        let mut stored = StoredSpaces::default();
        stored
            .closed_spaces
            .insert(PermanentId::from(id), closed(id));
        stored
    }

    #[test]
    fn test_load_empty_creates_default() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().to_path_buf(), "test".to_string());
        let stored = storage.load().unwrap();
        assert_eq!(stored.schema_version, SCHEMA_VERSION);
        assert!(stored.spaces.is_empty());
        assert!(stored.closed_spaces.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip_keeps_both_collections() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().to_path_buf(), "test".to_string());

        let stored = stored_with_closed("closed-1");
        storage.save(&stored).unwrap();
        let loaded = storage.load().unwrap();
        assert_eq!(loaded, stored, "loaded record must equal the saved one");
        assert!(
            !storage.file_path().with_extension("json.tmp").exists(),
            "temp file must be renamed away"
        );
    }

    #[test]
    fn test_backup_rotation() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().to_path_buf(), "test".to_string());

        for i in 0..4 {
            storage.save(&stored_with_closed(&format!("closed-{}", i))).unwrap();
        }

        let path = storage.file_path();
        assert!(path.exists());
        assert!(path.with_extension("json.bak").exists());
        assert!(path.with_extension("json.bak.1").exists());
        assert!(path.with_extension("json.bak.2").exists());
    }

    #[test]
    fn test_load_from_backup_on_corrupt_main_file() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().to_path_buf(), "test".to_string());

        let stored = stored_with_closed("survivor");
        storage.save(&stored).unwrap();
        storage.save(&stored).unwrap();
        fs::write(storage.file_path(), "invalid json").unwrap();

        let loaded = storage.load().unwrap();
        assert!(
            loaded.closed_spaces.contains_key(&PermanentId::from("survivor")),
            "backup must be loaded on corruption"
        );
    }

    #[test]
    fn test_corrupt_file_without_backup_is_a_parse_error() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().to_path_buf(), "test".to_string());
        let path = storage.file_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{").unwrap();

        assert!(matches!(storage.load(), Err(StorageError::ParseError(_))));
    }

    #[test]
    fn test_storage_path_follows_profile_convention() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().to_path_buf(), "custom-profile".to_string());
        let path = storage.file_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("profiles"));
        assert!(path_str.contains("custom-profile"));
        assert!(path_str.ends_with("spaces.json"));
    }

    #[test]
    fn test_memory_storage_injected_failures_keep_previous_document() {
        let storage = MemoryStorage::new();
        storage.save(&stored_with_closed("first")).unwrap();
        storage.fail_next_saves(1);

        let err = storage.save(&stored_with_closed("second")).unwrap_err();
        assert!(matches!(err, StorageError::WriteError(_)));
        let contents = storage.contents().unwrap();
        assert!(contents.closed_spaces.contains_key(&PermanentId::from("first")));
        assert_eq!(storage.save_count(), 1);

        storage.save(&stored_with_closed("second")).unwrap();
        assert_eq!(storage.save_count(), 2, "failure budget must be spent");
    }
}
