//! Local disk bucket store
//!
//! Persists every finalized bucket as its own JSON file.
//!
//! # Directory Structure
//!
//! ```text
//! base_path/
//!   {project}/
//!     {rule_id}/
//!       {bucket_start}/
//!         {generation}-{group_hash}.json   - one finalized bucket
//!         .tmp-{uuid}                      - write in progress
//! ```
//!
//! A write goes to a temporary file first and is then hard-linked to its
//! final name. Linking fails if the name exists, which gives create-only
//! semantics without a lock, and readers never see a partially written
//! bucket. Leftover temporary files from a crash are removed on open.
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_rollup::storage::{BucketStore, LocalDiskBucketStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalDiskBucketStore::open("/tmp/rollup")?;
//! assert_eq!(store.engine_id(), "local-disk-v1");
//! # Ok(())
//! # }
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{fold_generation, BucketStore, FinalizedBucket, GroupStates, WriteOutcome};
use crate::error::StorageError;
use crate::rule::RuleId;
use crate::types::{GroupKey, Timestamp};

const TEMP_PREFIX: &str = ".tmp-";
const EXTENSION: &str = "json";

/// File-per-bucket store on the local filesystem
#[derive(Debug)]
pub struct LocalDiskBucketStore {
    base_path: PathBuf,
}

impl LocalDiskBucketStore {
    /// Open (and create if needed) a store rooted at `base_path`
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        let store = Self { base_path };

        let removed = store.remove_temp_files()?;
        if removed > 0 {
            tracing::warn!(
                path = %store.base_path.display(),
                removed,
                "Removed unfinished bucket writes"
            );
        }
        Ok(store)
    }

    /// Root directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn rule_path(&self, project: &str, rule_id: &RuleId) -> Result<PathBuf, StorageError> {
        let safe = !project.is_empty()
            && project
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !safe {
            return Err(StorageError::InvalidKey(format!(
                "project '{}' is not a valid directory name",
                project
            )));
        }
        Ok(self.base_path.join(project).join(rule_id.as_str()))
    }

    fn bucket_path(
        &self,
        project: &str,
        rule_id: &RuleId,
        bucket: Timestamp,
    ) -> Result<PathBuf, StorageError> {
        Ok(self.rule_path(project, rule_id)?.join(bucket.to_string()))
    }

    fn file_name(group: &GroupKey, generation: u64) -> String {
        let digest = blake3::hash(group.as_str().as_bytes());
        format!("{}-{}.{}", generation, &digest.to_hex()[..16], EXTENSION)
    }

    /// Generation encoded in a bucket file name
    fn generation_of(path: &Path) -> Option<u64> {
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        stem.split('-').next()?.parse().ok()
    }

    /// Every bucket file below `dir`, recursively
    fn bucket_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                files.extend(Self::bucket_files(&path)?);
            } else if Self::generation_of(&path).is_some() {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn remove_temp_files(&self) -> Result<usize, StorageError> {
        fn walk(dir: &Path, removed: &mut usize) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    walk(&path, removed)?;
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(TEMP_PREFIX))
                {
                    fs::remove_file(&path)?;
                    *removed += 1;
                }
            }
            Ok(())
        }

        let mut removed = 0;
        walk(&self.base_path, &mut removed)?;
        Ok(removed)
    }

    fn read_file(path: &Path) -> Result<FinalizedBucket, StorageError> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::CorruptedBucket(format!("{}: {}", path.display(), e))
        })
    }
}

impl BucketStore for LocalDiskBucketStore {
    fn write(&self, bucket: &FinalizedBucket) -> Result<WriteOutcome, StorageError> {
        let key = &bucket.key;
        let dir = self.bucket_path(&key.project, &key.rule_id, key.bucket)?;
        fs::create_dir_all(&dir)?;

        let path = dir.join(Self::file_name(&key.group, key.generation));
        if path.exists() {
            return Ok(WriteOutcome::AlreadyExists);
        }

        let payload = serde_json::to_vec(bucket)?;
        let temp = dir.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let written = (|| -> std::io::Result<()> {
            let mut file: File = OpenOptions::new().write(true).create_new(true).open(&temp)?;
            file.write_all(&payload)?;
            file.sync_all()
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        let outcome = match fs::hard_link(&temp, &path) {
            Ok(()) => WriteOutcome::Created,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => WriteOutcome::AlreadyExists,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            },
        };

        if let Err(e) = fs::remove_file(&temp) {
            tracing::warn!(path = %temp.display(), error = %e, "Failed to remove temporary bucket file");
        }
        Ok(outcome)
    }

    fn read_bucket(
        &self,
        project: &str,
        rule_id: &RuleId,
        bucket: Timestamp,
    ) -> Result<GroupStates, StorageError> {
        let mut groups = GroupStates::new();
        for path in Self::bucket_files(&self.bucket_path(project, rule_id, bucket)?)? {
            let stored = Self::read_file(&path)?;
            let key = &stored.key;
            if key.project != project || &key.rule_id != rule_id || key.bucket != bucket {
                return Err(StorageError::CorruptedBucket(format!(
                    "{} holds bucket {} of rule {}",
                    path.display(),
                    stored.key.bucket,
                    stored.key.rule_id
                )));
            }
            fold_generation(&mut groups, &stored.key.group, &stored.state)?;
        }
        Ok(groups)
    }

    fn bucket_count(&self, project: &str, rule_id: &RuleId) -> Result<usize, StorageError> {
        Ok(Self::bucket_files(&self.rule_path(project, rule_id)?)?.len())
    }

    fn max_generation(&self) -> Result<u64, StorageError> {
        Ok(Self::bucket_files(&self.base_path)?
            .iter()
            .filter_map(|path| Self::generation_of(path))
            .max()
            .unwrap_or(0))
    }

    fn delete_rule(&self, project: &str, rule_id: &RuleId) -> Result<usize, StorageError> {
        let path = self.rule_path(project, rule_id)?;
        let count = Self::bucket_files(&path)?.len();
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn engine_id(&self) -> &str {
        "local-disk-v1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::state::AccumulatorState;
    use crate::storage::BucketKey;
    use tempfile::TempDir;

    fn rule() -> RuleId {
        RuleId::new("daily_max").unwrap()
    }

    fn bucket(start: Timestamp, group: &str, generation: u64, value: f64) -> FinalizedBucket {
        FinalizedBucket {
            key: BucketKey {
                project: "shop".to_string(),
                rule_id: rule(),
                bucket: start,
                group: GroupKey::from(group),
                generation,
            },
            state: AccumulatorState::Maximum { value: Some(value) },
            contributions: 1,
            flushed_at: 1_000,
        }
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskBucketStore::open(dir.path()).unwrap();

        assert_eq!(store.write(&bucket(0, "a", 1, 3.0)).unwrap(), WriteOutcome::Created);
        assert_eq!(store.write(&bucket(0, "a", 2, 9.0)).unwrap(), WriteOutcome::Created);
        assert_eq!(store.write(&bucket(0, "b/slash", 3, 1.0)).unwrap(), WriteOutcome::Created);

        let groups = store.read_bucket("shop", &rule(), 0).unwrap();
        assert_eq!(
            groups[&GroupKey::from("a")],
            AccumulatorState::Maximum { value: Some(9.0) }
        );
        assert_eq!(
            groups[&GroupKey::from("b/slash")],
            AccumulatorState::Maximum { value: Some(1.0) }
        );
        assert_eq!(store.bucket_count("shop", &rule()).unwrap(), 3);
    }

    #[test]
    fn test_write_is_create_only() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskBucketStore::open(dir.path()).unwrap();

        store.write(&bucket(0, "a", 1, 3.0)).unwrap();
        assert_eq!(
            store.write(&bucket(0, "a", 1, 50.0)).unwrap(),
            WriteOutcome::AlreadyExists
        );
        let groups = store.read_bucket("shop", &rule(), 0).unwrap();
        assert_eq!(
            groups[&GroupKey::from("a")],
            AccumulatorState::Maximum { value: Some(3.0) }
        );
    }

    #[test]
    fn test_missing_bucket_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskBucketStore::open(dir.path()).unwrap();
        assert!(store.read_bucket("shop", &rule(), 86_400).unwrap().is_empty());
        assert_eq!(store.max_generation().unwrap(), 0);
    }

    #[test]
    fn test_reopen_keeps_data_and_removes_temp_files() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalDiskBucketStore::open(dir.path()).unwrap();
            store.write(&bucket(-86_400, "a", 12, 3.0)).unwrap();
        }
        let stray = dir.path().join("shop").join("daily_max").join("-86400").join(".tmp-crash");
        fs::write(&stray, b"partial").unwrap();

        let store = LocalDiskBucketStore::open(dir.path()).unwrap();
        assert!(!stray.exists());
        assert_eq!(store.max_generation().unwrap(), 12);
        assert_eq!(store.read_bucket("shop", &rule(), -86_400).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupted_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskBucketStore::open(dir.path()).unwrap();
        store.write(&bucket(0, "a", 1, 3.0)).unwrap();

        let path = dir.path().join("shop").join("daily_max").join("0").join("2-0000000000000000.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            store.read_bucket("shop", &rule(), 0),
            Err(StorageError::CorruptedBucket(_))
        ));
    }

    #[test]
    fn test_unsafe_project_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskBucketStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.read_bucket("../etc", &rule(), 0),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_delete_rule() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskBucketStore::open(dir.path()).unwrap();
        store.write(&bucket(0, "a", 1, 3.0)).unwrap();
        store.write(&bucket(86_400, "a", 2, 3.0)).unwrap();

        assert_eq!(store.delete_rule("shop", &rule()).unwrap(), 2);
        assert_eq!(store.bucket_count("shop", &rule()).unwrap(), 0);
        assert_eq!(store.delete_rule("shop", &rule()).unwrap(), 0);
    }
}
