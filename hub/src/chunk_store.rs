//! Durable staging area for uploaded chunks.
//!
//! Layout: `<root>/<task_id>/<index>.chunk`. Each upload owns its own
//! directory, so writers for different uploads never touch the same files.
//! A chunk is written to a temporary file first and only renamed into place
//! by [`StagedChunk::commit`], which makes a re-upload of the same index an
//! atomic replacement.

use crate::errors::{HubError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHUNK_SUFFIX: &str = ".chunk";

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` for `(task_id, index)` to a temporary file.
    ///
    /// Nothing is visible under the final name until the returned handle is
    /// committed. Dropping it uncommitted removes the temporary file.
    pub fn stage_chunk(&self, task_id: &str, index: u32, bytes: &[u8]) -> Result<StagedChunk> {
        let dir = self.task_dir(task_id)?;
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(chunk_file_name(index));
        let temp_path = dir.join(format!(
            ".{}{}.{}.tmp",
            index,
            CHUNK_SUFFIX,
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = File::create(&temp_path)?;
        let written = file.write_all(bytes).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(StagedChunk {
            temp_path,
            final_path,
            done: false,
        })
    }

    /// Path of a committed chunk
    pub fn chunk_path(&self, task_id: &str, index: u32) -> Result<PathBuf> {
        Ok(self.task_dir(task_id)?.join(chunk_file_name(index)))
    }

    pub fn open_chunk(&self, task_id: &str, index: u32) -> Result<File> {
        Ok(File::open(self.chunk_path(task_id, index)?)?)
    }

    /// Size of a committed chunk, `None` if it is not stored
    pub fn chunk_len(&self, task_id: &str, index: u32) -> Result<Option<u64>> {
        match fs::metadata(self.chunk_path(task_id, index)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Indices of committed chunks, ascending
    pub fn stored_indices(&self, task_id: &str) -> Result<Vec<u32>> {
        let dir = self.task_dir(task_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_suffix(CHUNK_SUFFIX)?.parse().ok()
            })
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    /// Delete every staged file of an upload. Returns whether anything existed.
    pub fn remove_task(&self, task_id: &str) -> Result<bool> {
        let dir = self.task_dir(task_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(task_id = %task_id, "Removed staged chunks");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Upload ids that currently have a staging directory
    pub fn staged_tasks(&self) -> Result<Vec<String>> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if valid_task_id(&name) => tasks.push(name),
                Ok(name) => warn!(dir = %name, "Ignoring unexpected staging directory"),
                Err(_) => warn!("Ignoring staging directory with non UTF-8 name"),
            }
        }
        Ok(tasks)
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        if !valid_task_id(task_id) {
            return Err(HubError::InvalidArgument(format!(
                "Invalid upload task id: {:?}",
                task_id
            )));
        }
        Ok(self.root.join(task_id))
    }
}

fn chunk_file_name(index: u32) -> String {
    format!("{}{}", index, CHUNK_SUFFIX)
}

/// Task ids become directory names: hex digits and dashes only
fn valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id.len() <= 64
        && task_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-')
}

/// A chunk written to disk but not yet visible under its final name.
#[derive(Debug)]
pub struct StagedChunk {
    temp_path: PathBuf,
    final_path: PathBuf,
    done: bool,
}

impl StagedChunk {
    /// Atomically move the chunk into place, replacing any previous copy.
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp_path, &self.final_path)?;
        self.done = true;
        Ok(())
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

impl Drop for StagedChunk {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    const TASK: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    fn read_chunk(store: &ChunkStore, index: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        store
            .open_chunk(TASK, index)
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_commit_makes_chunk_visible() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path()).unwrap();

        let staged = store.stage_chunk(TASK, 3, b"abc").unwrap();
        assert_eq!(store.chunk_len(TASK, 3).unwrap(), None);

        staged.commit().unwrap();
        assert_eq!(store.chunk_len(TASK, 3).unwrap(), Some(3));
        assert_eq!(store.stored_indices(TASK).unwrap(), vec![3]);
        assert!(store
            .chunk_path(TASK, 3)
            .unwrap()
            .ends_with(format!("{}/3.chunk", TASK)));
    }

    #[test]
    fn test_dropped_stage_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path()).unwrap();

        drop(store.stage_chunk(TASK, 0, b"abc").unwrap());

        assert!(store.stored_indices(TASK).unwrap().is_empty());
        let leftovers = fs::read_dir(temp_dir.path().join(TASK)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_reupload_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path()).unwrap();

        store.stage_chunk(TASK, 0, b"first").unwrap().commit().unwrap();
        store.stage_chunk(TASK, 0, b"again").unwrap().commit().unwrap();

        assert_eq!(store.stored_indices(TASK).unwrap(), vec![0]);
        assert_eq!(read_chunk(&store, 0), b"again");
    }

    #[test]
    fn test_remove_task() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path()).unwrap();

        store.stage_chunk(TASK, 0, b"x").unwrap().commit().unwrap();
        assert_eq!(store.staged_tasks().unwrap(), vec![TASK.to_string()]);

        assert!(store.remove_task(TASK).unwrap());
        assert!(!store.remove_task(TASK).unwrap());
        assert!(store.staged_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path()).unwrap();

        let err = store.stage_chunk("../etc", 0, b"x").unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }
}
