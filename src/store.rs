//! Artifact persistence.
//!
//! Every expensive stage of the pipeline caches its output under an `ArtifactKey`.
//! Presence of a key is the only signal used to skip work: an existing artifact is
//! trusted as-is and never rewritten.
use crate::error::{NNIFError, Result};
use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Relative, `/`-separated location of an artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    segments: Vec<String>,
}

impl ArtifactKey {
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn join(&self, path: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(Self::new(path).segments);
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn to_path(&self, root: &Path) -> PathBuf {
        self.segments
            .iter()
            .fold(root.to_path_buf(), |path, seg| path.join(seg))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

pub trait ArtifactStore {
    fn exists(&self, key: &ArtifactKey) -> bool;

    /// # Errors
    /// If the artifact is absent or unreadable.
    fn load(&self, key: &ArtifactKey) -> Result<Vec<u8>>;

    /// # Errors
    /// If the artifact cannot be written.
    fn save(&mut self, key: &ArtifactKey, bytes: &[u8]) -> Result<()>;

    /// # Errors
    fn load_json<T: DeserializeOwned>(&self, key: &ArtifactKey) -> Result<T>
    where
        Self: Sized,
    {
        Ok(serde_json::from_slice(&self.load(key)?)?)
    }

    /// # Errors
    fn save_json<T: Serialize + ?Sized>(&mut self, key: &ArtifactKey, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.save(key, &bytes)
    }

    /// # Errors
    fn save_text(&mut self, key: &ArtifactKey, text: &str) -> Result<()>
    where
        Self: Sized,
    {
        self.save(key, text.as_bytes())
    }
}

fn not_found(key: &ArtifactKey) -> NNIFError {
    NNIFError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("artifact {} does not exist", key),
    ))
}

/// Artifacts as files below a root directory. Writes go to a temporary file in the
/// destination directory and are renamed into place, so an interrupted run never
/// leaves a partial artifact behind.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, key: &ArtifactKey) -> PathBuf {
        key.to_path(&self.root)
    }
}

impl ArtifactStore for FsStore {
    fn exists(&self, key: &ArtifactKey) -> bool {
        self.path_of(key).is_file()
    }

    fn load(&self, key: &ArtifactKey) -> Result<Vec<u8>> {
        let path = self.path_of(key);
        if !path.is_file() {
            return Err(not_found(key));
        }
        Ok(fs::read(path)?)
    }

    fn save(&mut self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| NNIFError::Io(e.error))?;
        trace!("saved {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

/// In-memory store, mainly for exercising cache logic without touching disk.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    artifacts: BTreeMap<ArtifactKey, Vec<u8>>,
    num_writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.artifacts.keys()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Total number of `save` calls, including overwrites.
    pub const fn num_writes(&self) -> usize {
        self.num_writes
    }

    pub fn get(&self, key: &ArtifactKey) -> Option<&[u8]> {
        self.artifacts.get(key).map(Vec::as_slice)
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, key: &ArtifactKey) -> bool {
        self.artifacts.contains_key(key)
    }

    fn load(&self, key: &ArtifactKey) -> Result<Vec<u8>> {
        self.artifacts.get(key).cloned().ok_or_else(|| not_found(key))
    }

    fn save(&mut self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        self.num_writes += 1;
        self.artifacts.insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{arr1, Array1};

    #[test]
    fn test_key_join_and_display() {
        let key = ArtifactKey::new("val/val_index_3").join("adv/cw").join("scores.json");
        assert_eq!(key.to_string(), "val/val_index_3/adv/cw/scores.json");
        assert_eq!(key.segments().len(), 5);
        assert_eq!(ArtifactKey::new("//a//b/").to_string(), "a/b");
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        let key = ArtifactKey::new("x_val_preds.json");
        assert!(!store.exists(&key));
        assert!(matches!(store.load(&key), Err(NNIFError::Io(_))));

        store.save_json(&key, &arr1(&[1usize, 2, 3])).unwrap();
        assert!(store.exists(&key));
        let loaded: Array1<usize> = store.load_json(&key).unwrap();
        assert_eq!(loaded, arr1(&[1, 2, 3]));
        assert_eq!(store.num_writes(), 1);
    }

    #[test]
    fn test_fs_store_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStore::new(dir.path());
        let key = ArtifactKey::new("test/test_index_9/pred/summary.txt");
        store.save_text(&key, "hello").unwrap();
        assert!(store.exists(&key));
        assert!(store.path_of(&key).is_file());
        assert_eq!(store.load(&key).unwrap(), b"hello");

        // no stray temporaries left next to the artifact
        let siblings = fs::read_dir(store.path_of(&key).parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(siblings, 1);
    }
}
