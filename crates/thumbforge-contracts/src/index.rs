use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_FILE_NAME: &str = "thumbnail_index.json";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lowered = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lowered.as_str())
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub filename: String,
    pub category: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding for {0} is empty")]
    EmptyEmbedding(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot {path} is inconsistent: {detail}")]
    Inconsistent { path: PathBuf, detail: String },
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// In-memory similarity index. Entries share one embedding dimension and the
/// category list is kept sorted and de-duplicated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    entries: Vec<IndexEntry>,
    categories: BTreeSet<String>,
    embedding_model: Option<String>,
}

impl Index {
    pub fn new(embedding_model: Option<String>) -> Self {
        Self {
            embedding_model,
            ..Self::default()
        }
    }

    pub fn append(&mut self, entry: IndexEntry) -> Result<(), IndexError> {
        if entry.embedding.is_empty() {
            return Err(IndexError::EmptyEmbedding(entry.filename));
        }
        if let Some(expected) = self.dimension() {
            if entry.embedding.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: entry.embedding.len(),
                });
            }
        }
        if let Some(category) = entry.category.as_ref() {
            self.categories.insert(category.clone());
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|entry| entry.embedding.len())
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.iter().cloned().collect()
    }

    /// Entries in `category`, or the uncategorized ones when `None`.
    pub fn entries_in(&self, category: Option<&str>) -> Vec<&IndexEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.category.as_deref() == category)
            .collect()
    }

    pub fn embedding_model(&self) -> Option<&str> {
        self.embedding_model.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotThumbnail {
    pub path: String,
    pub filename: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// On-disk form of an [`Index`]. Snapshots without a `version` key predate
/// versioning and load as version 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<SnapshotThumbnail>,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl IndexSnapshot {
    pub fn from_index(index: &Index) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            embedding_model: index.embedding_model.clone(),
            thumbnails: index
                .entries
                .iter()
                .map(|entry| SnapshotThumbnail {
                    path: entry.path.to_string_lossy().to_string(),
                    filename: entry.filename.clone(),
                    category: entry.category.clone(),
                })
                .collect(),
            embeddings: index
                .entries
                .iter()
                .map(|entry| entry.embedding.clone())
                .collect(),
            categories: index.categories(),
        }
    }

    pub fn into_index(self, path: &Path) -> Result<Index, SnapshotError> {
        if self.thumbnails.len() != self.embeddings.len() {
            return Err(SnapshotError::Inconsistent {
                path: path.to_path_buf(),
                detail: format!(
                    "{} thumbnails but {} embeddings",
                    self.thumbnails.len(),
                    self.embeddings.len()
                ),
            });
        }
        let mut index = Index::new(self.embedding_model);
        for (thumbnail, embedding) in self.thumbnails.into_iter().zip(self.embeddings) {
            index
                .append(IndexEntry {
                    path: PathBuf::from(thumbnail.path),
                    filename: thumbnail.filename,
                    category: thumbnail.category,
                    embedding,
                })
                .map_err(|err| SnapshotError::Inconsistent {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                })?;
        }
        // Older snapshots may list categories that no entry carries anymore.
        for category in self.categories {
            index.categories.insert(category);
        }
        Ok(index)
    }
}

/// `Ok(None)` when the snapshot does not exist; a present but unreadable
/// snapshot is an error.
pub fn load_snapshot(path: &Path) -> Result<Option<Index>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|source| SnapshotError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: IndexSnapshot =
        serde_json::from_str(&raw).map_err(|source| SnapshotError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    snapshot.into_index(path).map(Some)
}

pub fn write_snapshot(path: &Path, index: &Index) -> Result<(), SnapshotError> {
    write_snapshot_atomic(path, &IndexSnapshot::from_index(index)).map_err(|source| {
        SnapshotError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn write_snapshot_atomic(path: &Path, snapshot: &IndexSnapshot) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    temp.write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())?;
    temp.flush()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn entry(path: &str, category: Option<&str>, embedding: Vec<f32>) -> IndexEntry {
        let path = PathBuf::from(path);
        IndexEntry {
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            path,
            category: category.map(str::to_string),
            embedding,
        }
    }

    #[test]
    fn append_enforces_dimension_and_tracks_categories() {
        let mut index = Index::new(None);
        assert!(index
            .append(entry("lib/Tech/a.jpg", Some("Tech"), vec![1.0, 0.0]))
            .is_ok());
        assert!(index
            .append(entry("lib/Gaming/b.jpg", Some("Gaming"), vec![0.0, 1.0]))
            .is_ok());
        assert!(index
            .append(entry("lib/Tech/c.jpg", Some("Tech"), vec![0.5, 0.5]))
            .is_ok());
        assert_eq!(
            index.append(entry("lib/d.jpg", None, vec![1.0, 0.0, 0.0])),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(index.len(), 3);
        assert_eq!(index.categories(), vec!["Gaming", "Tech"]);
        assert_eq!(index.entries_in(Some("Tech")).len(), 2);
        assert!(index.entries_in(None).is_empty());
    }

    #[test]
    fn snapshot_roundtrip_preserves_entries() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SNAPSHOT_FILE_NAME);
        let mut index = Index::new(Some("jina-clip-v2".to_string()));
        index.append(entry("lib/Tech/a.jpg", Some("Tech"), vec![0.25, 0.75]))?;
        index.append(entry("lib/c.jpg", None, vec![1.0, 0.0]))?;

        write_snapshot(&path, &index)?;
        let loaded = load_snapshot(&path)?;

        assert_eq!(loaded.as_ref(), Some(&index));
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["version"], serde_json::json!(SNAPSHOT_VERSION));
        assert_eq!(raw["thumbnails"][1]["category"], serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn unversioned_snapshot_loads_as_version_zero() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SNAPSHOT_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"thumbnails":[{"path":"t/a.jpg","filename":"a.jpg","category":null}],"embeddings":[[0.1,0.2]]}"#,
        )?;
        let snapshot: IndexSnapshot = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(snapshot.version, 0);
        let index = load_snapshot(&path)?.unwrap_or_default();
        assert_eq!(index.len(), 1);
        assert!(index.categories().is_empty());
        Ok(())
    }

    #[test]
    fn missing_snapshot_is_none_and_corrupt_snapshot_is_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SNAPSHOT_FILE_NAME);
        assert!(load_snapshot(&path)?.is_none());

        std::fs::write(&path, "{not json")?;
        assert!(matches!(
            load_snapshot(&path),
            Err(SnapshotError::Parse { .. })
        ));

        std::fs::write(
            &path,
            r#"{"thumbnails":[{"path":"a.jpg","filename":"a.jpg"}],"embeddings":[]}"#,
        )?;
        assert!(matches!(
            load_snapshot(&path),
            Err(SnapshotError::Inconsistent { .. })
        ));
        Ok(())
    }

    #[test]
    fn image_extensions_match_case_insensitively() {
        assert!(is_image_path(&PathBuf::from("x/A.JPG")));
        assert!(is_image_path(&PathBuf::from("x/b.webp")));
        assert!(!is_image_path(&PathBuf::from("x/notes.txt")));
        assert!(!is_image_path(&PathBuf::from("x/noext")));
    }
}
