use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use thumbforge_contracts::events::{payload, EventWriter};
use thumbforge_contracts::index::{
    is_image_path, load_snapshot, write_snapshot, Index, IndexEntry, SNAPSHOT_FILE_NAME,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::embed::{cosine_similarity, Embedder};
use crate::error::{EngineError, EngineResult};
use crate::http::error_chain_text;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub path: PathBuf,
    pub filename: String,
    pub category: Option<String>,
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub imported: Vec<PathBuf>,
    pub rejected: Vec<(PathBuf, String)>,
    pub index: Index,
}

pub fn query_text(topic: &str, point_of_view: Option<&str>) -> String {
    let mut query = format!("thumbnail about {}", topic.trim());
    if let Some(pov) = point_of_view.map(str::trim).filter(|pov| !pov.is_empty()) {
        query.push_str(&format!(" from {pov} perspective"));
    }
    query
}

/// A directory of reference thumbnails plus its persisted similarity index.
/// Subdirectory names act as categories.
pub struct ThumbnailLibrary<E> {
    root: PathBuf,
    snapshot_path: PathBuf,
    embedder: E,
    events: EventWriter,
}

impl<E: Embedder> ThumbnailLibrary<E> {
    pub fn new(root: impl Into<PathBuf>, embedder: E) -> Self {
        let root = root.into();
        Self {
            snapshot_path: root.join(SNAPSHOT_FILE_NAME),
            root,
            embedder,
            events: EventWriter::disabled(),
        }
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = path.into();
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Scans the library, embeds every readable image and replaces the
    /// snapshot. Files that fail to load or embed are skipped.
    pub fn build(&self) -> EngineResult<Index> {
        if !self.root.is_dir() {
            return Err(EngineError::InvalidInput(format!(
                "library root {} is not a directory",
                self.root.display()
            )));
        }
        self.events.record(
            "index_started",
            payload(json!({
                "root": self.root.to_string_lossy(),
                "embedding_model": self.embedder.model(),
            })),
        );

        let mut index = Index::new(Some(self.embedder.model().to_string()));
        let mut skipped = 0usize;
        for path in self.image_files() {
            let category = self.category_for(&path);
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let entry = match self.embedder.embed_image(&path) {
                Ok(embedding) => IndexEntry {
                    path: path.clone(),
                    filename,
                    category,
                    embedding,
                },
                Err(err) => {
                    skipped += 1;
                    self.skip(&path, &error_chain_text(&err, 300));
                    continue;
                }
            };
            if let Err(err) = index.append(entry) {
                skipped += 1;
                self.skip(&path, &err.to_string());
                continue;
            }
            debug!(path = %path.display(), "indexed thumbnail");
        }

        write_snapshot(&self.snapshot_path, &index)?;
        info!(
            root = %self.root.display(),
            entries = index.len(),
            skipped,
            categories = index.categories().len(),
            "thumbnail index built"
        );
        self.events.record(
            "index_built",
            payload(json!({
                "root": self.root.to_string_lossy(),
                "entries": index.len(),
                "skipped": skipped,
                "categories": index.categories(),
                "snapshot": self.snapshot_path.to_string_lossy(),
            })),
        );
        Ok(index)
    }

    /// Loads the snapshot, or an empty index when there is none yet.
    pub fn load_or_create(&self) -> EngineResult<Index> {
        match load_snapshot(&self.snapshot_path)? {
            Some(index) => {
                debug!(
                    snapshot = %self.snapshot_path.display(),
                    entries = index.len(),
                    "loaded thumbnail index"
                );
                Ok(index)
            }
            None => Ok(Index::new(Some(self.embedder.model().to_string()))),
        }
    }

    pub fn query(
        &self,
        index: &Index,
        topic: &str,
        point_of_view: Option<&str>,
        k: usize,
    ) -> EngineResult<Vec<SearchResult>> {
        if index.is_empty() {
            return Err(EngineError::EmptyIndex);
        }
        if topic.trim().is_empty() {
            return Err(EngineError::InvalidInput("topic must not be blank".to_string()));
        }
        let query = query_text(topic, point_of_view);
        let query_embedding = self
            .embedder
            .embed_text(&query)
            .map_err(|err| EngineError::Embedding(error_chain_text(&err, 300)))?;
        if let Some(expected) = index.dimension() {
            if query_embedding.len() != expected {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    actual: query_embedding.len(),
                });
            }
        }

        let mut scored: Vec<(&IndexEntry, f32)> = index
            .entries()
            .iter()
            .map(|entry| (entry, cosine_similarity(&query_embedding, &entry.embedding)))
            .collect();
        scored.sort_by(|(left, left_score), (right, right_score)| {
            right_score
                .total_cmp(left_score)
                .then_with(|| left.path.cmp(&right.path))
        });

        let results: Vec<SearchResult> = scored
            .into_iter()
            .take(k.min(index.len()))
            .enumerate()
            .map(|(idx, (entry, score))| SearchResult {
                path: entry.path.clone(),
                filename: entry.filename.clone(),
                category: entry.category.clone(),
                score,
                rank: idx + 1,
            })
            .collect();

        self.events.record(
            "search_completed",
            payload(json!({
                "query": query,
                "k": k,
                "results": results
                    .iter()
                    .map(|row| json!({"path": row.path.to_string_lossy(), "score": row.score}))
                    .collect::<Vec<_>>(),
            })),
        );
        Ok(results)
    }

    /// Copies images into `root/<category>/` and rebuilds the index so the
    /// new files are searchable immediately.
    pub fn import(&self, files: &[PathBuf], category: Option<&str>) -> EngineResult<ImportReport> {
        let category = category.map(str::trim).filter(|value| !value.is_empty());
        if let Some(name) = category {
            if name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(EngineError::InvalidInput(format!(
                    "category '{name}' must be a plain folder name"
                )));
            }
        }
        let target_dir = match category {
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        };
        std::fs::create_dir_all(&target_dir).map_err(|err| EngineError::io(&target_dir, err))?;

        let mut imported = Vec::new();
        let mut rejected = Vec::new();
        for file in files {
            if !file.is_file() {
                rejected.push((file.clone(), "file not found".to_string()));
                continue;
            }
            if !is_image_path(file) {
                rejected.push((file.clone(), "unsupported file type".to_string()));
                continue;
            }
            let Some(name) = file.file_name() else {
                rejected.push((file.clone(), "missing file name".to_string()));
                continue;
            };
            let destination = unique_destination(&target_dir, Path::new(name));
            std::fs::copy(file, &destination).map_err(|err| EngineError::io(&destination, err))?;
            imported.push(destination);
        }
        for (path, reason) in &rejected {
            warn!(path = %path.display(), reason = %reason, "import rejected file");
        }

        let index = if imported.is_empty() {
            self.load_or_create()?
        } else {
            self.build()?
        };
        self.events.record(
            "import_completed",
            payload(json!({
                "category": category,
                "imported": imported.iter().map(|path| path.to_string_lossy()).collect::<Vec<_>>(),
                "rejected": rejected.len(),
                "entries": index.len(),
            })),
        );
        Ok(ImportReport {
            imported,
            rejected,
            index,
        })
    }

    fn image_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && is_image_path(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Err(err) => warn!(error = %err, "skipping unreadable library entry"),
            }
        }
        files
    }

    fn category_for(&self, path: &Path) -> Option<String> {
        let parent = path.parent()?;
        if parent == self.root {
            return None;
        }
        parent
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
    }

    fn skip(&self, path: &Path, reason: &str) {
        warn!(path = %path.display(), reason, "skipping thumbnail");
        self.events.record(
            "index_entry_skipped",
            payload(json!({
                "path": path.to_string_lossy(),
                "reason": reason,
            })),
        );
    }
}

fn unique_destination(dir: &Path, name: &Path) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "thumbnail".to_string());
    let ext = name
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    loop {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let candidate = dir.join(format!("{stem}_{}{ext}", &suffix[..6]));
        if !candidate.exists() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use image::{Rgb, RgbImage};
    use serde_json::Value;
    use thumbforge_contracts::events::EventWriter;

    use super::*;
    use crate::embed::DryrunEmbedder;

    fn write_png(path: &Path, rgb: [u8; 3]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        RgbImage::from_pixel(6, 4, Rgb(rgb)).save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    fn sample_library(root: &Path) -> Result<()> {
        write_png(&root.join("Tech").join("a.jpg"), [10, 200, 30])?;
        write_png(&root.join("Tech").join("b.png"), [90, 20, 200])?;
        write_png(&root.join("c.jpg"), [250, 250, 0])?;
        Ok(())
    }

    #[test]
    fn query_returns_top_k_with_categories() -> Result<()> {
        let temp = tempfile::tempdir()?;
        sample_library(temp.path())?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());

        let index = library.build()?;
        assert_eq!(index.len(), 3);
        assert_eq!(index.categories(), vec!["Tech"]);

        let results = library.query(&index, "AI", None, 2)?;
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].rank, 2);
        for row in &results {
            let expected = match row.filename.as_str() {
                "a.jpg" | "b.png" => Some("Tech"),
                "c.jpg" => None,
                other => panic!("unexpected result {other}"),
            };
            assert_eq!(row.category.as_deref(), expected);
        }
        Ok(())
    }

    #[test]
    fn scores_are_bounded_and_sorted_with_k_clamped() -> Result<()> {
        let temp = tempfile::tempdir()?;
        sample_library(temp.path())?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::new(16));
        let index = library.build()?;

        let results = library.query(&index, "cooking", Some("a beginner"), 10)?;
        assert_eq!(results.len(), 3);
        for window in results.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
        assert!(results.iter().all(|row| (-1.0..=1.0).contains(&row.score)));
        Ok(())
    }

    #[test]
    fn empty_library_query_fails_with_empty_index() -> Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("broken.jpg"), b"nope")?;
        std::fs::write(temp.path().join("notes.txt"), b"hello")?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());

        let index = library.build()?;
        assert!(index.is_empty());
        assert!(matches!(
            library.query(&index, "AI", None, 3),
            Err(EngineError::EmptyIndex)
        ));
        Ok(())
    }

    #[test]
    fn blank_topic_is_invalid_input() -> Result<()> {
        let temp = tempfile::tempdir()?;
        sample_library(temp.path())?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());
        let index = library.build()?;
        assert!(matches!(
            library.query(&index, "   ", None, 3),
            Err(EngineError::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn rebuild_is_reproducible_and_snapshot_reloads() -> Result<()> {
        let temp = tempfile::tempdir()?;
        sample_library(temp.path())?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());

        let first = library.build()?;
        let second = library.build()?;
        assert_eq!(first, second);

        let loaded = library.load_or_create()?;
        assert_eq!(loaded, first);
        assert!(library.snapshot_path().ends_with(SNAPSHOT_FILE_NAME));
        Ok(())
    }

    #[test]
    fn load_or_create_never_builds() -> Result<()> {
        let temp = tempfile::tempdir()?;
        sample_library(temp.path())?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());
        let index = library.load_or_create()?;
        assert!(index.is_empty());
        assert!(!library.snapshot_path().exists());
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_is_an_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());
        std::fs::write(library.snapshot_path(), "{broken")?;
        assert!(matches!(
            library.load_or_create(),
            Err(EngineError::Snapshot(_))
        ));
        Ok(())
    }

    #[test]
    fn query_dimension_must_match_index() -> Result<()> {
        let temp = tempfile::tempdir()?;
        sample_library(temp.path())?;
        let index = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::new(8)).build()?;
        let other = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::new(12));
        assert!(matches!(
            other.query(&index, "AI", None, 1),
            Err(EngineError::DimensionMismatch {
                expected: 8,
                actual: 12
            })
        ));
        Ok(())
    }

    #[test]
    fn import_copies_renames_and_reindexes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("library");
        let incoming = temp.path().join("incoming");
        write_png(&root.join("Gaming").join("clip.png"), [1, 1, 1])?;
        write_png(&incoming.join("clip.png"), [2, 2, 2])?;
        std::fs::write(incoming.join("readme.txt"), b"text")?;

        let events_path = temp.path().join("events.jsonl");
        let library = ThumbnailLibrary::new(&root, DryrunEmbedder::default())
            .with_events(EventWriter::new(&events_path, "session-1"));
        let report = library.import(
            &[incoming.join("clip.png"), incoming.join("readme.txt")],
            Some("Gaming"),
        )?;

        assert_eq!(report.imported.len(), 1);
        let copied = &report.imported[0];
        assert_ne!(copied, &root.join("Gaming").join("clip.png"));
        assert!(copied
            .file_name()
            .map(|name| name.to_string_lossy().starts_with("clip_"))
            .unwrap_or(false));
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.index.len(), 2);
        assert_eq!(report.index.entries_in(Some("Gaming")).len(), 2);

        let types: Vec<String> = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert!(types.contains(&"index_built".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("import_completed"));
        Ok(())
    }

    #[test]
    fn import_rejects_nested_category_names() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let library = ThumbnailLibrary::new(temp.path(), DryrunEmbedder::default());
        let result = library.import(&[PathBuf::from("x.png")], Some("../escape"));
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn query_text_includes_point_of_view_when_present() {
        assert_eq!(query_text("AI", None), "thumbnail about AI");
        assert_eq!(query_text("AI", Some("  ")), "thumbnail about AI");
        assert_eq!(
            query_text(" AI ", Some("a skeptic")),
            "thumbnail about AI from a skeptic perspective"
        );
    }
}
