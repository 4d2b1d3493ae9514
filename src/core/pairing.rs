//! Classifies files as archives or previews and pairs them by file stem.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::PairingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Archive,
    Preview,
    Other,
}

/// An archive and its preview image, matched by stem within one directory.
/// Either side may be missing for unpaired files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilePair {
    pub stem: String,
    pub directory: PathBuf,
    pub archive: Option<PathBuf>,
    pub preview: Option<PathBuf>,
}

impl FilePair {
    pub fn new(archive: Option<PathBuf>, preview: Option<PathBuf>) -> Self {
        let reference = archive
            .as_deref()
            .or(preview.as_deref())
            .unwrap_or_else(|| Path::new(""));
        Self {
            stem: stem_of(reference),
            directory: reference
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            archive,
            preview,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.archive.is_some() && self.preview.is_some()
    }

    /// All files of the pair, archive first.
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.archive.iter().chain(self.preview.iter())
    }

    /// Path used to identify the pair in summaries.
    pub fn display_path(&self) -> PathBuf {
        self.archive
            .clone()
            .or_else(|| self.preview.clone())
            .unwrap_or_else(|| self.directory.join(&self.stem))
    }
}

/// Result of pairing a set of files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub root: PathBuf,
    pub pairs: Vec<FilePair>,
    pub archives_only: usize,
    pub previews_only: usize,
    pub ignored: usize,
}

impl ScanReport {
    pub fn complete_pairs(&self) -> usize {
        self.pairs.iter().filter(|p| p.is_complete()).count()
    }
}

/// Extension-based classification, case-insensitive.
#[derive(Debug, Clone)]
pub struct Classifier {
    archives: HashSet<String>,
    previews: HashSet<String>,
}

impl Classifier {
    pub fn new(config: &PairingConfig) -> Self {
        let normalize = |exts: &[String]| {
            exts.iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect::<HashSet<_>>()
        };
        Self {
            archives: normalize(&config.archive_extensions),
            previews: normalize(&config.preview_extensions),
        }
    }

    pub fn classify(&self, path: &Path) -> FileKind {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return FileKind::Other;
        };
        let ext = ext.to_lowercase();
        if self.archives.contains(&ext) {
            FileKind::Archive
        } else if self.previews.contains(&ext) {
            FileKind::Preview
        } else {
            FileKind::Other
        }
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Incrementally pairs classified files.
///
/// Files are grouped by `(directory, lowercase stem)`. A second archive or
/// preview for a key that already has one starts a new, separate entry.
#[derive(Debug, Default)]
pub struct Pairer {
    slots: BTreeMap<(PathBuf, String), Vec<FilePair>>,
}

impl Pairer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: PathBuf, kind: FileKind) {
        if kind == FileKind::Other {
            return;
        }
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let key = (directory, stem_of(&path).to_lowercase());
        let slot = self.slots.entry(key).or_default();

        let is_archive = kind == FileKind::Archive;
        if let Some(pair) = slot.iter_mut().find(|pair| {
            if is_archive {
                pair.archive.is_none()
            } else {
                pair.preview.is_none()
            }
        }) {
            if is_archive {
                pair.archive = Some(path);
            } else {
                pair.preview = Some(path);
            }
            return;
        }

        if is_archive {
            slot.push(FilePair::new(Some(path), None));
        } else {
            slot.push(FilePair::new(None, Some(path)));
        }
    }

    /// Pairs in directory/stem order.
    pub fn into_pairs(self) -> Vec<FilePair> {
        self.slots.into_values().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&PairingConfig::default())
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        let c = classifier();
        assert_eq!(c.classify(Path::new("/a/b.ZIP")), FileKind::Archive);
        assert_eq!(c.classify(Path::new("/a/b.cbz")), FileKind::Archive);
        assert_eq!(c.classify(Path::new("/a/b.Jpg")), FileKind::Preview);
        assert_eq!(c.classify(Path::new("/a/b.txt")), FileKind::Other);
        assert_eq!(c.classify(Path::new("/a/noext")), FileKind::Other);
    }

    #[test]
    fn test_pairs_by_stem_within_directory() {
        let c = classifier();
        let mut pairer = Pairer::new();
        for p in [
            "/lib/one.zip",
            "/lib/one.jpg",
            "/lib/two.rar",
            "/lib/three.png",
            "/other/one.jpg",
        ] {
            let path = PathBuf::from(p);
            let kind = c.classify(&path);
            pairer.add(path, kind);
        }

        let pairs = pairer.into_pairs();
        assert_eq!(pairs.len(), 4);

        let one = pairs
            .iter()
            .find(|p| p.stem == "one" && p.directory == Path::new("/lib"))
            .unwrap();
        assert!(one.is_complete());
        assert_eq!(one.files().count(), 2);

        let two = pairs.iter().find(|p| p.stem == "two").unwrap();
        assert_eq!(two.archive, Some(PathBuf::from("/lib/two.rar")));
        assert_eq!(two.preview, None);

        let other_one = pairs
            .iter()
            .find(|p| p.directory == Path::new("/other"))
            .unwrap();
        assert!(!other_one.is_complete());
    }

    #[test]
    fn test_stem_match_ignores_case() {
        let mut pairer = Pairer::new();
        pairer.add(PathBuf::from("/lib/Holiday.zip"), FileKind::Archive);
        pairer.add(PathBuf::from("/lib/holiday.webp"), FileKind::Preview);
        let pairs = pairer.into_pairs();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].is_complete());
    }

    #[test]
    fn test_display_path_prefers_archive() {
        let pair = FilePair::new(
            Some(PathBuf::from("/x/a.zip")),
            Some(PathBuf::from("/x/a.png")),
        );
        assert_eq!(pair.display_path(), PathBuf::from("/x/a.zip"));
        assert_eq!(pair.stem, "a");
        assert_eq!(pair.directory, PathBuf::from("/x"));
    }
}
