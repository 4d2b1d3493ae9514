use std::path::{Path, PathBuf};

use crate::config::ThumbnailFormat;

/// Rendering parameters that are part of every cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodeParams {
    pub format: ThumbnailFormat,
    pub quality: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub params: EncodeParams,
}

impl CacheKey {
    pub fn new(path: &Path, width: u32, height: u32, params: EncodeParams) -> Self {
        Self::from_normalized(normalize_path(path), width, height, params)
    }

    pub(crate) fn from_normalized(
        path: PathBuf,
        width: u32,
        height: u32,
        params: EncodeParams,
    ) -> Self {
        Self {
            path,
            width,
            height,
            params,
        }
    }
}

/// Canonical path when the file exists, otherwise the lexical absolute path.
pub fn normalize_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
