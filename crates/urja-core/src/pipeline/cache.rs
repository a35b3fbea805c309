//! Build-artifact cache.
//!
//! A cache entry lives at `<root>/node_modules/.urja/build/<key>/` and holds a
//! copy of every chunk file under `files/` plus `index.json` listing the
//! chunks the Bundler produced. The key covers everything that shapes the
//! output, so an entry is never updated in place.

use super::context::ChunkDescriptor;
use crate::config::BuildConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use urja_util::fs::{atomic_write, write_creating_dirs};
use urja_util::hash::ContentHasher;
use walkdir::WalkDir;

/// Cache location relative to the project root.
pub const BUILD_CACHE_DIR: &str = "node_modules/.urja/build";

const INDEX_FILE: &str = "index.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    key: String,
    chunks: Vec<ChunkDescriptor>,
}

/// Content-addressed store of previous build outputs.
#[derive(Debug, Clone)]
pub struct BuildCache {
    dir: PathBuf,
}

impl BuildCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache for `config`'s project.
    #[must_use]
    pub fn for_project(config: &BuildConfig) -> Self {
        Self::new(config.root.join(BUILD_CACHE_DIR))
    }

    /// Key over the build options, the engine and every module's transformed source.
    #[must_use]
    pub fn key(
        config: &BuildConfig,
        engine: &str,
        modules: &BTreeMap<PathBuf, String>,
    ) -> String {
        let mut hasher = ContentHasher::new();
        hasher
            .update_str(engine)
            .update_str(config.mode.as_str())
            .update_str(config.platform.as_str())
            .update_str(&config.out_dir)
            .update_str(if config.minify() { "minify" } else { "" })
            .update_str(if config.sourcemap() { "sourcemap" } else { "" })
            .update_str(if config.css_minify() { "css-minify" } else { "" })
            .update_str(&config.entry.join("\n"));
        if let Some(federation) = &config.federation {
            hasher.update_str(&serde_json::to_string(federation).unwrap_or_default());
        }
        for (path, code) in modules {
            let rel = path.strip_prefix(&config.root).unwrap_or(path);
            hasher
                .update_str(&rel.to_string_lossy())
                .update_str(code);
        }
        hasher.finish_short()
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Cached copy of `relative` for `key`.
    #[must_use]
    pub fn cached_file(&self, key: &str, relative: &Path) -> PathBuf {
        self.entry_dir(key).join(FILES_DIR).join(relative)
    }

    /// Chunks recorded for `key`, if a complete entry exists.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Vec<ChunkDescriptor>> {
        let content = std::fs::read_to_string(self.entry_dir(key).join(INDEX_FILE)).ok()?;
        let index: CacheIndex = serde_json::from_str(&content).ok()?;
        let complete = index
            .chunks
            .iter()
            .all(|chunk| self.cached_file(key, &chunk.file).is_file());
        (index.key == key && complete).then_some(index.chunks)
    }

    /// Copy the chunk files from `out_dir` into the entry for `key`.
    ///
    /// The index is written last so a partially stored entry is never a hit.
    pub fn store(&self, key: &str, out_dir: &Path, chunks: &[ChunkDescriptor]) -> io::Result<()> {
        for chunk in chunks {
            let bytes = std::fs::read(out_dir.join(&chunk.file))?;
            write_creating_dirs(&self.cached_file(key, &chunk.file), &bytes)?;
        }

        let index = CacheIndex {
            key: key.to_string(),
            chunks: chunks.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&index).map_err(io::Error::other)?;
        atomic_write(&self.entry_dir(key).join(INDEX_FILE), &json)
    }

    /// Copy the cached `chunks` of `key` into `out_dir`.
    pub fn restore(&self, key: &str, out_dir: &Path, chunks: &[ChunkDescriptor]) -> io::Result<()> {
        for chunk in chunks {
            let bytes = std::fs::read(self.cached_file(key, &chunk.file))?;
            write_creating_dirs(&out_dir.join(&chunk.file), &bytes)?;
        }
        Ok(())
    }
}

/// Files under `dir`, relative to it, in sorted order.
pub(crate) fn relative_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect()
}
