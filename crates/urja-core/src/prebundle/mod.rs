//! Dependency pre-bundling.
//!
//! Third-party packages are converted into browser-loadable ES modules and
//! cached under `node_modules/.urja`, keyed by a short hash of the project's
//! `package.json`. CommonJS packages get a proxy module that re-exports
//! every named property of `module.exports`; packages whose shape cannot be
//! read get a plain re-export proxy.
//!
//! Pre-bundled deps are served at `/@urja-deps/{file}` URLs.

pub mod shape;

pub use shape::{
    ChainAdapter, CjsLexerAdapter, KnownExportsAdapter, ModuleShape, ShapeAdapter, ShapeError,
};

use crate::config::Platform;
use crate::engine::{
    BundleInput, BundleRequest, BundleTarget, Engine, Loader, ModuleFormat, JSX_IMPORT_SOURCE,
    JSX_RUNTIME_MODULE,
};
use crate::error::Error;
use crate::imports::{is_bare_specifier, package_name, scan_relative, scan_specifiers};
use crate::resolver::{resolve_package, resolve_relative};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use urja_util::fs::atomic_write;
use urja_util::hash::short_hash;

/// Cache directory relative to the project root.
pub const CACHE_DIR: &str = "node_modules/.urja";

/// URL prefix pre-bundled deps are served under.
pub const DEPS_URL_PREFIX: &str = "/@urja-deps/";

/// Metadata file inside the cache directory.
pub const METADATA_FILE: &str = "_metadata.json";

/// Persisted state of a cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Short hash of the `package.json` that produced the cache.
    pub hash: String,
    /// Successfully bundled specifiers.
    pub deps: Vec<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// One pre-bundled dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCacheEntry {
    pub specifier: String,
    /// Manifest hash the output was produced under.
    pub hash: String,
    pub output: PathBuf,
    pub timestamp: i64,
}

impl DependencyCacheEntry {
    /// URL the dev server serves this entry at.
    pub fn url(&self) -> String {
        format!("{DEPS_URL_PREFIX}{}", cache_file_name(&self.specifier))
    }
}

/// A dependency that could not be pre-bundled. Never aborts a batch.
#[derive(Error, Debug)]
#[error("Failed to pre-bundle '{specifier}': {reason}")]
pub struct DependencyBundleError {
    pub specifier: String,
    pub reason: String,
}

/// Outcome of one pre-bundle pass.
#[derive(Debug, Default)]
pub struct PreBundleResult {
    /// Built during this pass.
    pub bundled: Vec<DependencyCacheEntry>,
    /// Reused from an earlier pass.
    pub cache_hits: Vec<DependencyCacheEntry>,
    pub failed: Vec<DependencyBundleError>,
}

impl PreBundleResult {
    /// Whether no bundling work was done.
    pub fn is_cache_hit(&self) -> bool {
        self.bundled.is_empty() && self.failed.is_empty()
    }

    /// Specifier → servable URL, for cache hits and fresh bundles alike.
    pub fn servable_map(&self) -> BTreeMap<String, String> {
        self.cache_hits
            .iter()
            .chain(&self.bundled)
            .map(|e| (e.specifier.clone(), e.url()))
            .collect()
    }

    /// Every entry, cache hits first.
    pub fn entries(&self) -> impl Iterator<Item = &DependencyCacheEntry> {
        self.cache_hits.iter().chain(&self.bundled)
    }
}

/// File name of a specifier's cached output (`react-dom/client` → `react-dom_client.js`).
pub fn cache_file_name(specifier: &str) -> String {
    format!("{}.js", specifier.replace('/', "_"))
}

/// Proxy that re-exports a CommonJS module's properties as ESM.
pub fn proxy_source(resolved_path: &Path, shape: &ModuleShape) -> String {
    let path = resolved_path
        .display()
        .to_string()
        .replace('\\', "/")
        .replace('\'', "\\'");
    let mut out = if shape.has_default {
        format!("import mod from '{path}';\nexport default mod;\n")
    } else {
        format!("import * as mod from '{path}';\n")
    };
    for key in &shape.named_keys {
        out.push_str(&format!("export const {key} = mod.{key};\n"));
    }
    out
}

/// Proxy for packages whose shape is unknown (ES modules).
pub fn fallback_proxy_source(specifier: &str) -> String {
    format!("export * from '{specifier}'; export {{ default }} from '{specifier}';")
}

/// Dependency pre-bundler.
pub struct DependencyPreBundler {
    root: PathBuf,
    cache_dir: PathBuf,
    engine: Arc<dyn Engine>,
    shapes: Arc<dyn ShapeAdapter>,
}

impl DependencyPreBundler {
    /// Create a pre-bundler caching under `<root>/node_modules/.urja`.
    pub fn new(root: impl Into<PathBuf>, engine: Arc<dyn Engine>) -> Self {
        let root = root.into();
        let cache_dir = root.join(CACHE_DIR);
        Self {
            root,
            cache_dir,
            engine,
            shapes: Arc::new(ChainAdapter::standard()),
        }
    }

    /// Use a different cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    #[must_use]
    pub fn with_shape_adapter(mut self, shapes: Arc<dyn ShapeAdapter>) -> Self {
        self.shapes = shapes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cached output path of a specifier.
    pub fn output_path(&self, specifier: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(specifier))
    }

    /// Short hash of the project's `package.json`.
    pub fn manifest_hash(&self) -> Result<String, Error> {
        let path = self.root.join("package.json");
        let bytes = std::fs::read(&path).map_err(|source| Error::ManifestRead { path, source })?;
        Ok(short_hash(&bytes))
    }

    /// Read the cache metadata; a missing or corrupt file reads as `None`.
    pub fn read_metadata(&self) -> Option<CacheMetadata> {
        let content = std::fs::read_to_string(self.cache_dir.join(METADATA_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    async fn load_manifest_hash(&self) -> Result<String, Error> {
        let path = self.root.join("package.json");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| Error::ManifestRead { path, source })?;
        Ok(short_hash(&bytes))
    }

    async fn load_metadata(&self) -> Option<CacheMetadata> {
        let content = tokio::fs::read_to_string(self.cache_dir.join(METADATA_FILE))
            .await
            .ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Bare imports of one file.
    ///
    /// Each bare specifier contributes its package name; a subpath import is
    /// also recorded verbatim so it gets its own proxy.
    pub fn scan_dependencies(&self, entry: &Path) -> Result<Vec<String>, Error> {
        let source = std::fs::read_to_string(entry)?;
        let mut deps = Vec::new();
        let mut seen = HashSet::new();
        collect_bare(&source, &mut deps, &mut seen);
        collect_jsx_runtime(entry, &mut deps, &mut seen);
        Ok(deps)
    }

    /// Bare imports of `entries` and every file they reach through relative imports.
    pub fn scan_recursive(&self, entries: &[PathBuf]) -> Vec<String> {
        scan_bare_imports(entries)
    }

    /// Pre-bundle `deps`, reusing the cache while the manifest hash is unchanged.
    ///
    /// The cache is used only when the hash matches and every requested
    /// dependency has an output file; otherwise every requested dependency
    /// is rebuilt. Dependencies are bundled concurrently. A dependency that
    /// fails is logged and reported in [`PreBundleResult::failed`]; the
    /// others are unaffected. Metadata is written after every dependency
    /// has settled.
    pub async fn pre_bundle(&self, deps: &[String]) -> Result<PreBundleResult, Error> {
        let hash = self.load_manifest_hash().await?;
        let mut requested = Vec::new();
        for dep in deps {
            if !requested.contains(&dep.as_str()) {
                requested.push(dep.as_str());
            }
        }

        if let Some(meta) = self.load_metadata().await.filter(|m| m.hash == hash) {
            if let Some(hits) = self.cached_entries(&requested, &meta).await {
                info!(count = hits.len(), "using cached pre-bundled dependencies");
                return Ok(PreBundleResult {
                    cache_hits: hits,
                    ..PreBundleResult::default()
                });
            }
        }

        info!(
            count = requested.len(),
            engine = self.engine.name(),
            "pre-bundling dependencies"
        );
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let outcomes = join_all(
            requested
                .iter()
                .map(|dep| self.bundle_one(dep, &hash, timestamp)),
        )
        .await;

        let mut result = PreBundleResult::default();
        for outcome in outcomes {
            match outcome {
                Ok(entry) => {
                    info!(dep = %entry.specifier, "pre-bundled");
                    result.bundled.push(entry);
                }
                Err(e) => {
                    warn!(dep = %e.specifier, error = %e.reason, "failed to pre-bundle");
                    result.failed.push(e);
                }
            }
        }

        let metadata = CacheMetadata {
            hash,
            deps: result.bundled.iter().map(|e| e.specifier.clone()).collect(),
            timestamp,
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| Error::other(format!("Failed to serialize cache metadata: {e}")))?;
        atomic_write(&self.cache_dir.join(METADATA_FILE), &json)?;

        Ok(result)
    }

    /// Entries for `requested` when every one has an output file.
    async fn cached_entries(
        &self,
        requested: &[&str],
        meta: &CacheMetadata,
    ) -> Option<Vec<DependencyCacheEntry>> {
        let mut hits = Vec::with_capacity(requested.len());
        for dep in requested {
            let output = self.output_path(dep);
            let present = tokio::fs::metadata(&output)
                .await
                .is_ok_and(|m| m.is_file());
            if !present {
                debug!(dep, "cached output missing");
                return None;
            }
            hits.push(DependencyCacheEntry {
                specifier: (*dep).to_string(),
                hash: meta.hash.clone(),
                output,
                timestamp: meta.timestamp,
            });
        }
        Some(hits)
    }

    /// Proxy module for `dep`.
    ///
    /// Resolution and shape detection read the package from disk, so they
    /// run on the blocking pool. A package the resolver cannot locate gets
    /// the re-export proxy and is left for the engine to resolve.
    async fn proxy_for(&self, dep: &str) -> Result<String, String> {
        let root = self.root.clone();
        let shapes = Arc::clone(&self.shapes);
        let specifier = dep.to_string();
        tokio::task::spawn_blocking(move || {
            let resolved = match resolve_package(&root, &specifier) {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!(dep = %specifier, reason = %e, "unresolved, using re-export proxy");
                    return fallback_proxy_source(&specifier);
                }
            };
            match shapes.shape(&resolved) {
                Ok(shape) => {
                    debug!(dep = %specifier, exports = shape.named_keys.len(), "generated proxy");
                    proxy_source(&resolved.path, &shape)
                }
                Err(e) => {
                    debug!(dep = %specifier, reason = %e, "using re-export proxy");
                    fallback_proxy_source(&specifier)
                }
            }
        })
        .await
        .map_err(|e| format!("proxy generation panicked: {e}"))
    }

    async fn bundle_one(
        &self,
        dep: &str,
        hash: &str,
        timestamp: i64,
    ) -> Result<DependencyCacheEntry, DependencyBundleError> {
        let fail = |reason: String| DependencyBundleError {
            specifier: dep.to_string(),
            reason,
        };

        let proxy = self.proxy_for(dep).await.map_err(fail)?;
        let output = self.output_path(dep);
        let mut request = BundleRequest::new(
            BundleInput::Stdin {
                contents: proxy,
                resolve_dir: self.root.clone(),
                sourcefile: cache_file_name(dep),
            },
            BundleTarget::Outfile(output.clone()),
        );
        request.format = ModuleFormat::Esm;
        request.platform = Platform::Browser;
        request.sourcemap = true;
        request.minify = false;
        request
            .define
            .insert("process.env.NODE_ENV".to_string(), "\"development\"".to_string());
        request
            .define
            .insert("global".to_string(), "globalThis".to_string());

        self.engine
            .bundle(&request)
            .await
            .map_err(|e| fail(e.to_string()))?;

        Ok(DependencyCacheEntry {
            specifier: dep.to_string(),
            hash: hash.to_string(),
            output,
            timestamp,
        })
    }
}

/// Bare imports of `entries` and every file they reach through relative imports.
///
/// Reads from disk synchronously; async callers run it on the blocking pool.
pub fn scan_bare_imports(entries: &[PathBuf]) -> Vec<String> {
    let mut deps = Vec::new();
    let mut seen = HashSet::new();
    let mut visited = HashSet::new();
    let mut queue: Vec<PathBuf> = entries.to_vec();

    while let Some(path) = queue.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }
        let Ok(source) = std::fs::read_to_string(&path) else {
            debug!(path = %path.display(), "skipping unreadable file during scan");
            continue;
        };
        collect_bare(&source, &mut deps, &mut seen);
        collect_jsx_runtime(&path, &mut deps, &mut seen);
        for spec in scan_relative(&source) {
            if let Ok(next) = resolve_relative(&path, &spec) {
                queue.push(next);
            }
        }
    }
    deps
}

/// Compiled JSX imports its helpers, so a JSX file depends on the runtime.
fn collect_jsx_runtime(path: &Path, deps: &mut Vec<String>, seen: &mut HashSet<String>) {
    if !Loader::from_path(path).is_some_and(|l| l.is_jsx()) {
        return;
    }
    for spec in [JSX_IMPORT_SOURCE, JSX_RUNTIME_MODULE] {
        if seen.insert(spec.to_string()) {
            deps.push(spec.to_string());
        }
    }
}

fn collect_bare(source: &str, deps: &mut Vec<String>, seen: &mut HashSet<String>) {
    for spec in scan_specifiers(source) {
        if !is_bare_specifier(&spec) {
            continue;
        }
        let name = package_name(&spec).to_string();
        if seen.insert(name.clone()) {
            deps.push(name);
        }
        if spec.len() > package_name(&spec).len() && seen.insert(spec.clone()) {
            deps.push(spec);
        }
    }
}
