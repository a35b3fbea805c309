//! Shared state threaded through one pipeline run.

use crate::config::BuildConfig;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One of the six fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Resolver,
    Transformer,
    Bundler,
    Optimizer,
    CssOptimizer,
    Outputter,
}

impl StepKind {
    /// Every step, in the order the executor runs them.
    pub const ALL: [StepKind; 6] = [
        StepKind::Resolver,
        StepKind::Transformer,
        StepKind::Bundler,
        StepKind::Optimizer,
        StepKind::CssOptimizer,
        StepKind::Outputter,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolver => "resolver",
            Self::Transformer => "transformer",
            Self::Bundler => "bundler",
            Self::Optimizer => "optimizer",
            Self::CssOptimizer => "css-optimizer",
            Self::Outputter => "outputter",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First-party modules reachable from the entries: file → relative imports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleGraph {
    modules: BTreeMap<PathBuf, Vec<PathBuf>>,
}

impl ModuleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: PathBuf, imports: Vec<PathBuf>) {
        self.modules.insert(file, imports);
    }

    #[must_use]
    pub fn contains(&self, file: &Path) -> bool {
        self.modules.contains_key(file)
    }

    #[must_use]
    pub fn imports_of(&self, file: &Path) -> &[PathBuf] {
        self.modules.get(file).map_or(&[], Vec::as_slice)
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.modules.keys().map(PathBuf::as_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// What produced a file in the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    Entry,
    Expose,
    RemoteEntry,
    SourceMap,
}

/// A file the Bundler wrote, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub name: String,
    pub file: PathBuf,
    pub kind: ChunkKind,
    pub bytes: u64,
}

/// A chunk after optimization, with its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedChunk {
    pub file: PathBuf,
    pub bytes: u64,
    pub hash: String,
}

/// One entry of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub bytes: u64,
    pub hash: String,
}

/// Every file in the output directory, keyed by `/`-separated relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub files: BTreeMap<String, ManifestEntry>,
}

/// Mutable state for one pipeline run.
///
/// Each field has a single owning step. Setters fail with
/// [`Error::StepContract`] when called while any other step is running, so a
/// step can extend the context but never rewrite what an earlier step
/// produced.
#[derive(Debug)]
pub struct BuildContext {
    config: Arc<BuildConfig>,
    current: Option<StepKind>,
    entry_points: BTreeMap<String, PathBuf>,
    exposes: BTreeMap<String, PathBuf>,
    module_graph: ModuleGraph,
    transformed: BTreeMap<PathBuf, String>,
    chunks: Vec<ChunkDescriptor>,
    cache_key: Option<String>,
    cache_hit: bool,
    optimized: Vec<OptimizedChunk>,
    css: Vec<OptimizedChunk>,
    manifest: Option<FileManifest>,
    completed: Vec<StepKind>,
}

impl BuildContext {
    #[must_use]
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config: Arc::new(config),
            current: None,
            entry_points: BTreeMap::new(),
            exposes: BTreeMap::new(),
            module_graph: ModuleGraph::new(),
            transformed: BTreeMap::new(),
            chunks: Vec::new(),
            cache_key: None,
            cache_hit: false,
            optimized: Vec::new(),
            css: Vec::new(),
            manifest: None,
            completed: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<BuildConfig> {
        &self.config
    }

    /// The step currently running, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<StepKind> {
        self.current
    }

    /// Steps that finished, in order.
    #[must_use]
    pub fn completed(&self) -> &[StepKind] {
        &self.completed
    }

    pub(crate) fn begin(&mut self, step: StepKind) {
        self.current = Some(step);
    }

    pub(crate) fn finish(&mut self, step: StepKind) {
        self.completed.push(step);
        self.current = None;
    }

    fn claim(&self, owner: StepKind, field: &'static str) -> Result<(), Error> {
        if self.current == Some(owner) {
            Ok(())
        } else {
            Err(Error::StepContract {
                step: self.current.map_or("executor", |s| s.as_str()),
                field,
            })
        }
    }

    // Resolver

    #[must_use]
    pub fn entry_points(&self) -> &BTreeMap<String, PathBuf> {
        &self.entry_points
    }

    /// Federation expose key → module file.
    #[must_use]
    pub fn exposes(&self) -> &BTreeMap<String, PathBuf> {
        &self.exposes
    }

    #[must_use]
    pub fn module_graph(&self) -> &ModuleGraph {
        &self.module_graph
    }

    pub fn set_entry_points(&mut self, entries: BTreeMap<String, PathBuf>) -> Result<(), Error> {
        self.claim(StepKind::Resolver, "entry_points")?;
        self.entry_points = entries;
        Ok(())
    }

    pub fn set_exposes(&mut self, exposes: BTreeMap<String, PathBuf>) -> Result<(), Error> {
        self.claim(StepKind::Resolver, "exposes")?;
        self.exposes = exposes;
        Ok(())
    }

    pub fn set_module_graph(&mut self, graph: ModuleGraph) -> Result<(), Error> {
        self.claim(StepKind::Resolver, "module_graph")?;
        self.module_graph = graph;
        Ok(())
    }

    // Transformer

    #[must_use]
    pub fn transformed(&self) -> &BTreeMap<PathBuf, String> {
        &self.transformed
    }

    pub fn set_transformed(&mut self, transformed: BTreeMap<PathBuf, String>) -> Result<(), Error> {
        self.claim(StepKind::Transformer, "transformed")?;
        self.transformed = transformed;
        Ok(())
    }

    // Bundler

    #[must_use]
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    #[must_use]
    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    /// Whether the Bundler found this build's outputs in the artifact cache.
    #[must_use]
    pub fn cache_hit(&self) -> bool {
        self.cache_hit
    }

    pub fn set_chunks(&mut self, chunks: Vec<ChunkDescriptor>) -> Result<(), Error> {
        self.claim(StepKind::Bundler, "chunks")?;
        self.chunks = chunks;
        Ok(())
    }

    pub fn set_cache(&mut self, key: String, hit: bool) -> Result<(), Error> {
        self.claim(StepKind::Bundler, "cache_key")?;
        self.cache_key = Some(key);
        self.cache_hit = hit;
        Ok(())
    }

    // Optimizer

    #[must_use]
    pub fn optimized(&self) -> &[OptimizedChunk] {
        &self.optimized
    }

    pub fn set_optimized(&mut self, optimized: Vec<OptimizedChunk>) -> Result<(), Error> {
        self.claim(StepKind::Optimizer, "optimized")?;
        self.optimized = optimized;
        Ok(())
    }

    // CssOptimizer

    #[must_use]
    pub fn css(&self) -> &[OptimizedChunk] {
        &self.css
    }

    pub fn set_css(&mut self, css: Vec<OptimizedChunk>) -> Result<(), Error> {
        self.claim(StepKind::CssOptimizer, "css")?;
        self.css = css;
        Ok(())
    }

    // Outputter

    #[must_use]
    pub fn manifest(&self) -> Option<&FileManifest> {
        self.manifest.as_ref()
    }

    pub fn set_manifest(&mut self, manifest: FileManifest) -> Result<(), Error> {
        self.claim(StepKind::Outputter, "manifest")?;
        self.manifest = Some(manifest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_may_write() {
        let mut ctx = BuildContext::new(BuildConfig::new("/tmp/app"));
        ctx.begin(StepKind::Transformer);
        ctx.set_transformed(BTreeMap::from([(PathBuf::from("/a.js"), "x".to_string())]))
            .unwrap();
        ctx.finish(StepKind::Transformer);

        assert_eq!(ctx.transformed().len(), 1);
        assert_eq!(ctx.completed(), &[StepKind::Transformer]);
        assert_eq!(ctx.current_step(), None);
    }

    #[test]
    fn test_other_step_may_not_write() {
        let mut ctx = BuildContext::new(BuildConfig::new("/tmp/app"));
        ctx.begin(StepKind::Optimizer);
        let err = ctx.set_chunks(Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::StepContract {
                step: "optimizer",
                field: "chunks"
            }
        ));
    }

    #[test]
    fn test_writes_outside_a_step_are_rejected() {
        let mut ctx = BuildContext::new(BuildConfig::new("/tmp/app"));
        let err = ctx.set_manifest(FileManifest::default()).unwrap_err();
        assert_eq!(err.to_string(), "Step executor may not write manifest");
    }

    #[test]
    fn test_step_order_and_names() {
        let names: Vec<_> = StepKind::ALL.iter().map(StepKind::as_str).collect();
        assert_eq!(
            names,
            [
                "resolver",
                "transformer",
                "bundler",
                "optimizer",
                "css-optimizer",
                "outputter"
            ]
        );
        assert!(StepKind::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_module_graph() {
        let mut graph = ModuleGraph::new();
        graph.insert(PathBuf::from("/src/main.js"), vec![PathBuf::from("/src/a.js")]);
        graph.insert(PathBuf::from("/src/a.js"), Vec::new());

        assert_eq!(graph.len(), 2);
        assert!(graph.contains(Path::new("/src/a.js")));
        assert_eq!(graph.imports_of(Path::new("/src/main.js")).len(), 1);
        assert!(graph.imports_of(Path::new("/missing.js")).is_empty());
    }
}
