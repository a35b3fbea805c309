//! Built-in pipeline steps.

use super::cache::{relative_files, BuildCache};
use super::context::{
    BuildContext, ChunkDescriptor, ChunkKind, FileManifest, ManifestEntry, ModuleGraph,
    OptimizedChunk,
};
use super::Step;
use crate::css::optimize_css;
use crate::engine::{BundleInput, BundleRequest, BundleTarget, Engine, EngineError, Loader};
use crate::error::Error;
use crate::federation::{expose_chunk_name, remote_entry_source, FederationPlugin};
use crate::imports::scan_relative;
use crate::plugin::{PluginChain, TransformPlugin};
use crate::resolver::{resolve_relative, ResolveError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use urja_util::fs::write_creating_dirs;
use urja_util::hash::short_hash;

/// Chunks above this size are reported.
pub const CHUNK_SIZE_WARNING: u64 = 500 * 1024;

/// Written by the Outputter into the output directory.
pub const MANIFEST_FILE: &str = "manifest.json";

fn canonical(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `/`-separated form of a relative path, stable across platforms.
fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolves entries and walks relative imports into the module graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverStep;

#[async_trait]
impl Step for ResolverStep {
    fn name(&self) -> &'static str {
        "resolver"
    }

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let config = Arc::clone(ctx.config());
        let exposes_config = config
            .federation
            .as_ref()
            .map(|f| f.exposes.clone())
            .unwrap_or_default();
        if config.entry.is_empty() && exposes_config.is_empty() {
            return Err(ResolveError::NoEntries.into());
        }

        let locate = |specifier: &str| -> Result<PathBuf, ResolveError> {
            let path = config.root.join(specifier);
            if path.is_file() {
                Ok(canonical(&path))
            } else {
                Err(ResolveError::NotFound {
                    specifier: specifier.to_string(),
                    from: config.root.clone(),
                })
            }
        };

        let mut entries = BTreeMap::new();
        for (i, entry) in config.entry.iter().enumerate() {
            entries.insert(format!("entry{i}"), locate(entry)?);
        }
        let mut exposes = BTreeMap::new();
        for (key, path) in &exposes_config {
            exposes.insert(key.clone(), locate(path)?);
        }

        let mut graph = ModuleGraph::new();
        let mut queue: VecDeque<PathBuf> =
            entries.values().chain(exposes.values()).cloned().collect();
        while let Some(file) = queue.pop_front() {
            if graph.contains(&file) {
                continue;
            }
            let imports = if Loader::from_path(&file) == Some(Loader::Css) {
                Vec::new()
            } else {
                let source = tokio::fs::read_to_string(&file).await?;
                let importer = file.clone();
                let imports = tokio::task::spawn_blocking(move || {
                    scan_relative(&source)
                        .iter()
                        .map(|specifier| {
                            resolve_relative(&importer, specifier).map(|p| canonical(&p))
                        })
                        .collect::<Result<Vec<_>, ResolveError>>()
                })
                .await
                .map_err(|e| Error::other(format!("Import resolution panicked: {e}")))??;
                queue.extend(imports.iter().cloned());
                imports
            };
            graph.insert(file, imports);
        }

        info!(
            entries = entries.len(),
            exposes = exposes.len(),
            modules = graph.len(),
            "resolved module graph"
        );
        ctx.set_entry_points(entries)?;
        ctx.set_exposes(exposes)?;
        ctx.set_module_graph(graph)
    }
}

/// Runs every graph module through the plugin chain.
///
/// Hosts get a [`FederationPlugin`] appended so remote imports become
/// `loadRemote` calls.
#[derive(Debug, Clone, Default)]
pub struct TransformerStep {
    plugins: PluginChain,
}

impl TransformerStep {
    #[must_use]
    pub fn new(plugins: PluginChain) -> Self {
        Self { plugins }
    }
}

#[async_trait]
impl Step for TransformerStep {
    fn name(&self) -> &'static str {
        "transformer"
    }

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let mut chain = self.plugins.clone();
        if let Some(federation) = ctx.config().federation.as_ref().filter(|f| f.is_host()) {
            let plugin: Arc<dyn TransformPlugin> = Arc::new(FederationPlugin::new(federation.clone()));
            chain.register(plugin);
        }

        let mut transformed = BTreeMap::new();
        for file in ctx.module_graph().files() {
            let source = tokio::fs::read_to_string(file).await?;
            let id = file.display().to_string();
            let code = chain.transform(&source, &id).map_err(|e| EngineError::Transform {
                file: id.clone(),
                message: e.to_string(),
            })?;
            transformed.insert(file.to_path_buf(), code);
        }

        debug!(modules = transformed.len(), plugins = ?chain.names(), "transformed modules");
        ctx.set_transformed(transformed)
    }
}

/// Bundles each entry and exposed module through the engine.
///
/// Consults the build-artifact cache first; on a hit the engine is not
/// called and the Outputter restores the cached files.
#[derive(Clone)]
pub struct BundlerStep {
    engine: Arc<dyn Engine>,
}

impl BundlerStep {
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    async fn bundle_module(
        &self,
        ctx: &BuildContext,
        source: &Path,
        outfile: PathBuf,
    ) -> Result<Vec<PathBuf>, Error> {
        let config = ctx.config();
        let contents = match ctx.transformed().get(source) {
            Some(code) => code.clone(),
            None => tokio::fs::read_to_string(source).await?,
        };

        let mut request = BundleRequest::new(
            BundleInput::Stdin {
                contents,
                resolve_dir: source.parent().map(Path::to_path_buf).unwrap_or_default(),
                sourcefile: source.display().to_string(),
            },
            BundleTarget::Outfile(outfile),
        );
        request.platform = config.platform;
        request.minify = config.minify();
        request.sourcemap = config.sourcemap();
        request.define.insert(
            "process.env.NODE_ENV".to_string(),
            format!("\"{}\"", config.mode.as_str()),
        );

        Ok(self.engine.bundle(&request).await?.files)
    }
}

impl std::fmt::Debug for BundlerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlerStep")
            .field("engine", &self.engine.name())
            .finish()
    }
}

fn describe(out_dir: &Path, name: &str, kind: ChunkKind, file: &Path) -> Result<ChunkDescriptor, Error> {
    let bytes = std::fs::metadata(file)?.len();
    let relative = file.strip_prefix(out_dir).unwrap_or(file).to_path_buf();
    let kind = if relative.extension().is_some_and(|e| e == "map") {
        ChunkKind::SourceMap
    } else {
        kind
    };
    Ok(ChunkDescriptor {
        name: name.to_string(),
        file: relative,
        kind,
        bytes,
    })
}

#[async_trait]
impl Step for BundlerStep {
    fn name(&self) -> &'static str {
        "bundler"
    }

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let config = Arc::clone(ctx.config());
        let cache = BuildCache::for_project(&config);
        let key = BuildCache::key(&config, self.engine.name(), ctx.transformed());

        if config.cache_enabled() {
            if let Some(chunks) = cache.lookup(&key) {
                info!(key = %key, chunks = chunks.len(), "build cache hit");
                ctx.set_cache(key, true)?;
                return ctx.set_chunks(chunks);
            }
        }

        let out_dir = config.out_path();
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut chunks = Vec::new();
        let mut used = BTreeSet::new();
        for (key_name, entry) in ctx.entry_points() {
            let stem = entry
                .file_stem()
                .map_or_else(|| key_name.clone(), |s| s.to_string_lossy().into_owned());
            let name = if used.insert(stem.clone()) {
                stem
            } else {
                key_name.clone()
            };
            let ext = if Loader::from_path(entry) == Some(Loader::Css) {
                "css"
            } else {
                "js"
            };
            let outfile = out_dir.join(format!("{name}.{ext}"));
            for file in self.bundle_module(ctx, entry, outfile).await? {
                chunks.push(describe(&out_dir, &name, ChunkKind::Entry, &file)?);
            }
        }

        if let Some(federation) = config.federation.as_ref().filter(|f| f.is_remote()) {
            let mut files = BTreeMap::new();
            for (expose, source) in ctx.exposes() {
                let name = expose_chunk_name(expose);
                let file_name = format!("{name}.js");
                let written = self
                    .bundle_module(ctx, source, out_dir.join(&file_name))
                    .await?;
                for file in written {
                    chunks.push(describe(&out_dir, &name, ChunkKind::Expose, &file)?);
                }
                files.insert(expose.clone(), file_name);
            }

            let remote_entry = out_dir.join(&federation.filename);
            tokio::fs::write(&remote_entry, remote_entry_source(federation, &files)).await?;
            chunks.push(describe(
                &out_dir,
                &federation.name,
                ChunkKind::RemoteEntry,
                &remote_entry,
            )?);
            info!(
                name = %federation.name,
                exposes = files.len(),
                file = %remote_entry.display(),
                "wrote remote entry"
            );
        }

        info!(engine = self.engine.name(), chunks = chunks.len(), "bundled");
        ctx.set_cache(key, false)?;
        ctx.set_chunks(chunks)
    }
}

/// Content hash and size per chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizerStep;

#[async_trait]
impl Step for OptimizerStep {
    fn name(&self) -> &'static str {
        "optimizer"
    }

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let config = ctx.config();
        let out_dir = config.out_path();
        let cache = BuildCache::for_project(config);

        let mut optimized = Vec::new();
        for chunk in ctx.chunks().iter().filter(|c| c.kind != ChunkKind::SourceMap) {
            let path = match ctx.cache_key().filter(|_| ctx.cache_hit()) {
                Some(key) => cache.cached_file(key, &chunk.file),
                None => out_dir.join(&chunk.file),
            };
            let bytes = tokio::fs::read(&path).await?;
            let size = bytes.len() as u64;
            if size > CHUNK_SIZE_WARNING {
                warn!(
                    chunk = %chunk.file.display(),
                    bytes = size,
                    limit = CHUNK_SIZE_WARNING,
                    "chunk exceeds size warning limit"
                );
            }
            optimized.push(OptimizedChunk {
                file: chunk.file.clone(),
                bytes: size,
                hash: short_hash(&bytes),
            });
        }
        ctx.set_optimized(optimized)
    }
}

/// Re-prints every stylesheet in the output directory through lightningcss.
#[derive(Debug, Clone, Copy, Default)]
pub struct CssOptimizerStep;

#[async_trait]
impl Step for CssOptimizerStep {
    fn name(&self) -> &'static str {
        "css-optimizer"
    }

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        if ctx.cache_hit() {
            debug!("cache hit; stylesheets already optimized");
            return ctx.set_css(Vec::new());
        }

        let config = ctx.config();
        let out_dir = config.out_path();
        let minify = config.css_minify();

        let mut css = Vec::new();
        for rel in relative_files(&out_dir)
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "css"))
        {
            let path = out_dir.join(&rel);
            let source = tokio::fs::read_to_string(&path).await?;
            let file = path.display().to_string();
            let code = optimize_css(&source, &file, minify).map_err(|e| EngineError::Transform {
                file,
                message: e.to_string(),
            })?;
            tokio::fs::write(&path, &code).await?;
            css.push(OptimizedChunk {
                file: rel,
                bytes: code.len() as u64,
                hash: short_hash(code.as_bytes()),
            });
        }

        debug!(stylesheets = css.len(), minify, "optimized css");
        ctx.set_css(css)
    }
}

/// Finalizes the output directory and writes `manifest.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputterStep;

#[async_trait]
impl Step for OutputterStep {
    fn name(&self) -> &'static str {
        "outputter"
    }

    async fn run(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let config = Arc::clone(ctx.config());
        let out_dir = config.out_path();
        let cache = BuildCache::for_project(&config);

        match ctx.cache_key() {
            Some(key) if ctx.cache_hit() => {
                cache.restore(key, &out_dir, ctx.chunks())?;
                info!(key = %key, out_dir = %out_dir.display(), "restored build from cache");
            }
            Some(key) if config.cache_enabled() => {
                if let Err(e) = cache.store(key, &out_dir, ctx.chunks()) {
                    warn!(key = %key, error = %e, "failed to store build cache");
                }
            }
            _ => {}
        }

        let mut manifest = FileManifest::default();
        for chunk in ctx.chunks() {
            let bytes = tokio::fs::read(out_dir.join(&chunk.file)).await?;
            manifest.files.insert(
                slash_path(&chunk.file),
                ManifestEntry {
                    bytes: bytes.len() as u64,
                    hash: short_hash(&bytes),
                },
            );
        }

        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::other(format!("Failed to serialize manifest: {e}")))?;
        write_creating_dirs(&out_dir.join(MANIFEST_FILE), &json)?;
        info!(
            files = manifest.files.len(),
            out_dir = %out_dir.display(),
            "wrote build output"
        );
        ctx.set_manifest(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, FederationConfig, Mode};
    use crate::engine::NativeEngine;
    use crate::pipeline::{PipelineExecutor, StepKind};
    use std::fs;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        dir
    }

    async fn build(config: BuildConfig) -> Result<BuildContext, Error> {
        PipelineExecutor::with_engine(Arc::new(NativeEngine::new()))
            .execute(config)
            .await
    }

    #[tokio::test]
    async fn test_resolver_follows_relative_imports() {
        let dir = project();
        fs::write(
            dir.path().join("src/main.js"),
            "import { a } from './a';\nimport 'react';\nconsole.log(a);\n",
        )
        .unwrap();
        fs::write(dir.path().join("src/a.js"), "import './b.js';\nexport const a = 1;\n").unwrap();
        fs::write(dir.path().join("src/b.js"), "export {};\n").unwrap();

        let ctx = build(BuildConfig::new(dir.path()).with_entry("src/main.js"))
            .await
            .unwrap();
        assert_eq!(ctx.module_graph().len(), 3);
        assert_eq!(ctx.entry_points().len(), 1);
        assert!(ctx.entry_points().contains_key("entry0"));
        assert_eq!(ctx.transformed().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_entry_is_resolution_error() {
        let dir = project();
        let err = build(BuildConfig::new(dir.path()).with_entry("src/nope.js"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolveError::NotFound { ref specifier, .. }) if specifier == "src/nope.js"
        ));
    }

    #[tokio::test]
    async fn test_no_entries_is_resolution_error() {
        let dir = project();
        let err = build(BuildConfig::new(dir.path())).await.unwrap_err();
        assert!(matches!(err, Error::Resolution(ResolveError::NoEntries)));
    }

    #[tokio::test]
    async fn test_unresolvable_import_is_resolution_error() {
        let dir = project();
        fs::write(dir.path().join("src/main.js"), "import x from './missing';\n").unwrap();
        let err = build(BuildConfig::new(dir.path()).with_entry("src/main.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution(ResolveError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_syntax_error_is_transform_error() {
        let dir = project();
        fs::write(dir.path().join("src/main.js"), "function broken( {\n").unwrap();
        let err = build(BuildConfig::new(dir.path()).with_entry("src/main.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transform(EngineError::Bundle { .. })), "{err}");
    }

    #[tokio::test]
    async fn test_manifest_and_optimizer_hashes() {
        let dir = project();
        fs::write(dir.path().join("src/main.js"), "console.log(process.env.NODE_ENV);\n").unwrap();

        let ctx = build(BuildConfig::new(dir.path()).with_entry("src/main.js"))
            .await
            .unwrap();
        let out = dir.path().join("dist");
        let main = fs::read_to_string(out.join("main.js")).unwrap();
        assert!(main.contains("console.log(\"development\")"));
        assert!(out.join("main.js.map").is_file());

        let manifest: FileManifest =
            serde_json::from_slice(&fs::read(out.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(Some(&manifest), ctx.manifest());
        assert!(manifest.files.contains_key("main.js"));
        assert!(manifest.files.contains_key("main.js.map"));

        let optimized = ctx.optimized();
        assert_eq!(optimized.len(), 1);
        assert_eq!(optimized[0].hash, manifest.files["main.js"].hash);
    }

    #[tokio::test]
    async fn test_css_entry_is_optimized_in_production() {
        let dir = project();
        fs::write(dir.path().join("src/main.js"), "console.log(1);\n").unwrap();
        fs::write(dir.path().join("src/style.css"), ".a {\n  color: red;\n}\n").unwrap();

        let ctx = build(
            BuildConfig::new(dir.path())
                .with_entry("src/main.js")
                .with_entry("src/style.css")
                .with_mode(Mode::Production),
        )
        .await
        .unwrap();
        assert_eq!(ctx.css().len(), 1);
        let css = fs::read_to_string(dir.path().join("dist/style.css")).unwrap();
        assert_eq!(css, ".a{color:red}");
    }

    #[tokio::test]
    async fn test_second_build_hits_cache_and_restores() {
        let dir = project();
        fs::write(dir.path().join("src/main.js"), "console.log('cached');\n").unwrap();
        let config = BuildConfig::new(dir.path()).with_entry("src/main.js");

        let first = build(config.clone()).await.unwrap();
        assert!(!first.cache_hit());

        fs::remove_dir_all(dir.path().join("dist")).unwrap();
        let second = build(config).await.unwrap();
        assert!(second.cache_hit());
        assert_eq!(first.cache_key(), second.cache_key());
        assert_eq!(first.manifest(), second.manifest());
        assert!(dir.path().join("dist/main.js").is_file());
        assert_eq!(second.completed(), &StepKind::ALL);
    }

    #[tokio::test]
    async fn test_remote_writes_container_and_exposes() {
        let dir = project();
        fs::write(dir.path().join("src/Button.js"), "export default function Button() {}\n")
            .unwrap();

        let config = BuildConfig::new(dir.path()).with_federation(
            FederationConfig::new("remote_app").expose("./Button", "src/Button.js"),
        );
        let ctx = build(config).await.unwrap();

        let out = dir.path().join("dist");
        assert!(out.join("__federation_expose_Button.js").is_file());
        let entry = fs::read_to_string(out.join("remoteEntry.js")).unwrap();
        assert!(entry.contains("window['remote_app']"));
        assert!(entry.contains("./__federation_expose_Button.js"));
        assert!(ctx
            .chunks()
            .iter()
            .any(|c| c.kind == ChunkKind::RemoteEntry && c.file == Path::new("remoteEntry.js")));
    }

    #[test]
    fn test_slash_path() {
        assert_eq!(slash_path(Path::new("assets/app.css")), "assets/app.css");
        assert_eq!(slash_path(Path::new("main.js")), "main.js");
    }
}
