//! Dependency pre-bundling across passes: cache reuse, invalidation and failure isolation.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use urja_core::engine::{
    BundleInput, BundleOutput, BundleRequest, EngineError, TransformOptions, TransformOutput,
};
use urja_core::prebundle::METADATA_FILE;
use urja_core::{DependencyPreBundler, Engine, NativeEngine};

/// Delegates to the native engine, counting bundles and failing named sources.
struct CountingEngine {
    inner: NativeEngine,
    bundles: AtomicUsize,
    fail_on: Option<&'static str>,
}

impl CountingEngine {
    fn new() -> Arc<Self> {
        Self::failing_on(None)
    }

    fn failing_on(fail_on: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            inner: NativeEngine::new(),
            bundles: AtomicUsize::new(0),
            fail_on,
        })
    }

    fn bundles(&self) -> usize {
        self.bundles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn transform(
        &self,
        source: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, EngineError> {
        self.inner.transform(source, options).await
    }

    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, EngineError> {
        self.bundles.fetch_add(1, Ordering::SeqCst);
        if let (Some(name), BundleInput::Stdin { sourcefile, .. }) = (self.fail_on, &request.input) {
            if sourcefile == name {
                return Err(EngineError::Bundle {
                    message: format!("refusing {sourcefile}"),
                });
            }
        }
        self.inner.bundle(request).await
    }
}

fn add_package(root: &Path, name: &str, source: &str) {
    let pkg = root.join("node_modules").join(name);
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("index.js"), source).unwrap();
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("package.json"),
        r#"{"dependencies":{"alpha":"1.0.0","beta":"1.0.0"}}"#,
    )
    .unwrap();
    add_package(dir.path(), "alpha", "exports.one = 1;\n");
    add_package(dir.path(), "beta", "module.exports = { two: 2 };\n");
    dir
}

fn deps(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

#[tokio::test]
async fn test_second_pass_is_a_cache_hit() {
    let dir = project();
    let engine = CountingEngine::new();
    let prebundler = DependencyPreBundler::new(dir.path(), engine.clone());
    let wanted = deps(&["alpha", "beta"]);

    let first = prebundler.pre_bundle(&wanted).await.unwrap();
    assert_eq!(first.bundled.len(), 2);
    assert_eq!(engine.bundles(), 2);

    let second = prebundler.pre_bundle(&wanted).await.unwrap();
    assert!(second.is_cache_hit());
    assert_eq!(second.cache_hits.len(), 2);
    assert_eq!(engine.bundles(), 2);
    assert_eq!(
        second.servable_map().get("alpha").map(String::as_str),
        Some("/@urja-deps/alpha.js")
    );
}

#[tokio::test]
async fn test_manifest_change_rebuilds_everything() {
    let dir = project();
    let engine = CountingEngine::new();
    let prebundler = DependencyPreBundler::new(dir.path(), engine.clone());
    let wanted = deps(&["alpha", "beta"]);

    prebundler.pre_bundle(&wanted).await.unwrap();
    let before = prebundler.read_metadata().unwrap();

    fs::write(
        dir.path().join("package.json"),
        r#"{"dependencies":{"alpha":"2.0.0","beta":"1.0.0"}}"#,
    )
    .unwrap();
    let rebuilt = prebundler.pre_bundle(&wanted).await.unwrap();

    assert_eq!(rebuilt.bundled.len(), 2);
    assert!(rebuilt.cache_hits.is_empty());
    assert_eq!(engine.bundles(), 4);
    assert_ne!(prebundler.read_metadata().unwrap().hash, before.hash);
}

#[tokio::test]
async fn test_new_dependency_under_same_manifest_rebuilds_all_requested() {
    let dir = project();
    let engine = CountingEngine::new();
    let prebundler = DependencyPreBundler::new(dir.path(), engine.clone());

    prebundler.pre_bundle(&deps(&["alpha"])).await.unwrap();
    let next = prebundler.pre_bundle(&deps(&["alpha", "beta"])).await.unwrap();

    assert!(next.cache_hits.is_empty());
    assert_eq!(next.bundled.len(), 2);
    assert_eq!(engine.bundles(), 3);
    assert_eq!(prebundler.read_metadata().unwrap().deps, deps(&["alpha", "beta"]));
}

#[tokio::test]
async fn test_missing_output_rebuilds_all_requested() {
    let dir = project();
    let engine = CountingEngine::new();
    let prebundler = DependencyPreBundler::new(dir.path(), engine.clone());
    let wanted = deps(&["alpha", "beta"]);

    prebundler.pre_bundle(&wanted).await.unwrap();
    fs::remove_file(prebundler.output_path("beta")).unwrap();
    let next = prebundler.pre_bundle(&wanted).await.unwrap();

    assert!(next.cache_hits.is_empty());
    assert_eq!(next.bundled.len(), 2);
    assert_eq!(engine.bundles(), 4);
    assert!(prebundler.output_path("beta").is_file());
}

#[tokio::test]
async fn test_failed_dependency_does_not_block_others() {
    let dir = project();
    let engine = CountingEngine::failing_on(Some("beta.js"));
    let prebundler = DependencyPreBundler::new(dir.path(), engine.clone());

    let result = prebundler
        .pre_bundle(&deps(&["alpha", "beta", "missing"]))
        .await
        .unwrap();

    let mut bundled: Vec<_> = result.bundled.iter().map(|e| e.specifier.as_str()).collect();
    bundled.sort_unstable();
    assert_eq!(bundled, ["alpha", "missing"]);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].specifier, "beta");
    assert!(result.failed[0].reason.contains("refusing beta.js"));

    // An unresolvable package still reaches the engine through the re-export proxy.
    assert_eq!(engine.bundles(), 3);
    let proxy = fs::read_to_string(prebundler.output_path("missing")).unwrap();
    assert!(proxy.contains("export * from 'missing';"));
    assert!(prebundler.cache_dir().join("alpha.js").is_file());
    assert!(prebundler.cache_dir().join(METADATA_FILE).is_file());

    let mut recorded = prebundler.read_metadata().unwrap().deps;
    recorded.sort_unstable();
    assert_eq!(recorded, deps(&["alpha", "missing"]));
}

#[tokio::test]
async fn test_browser_only_exports_use_reexport_proxy() {
    let dir = project();
    let pkg = dir.path().join("node_modules/bonly");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(
        pkg.join("package.json"),
        r#"{"name":"bonly","exports":{".":{"browser":"./b.js"}}}"#,
    )
    .unwrap();
    fs::write(pkg.join("b.js"), "export default 'b';\n").unwrap();
    let engine = CountingEngine::new();
    let prebundler = DependencyPreBundler::new(dir.path(), engine.clone());

    let result = prebundler.pre_bundle(&deps(&["bonly"])).await.unwrap();

    assert!(result.failed.is_empty());
    assert_eq!(result.bundled.len(), 1);
    assert_eq!(engine.bundles(), 1);
    assert_eq!(
        result.servable_map().get("bonly").map(String::as_str),
        Some("/@urja-deps/bonly.js")
    );
}
