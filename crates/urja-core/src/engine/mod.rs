//! Transform/bundle engine interface.
//!
//! Source-to-source compilation is delegated to an [`Engine`]. The core only
//! orchestrates: it decides what to compile, with which options, and where
//! the output goes. [`NativeEngine`] is the built-in implementation; with
//! the `swc` feature, `SwcEngine` adds real TypeScript and JSX compilation.

mod native;
mod sourcemap;
#[cfg(feature = "swc")]
mod swc;

pub use native::NativeEngine;
#[cfg(feature = "swc")]
pub use swc::SwcEngine;

use crate::config::Platform;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Package the compiled JSX runtime is imported from.
pub const JSX_IMPORT_SOURCE: &str = "react";

/// Module compiled JSX imports its helpers from.
pub const JSX_RUNTIME_MODULE: &str = "react/jsx-runtime";

/// The most capable engine this build includes.
#[must_use]
pub fn default_engine() -> Arc<dyn Engine> {
    #[cfg(feature = "swc")]
    {
        Arc::new(SwcEngine::new())
    }
    #[cfg(not(feature = "swc"))]
    {
        Arc::new(NativeEngine::new())
    }
}

/// Source language of a module handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Loader {
    #[default]
    Js,
    Jsx,
    Ts,
    Tsx,
    Css,
}

impl Loader {
    /// Pick a loader from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str())? {
            "js" | "mjs" | "cjs" => Some(Self::Js),
            "jsx" => Some(Self::Jsx),
            "ts" | "mts" | "cts" => Some(Self::Ts),
            "tsx" => Some(Self::Tsx),
            "css" => Some(Self::Css),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Jsx => "jsx",
            Self::Ts => "ts",
            Self::Tsx => "tsx",
            Self::Css => "css",
        }
    }

    /// TypeScript flavours carry type-only syntax that must be erased.
    #[must_use]
    pub fn is_typescript(&self) -> bool {
        matches!(self, Self::Ts | Self::Tsx)
    }

    #[must_use]
    pub fn is_jsx(&self) -> bool {
        matches!(self, Self::Jsx | Self::Tsx)
    }
}

impl fmt::Display for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Language level of emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EsTarget {
    Es2015,
    Es2020,
    #[default]
    EsNext,
}

impl EsTarget {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Es2015 => "es2015",
            Self::Es2020 => "es2020",
            Self::EsNext => "esnext",
        }
    }
}

/// Source map emission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMapKind {
    #[default]
    None,
    /// Appended to the code as a base64 data URL.
    Inline,
    /// Returned separately and referenced by a `sourceMappingURL` comment.
    External,
}

/// Module format of emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleFormat {
    #[default]
    Esm,
    Cjs,
}

/// Options for a single-module transform.
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub loader: Loader,
    pub target: EsTarget,
    pub sourcemap: SourceMapKind,
    pub format: ModuleFormat,
    /// Instrument components for fast refresh.
    pub refresh: bool,
    /// Name recorded in diagnostics and source maps.
    pub filename: String,
}

impl TransformOptions {
    #[must_use]
    pub fn new(filename: impl Into<String>, loader: Loader) -> Self {
        Self {
            loader,
            filename: filename.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn target(mut self, target: EsTarget) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn sourcemap(mut self, kind: SourceMapKind) -> Self {
        self.sourcemap = kind;
        self
    }

    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}

/// Output of a single-module transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub code: String,
    /// Source map JSON when [`SourceMapKind::External`] was requested.
    pub map: Option<String>,
}

/// Where a bundle reads its entries from.
#[derive(Debug, Clone)]
pub enum BundleInput {
    /// Output name → entry file.
    EntryPoints(BTreeMap<String, PathBuf>),
    /// A synthesized entry that has no file on disk.
    Stdin {
        contents: String,
        /// Directory imports inside `contents` resolve against.
        resolve_dir: PathBuf,
        /// Name used for diagnostics and source maps.
        sourcefile: String,
    },
}

/// Where a bundle writes its outputs.
#[derive(Debug, Clone)]
pub enum BundleTarget {
    Outfile(PathBuf),
    Outdir(PathBuf),
}

/// A bundle request.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub input: BundleInput,
    pub output: BundleTarget,
    pub format: ModuleFormat,
    pub platform: Platform,
    /// Specifiers left as imports.
    pub external: Vec<String>,
    /// Expression → replacement source text.
    pub define: BTreeMap<String, String>,
    pub sourcemap: bool,
    pub minify: bool,
    pub splitting: bool,
    /// Report output sizes.
    pub metafile: bool,
}

impl BundleRequest {
    /// ESM browser bundle with no defines, maps or minification.
    #[must_use]
    pub fn new(input: BundleInput, output: BundleTarget) -> Self {
        Self {
            input,
            output,
            format: ModuleFormat::Esm,
            platform: Platform::Browser,
            external: Vec::new(),
            define: BTreeMap::new(),
            sourcemap: false,
            minify: false,
            splitting: false,
            metafile: false,
        }
    }
}

/// Size report for one output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub bytes: u64,
}

/// Size report for a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metafile {
    pub outputs: BTreeMap<String, OutputMeta>,
}

/// Files written by a bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleOutput {
    pub files: Vec<PathBuf>,
    pub metafile: Option<Metafile>,
}

/// Failure reported by an engine. Messages are surfaced verbatim.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transform failed for {file}: {message}")]
    Transform { file: String, message: String },

    #[error("Bundle failed: {message}")]
    Bundle { message: String },

    #[error("Engine IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transform/bundle engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &'static str;

    /// Compile one module in memory.
    async fn transform(
        &self,
        source: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, EngineError>;

    /// Build and write output files.
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, EngineError>;
}
