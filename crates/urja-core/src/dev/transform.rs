//! On-demand module transformation for the dev server.

use crate::engine::{Engine, EngineError, EsTarget, Loader, SourceMapKind, TransformOptions};
use crate::imports::is_bare_specifier;
use crate::plugin::{PluginChain, PluginError};
use regex_lite::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

/// Per-request failure. The server answers these with a 404.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Transform(#[from] EngineError),
}

/// How a file under the project root is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeKind {
    /// `.jsx`/`.tsx`: compiled with fast-refresh instrumentation.
    Component,
    /// `.js`/`.mjs`/`.ts`: down-levelled with an inline source map.
    Script,
    /// `.css`: plugin chain only.
    Stylesheet,
    /// Anything else, served as stored.
    Raw,
}

impl ServeKind {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsx" | "tsx") => Self::Component,
            Some("js" | "mjs" | "ts") => Self::Script,
            Some("css") => Self::Stylesheet,
            _ => Self::Raw,
        }
    }
}

/// A transformed module ready to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedModule {
    pub code: String,
    pub content_type: &'static str,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    modified: Option<SystemTime>,
    module: TransformedModule,
}

/// Prepended to fast-refresh components.
const REFRESH_PREAMBLE: &str = r"import RefreshRuntime from '/@react-refresh';
const __urja_prev_refresh_reg = window.$RefreshReg$;
const __urja_prev_refresh_sig = window.$RefreshSig$;
window.$RefreshReg$ = (type, id) => RefreshRuntime.register(type, __URJA_MODULE_ID__ + ' ' + id);
window.$RefreshSig$ = RefreshRuntime.createSignatureFunctionForTransform;
";

fn refresh_footer(module_id: &str) -> String {
    format!(
        r"
window.$RefreshReg$ = __urja_prev_refresh_reg;
window.$RefreshSig$ = __urja_prev_refresh_sig;
if (!window.__urja_refresh_scheduled) {{
  window.__urja_refresh_scheduled = setTimeout(() => {{
    window.__urja_refresh_scheduled = null;
    RefreshRuntime.performReactRefresh();
  }}, 30);
}}
window.$RefreshReg$ && window.$RefreshReg$(function () {{}}, {module_id});
"
    )
}

fn bare_import() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\bfrom\s*|\bimport\s*\(?\s*)(['"])([^'"\n]+)(['"])"#).ok())
        .as_ref()
}

/// Point bare specifiers that have a pre-bundled copy at its URL.
#[must_use]
pub fn rewrite_bare_imports(code: &str, deps: &BTreeMap<String, String>) -> String {
    if deps.is_empty() {
        return code.to_string();
    }
    let Some(re) = bare_import() else {
        return code.to_string();
    };
    re.replace_all(code, |caps: &regex_lite::Captures<'_>| {
        let spec = &caps[3];
        match deps.get(spec).filter(|_| is_bare_specifier(spec)) {
            Some(url) => format!("{}{}{url}{}", &caps[1], &caps[2], &caps[4]),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Transforms project files for serving and caches the result per file.
///
/// Entries are dropped by [`invalidate`](Self::invalidate) and are also
/// ignored once the file's modification time changes.
pub struct ModuleTransformer {
    engine: Arc<dyn Engine>,
    plugins: PluginChain,
    deps: RwLock<BTreeMap<String, String>>,
    cache: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl ModuleTransformer {
    pub fn new(engine: Arc<dyn Engine>, plugins: PluginChain) -> Self {
        Self {
            engine,
            plugins,
            deps: RwLock::new(BTreeMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Bare specifier → URL of its pre-bundled module.
    pub fn set_dependencies(&self, deps: BTreeMap<String, String>) {
        *self.deps.write().unwrap_or_else(PoisonError::into_inner) = deps;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn invalidate(&self, path: &Path) -> bool {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Transform a script or stylesheet at `path`.
    pub async fn transform_file(&self, path: &Path) -> Result<TransformedModule, RequestError> {
        let kind = ServeKind::from_path(path);
        if kind == ServeKind::Raw {
            return Err(RequestError::NotFound {
                path: path.display().to_string(),
            });
        }

        let modified = tokio::fs::metadata(path)
            .await
            .map_err(|source| RequestError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .modified()
            .ok();
        if let Some(hit) = self.cached(path, modified) {
            return Ok(hit);
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RequestError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let id = path.display().to_string();
        let code = self.plugins.transform(&raw, &id)?;

        let module = match kind {
            ServeKind::Stylesheet => TransformedModule {
                code,
                content_type: "text/css",
            },
            ServeKind::Component => TransformedModule {
                code: self.compile_component(&code, path, &id).await?,
                content_type: "application/javascript",
            },
            _ => TransformedModule {
                code: self.compile_script(&code, path, &id).await?,
                content_type: "application/javascript",
            },
        };

        debug!(path = %id, bytes = module.code.len(), "transformed module");
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                path.to_path_buf(),
                CacheEntry {
                    modified,
                    module: module.clone(),
                },
            );
        Ok(module)
    }

    fn cached(&self, path: &Path, modified: Option<SystemTime>) -> Option<TransformedModule> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(path)
            .filter(|entry| modified.is_some() && entry.modified == modified)
            .map(|entry| entry.module.clone())
    }

    fn rewrite(&self, code: &str) -> String {
        let deps = self.deps.read().unwrap_or_else(PoisonError::into_inner);
        rewrite_bare_imports(code, &deps)
    }

    async fn compile_component(&self, code: &str, path: &Path, id: &str) -> Result<String, RequestError> {
        let loader = Loader::from_path(path).unwrap_or(Loader::Jsx);
        let options = TransformOptions::new(id, loader)
            .target(EsTarget::EsNext)
            .sourcemap(SourceMapKind::Inline)
            .refresh(true);
        let output = self.engine.transform(code, &options).await?;

        let module_id = serde_json::Value::from(id).to_string();
        let preamble = REFRESH_PREAMBLE.replace("__URJA_MODULE_ID__", &module_id);
        Ok(format!(
            "{preamble}{}{}",
            self.rewrite(&output.code),
            refresh_footer(&module_id)
        ))
    }

    async fn compile_script(&self, code: &str, path: &Path, id: &str) -> Result<String, RequestError> {
        let loader = Loader::from_path(path).unwrap_or(Loader::Js);
        let options = TransformOptions::new(id, loader)
            .target(EsTarget::Es2020)
            .sourcemap(SourceMapKind::Inline);
        let output = self.engine.transform(code, &options).await?;
        Ok(self.rewrite(&output.code))
    }
}

impl std::fmt::Debug for ModuleTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleTransformer")
            .field("engine", &self.engine.name())
            .field("plugins", &self.plugins)
            .field("cached", &self.cached_count())
            .finish()
    }
}
