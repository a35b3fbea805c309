//! Module shape adapters.
//!
//! A proxy module needs to know what a CommonJS package exports before the
//! package is bundled. Shapes come from static reflection over the package
//! source ([`CjsLexerAdapter`]) or from an explicit manifest of well-known
//! packages ([`KnownExportsAdapter`]).

use crate::resolver::{resolve_package, resolve_relative, ModuleKind, ResolvedModule};
use regex_lite::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::trace;

/// Exported shape of a dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleShape {
    /// The module has a default export (`module.exports` for CommonJS).
    pub has_default: bool,
    /// Named exports, valid identifiers only, in declaration order.
    pub named_keys: Vec<String>,
}

impl ModuleShape {
    /// Build a shape from raw keys, dropping anything that cannot be a named export.
    pub fn from_keys<I, S>(has_default: bool, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let named_keys = keys
            .into_iter()
            .map(Into::into)
            .filter(|k| is_exportable_key(k) && seen.insert(k.clone()))
            .collect();
        Self {
            has_default,
            named_keys,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.named_keys.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("{} is an ES module", .path.display())]
    NotCommonJs { path: PathBuf },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No known exports for '{specifier}'")]
    Unknown { specifier: String },
}

/// Determines the exported shape of a resolved dependency.
pub trait ShapeAdapter: Send + Sync {
    fn shape(&self, module: &ResolvedModule) -> Result<ModuleShape, ShapeError>;
}

const RESERVED: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "enum", "export", "extends", "false", "finally", "for", "function", "if", "import",
    "in", "instanceof", "new", "null", "return", "super", "switch", "this", "throw", "true", "try",
    "typeof", "var", "void", "while", "with", "yield", "let", "static", "await",
];

/// Whether `key` can appear in `export const <key> = ...`.
pub fn is_exportable_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && key != "__esModule"
        && !RESERVED.contains(&key)
}

struct CjsPatterns {
    assign: Regex,
    define_property: Regex,
    object_literal: Regex,
    reexport: Regex,
}

fn patterns() -> Option<&'static CjsPatterns> {
    static PATTERNS: OnceLock<Option<CjsPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(CjsPatterns {
                assign: Regex::new(
                    r"(?:^|[^.\w$])(?:module\.)?exports\.([A-Za-z_$][A-Za-z0-9_$]*)\s*=[^=]",
                )
                .ok()?,
                define_property: Regex::new(
                    r#"Object\.defineProperty\(\s*(?:module\.)?exports\s*,\s*['"]([^'"]+)['"]"#,
                )
                .ok()?,
                object_literal: Regex::new(r"module\.exports\s*=\s*\{([^}]*)\}").ok()?,
                reexport: Regex::new(
                    r#"module\.exports\s*=\s*require\(\s*['"]([^'"]+)['"]\s*\)"#,
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// Static reflection over CommonJS source.
///
/// Recognises `exports.X =`, `module.exports.X =`,
/// `Object.defineProperty(exports, 'X', ...)`, `module.exports = { a, b: c }`
/// and follows `module.exports = require('...')` re-exports, each file once.
#[derive(Debug, Clone, Copy, Default)]
pub struct CjsLexerAdapter;

impl CjsLexerAdapter {
    fn collect(
        &self,
        path: &Path,
        package_dir: &Path,
        visited: &mut HashSet<PathBuf>,
        keys: &mut Vec<String>,
    ) -> Result<(), ShapeError> {
        if !visited.insert(path.to_path_buf()) {
            return Ok(());
        }
        let source = std::fs::read_to_string(path).map_err(|source| ShapeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(p) = patterns() else {
            return Ok(());
        };

        let mut found: Vec<(usize, String)> = Vec::new();
        for caps in p.assign.captures_iter(&source) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
        for caps in p.define_property.captures_iter(&source) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
        for caps in p.object_literal.captures_iter(&source) {
            if let Some(m) = caps.get(1) {
                for key in object_literal_keys(m.as_str()) {
                    found.push((m.start(), key));
                }
            }
        }
        found.sort_by_key(|(pos, _)| *pos);
        keys.extend(found.into_iter().map(|(_, k)| k));

        for caps in p.reexport.captures_iter(&source) {
            let Some(spec) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            let target = if spec.starts_with("./") || spec.starts_with("../") {
                resolve_relative(path, spec).ok()
            } else {
                resolve_package(package_dir, spec).ok().map(|r| r.path)
            };
            match target {
                Some(target) => self.collect(&target, package_dir, visited, keys)?,
                None => trace!(from = %path.display(), spec, "unresolved re-export"),
            }
        }
        Ok(())
    }
}

/// Keys of `{ a, b: c, 'd': e, ...rest }`, in order.
fn object_literal_keys(body: &str) -> Vec<String> {
    body.split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() || part.starts_with("...") {
                return None;
            }
            let key = part.split(':').next().unwrap_or(part).trim();
            let key = key.trim_matches(|c| c == '\'' || c == '"');
            Some(key.to_string())
        })
        .collect()
}

impl ShapeAdapter for CjsLexerAdapter {
    fn shape(&self, module: &ResolvedModule) -> Result<ModuleShape, ShapeError> {
        if module.kind == ModuleKind::Esm {
            return Err(ShapeError::NotCommonJs {
                path: module.path.clone(),
            });
        }
        let mut keys = Vec::new();
        let mut visited = HashSet::new();
        self.collect(&module.path, &module.package_dir, &mut visited, &mut keys)?;
        Ok(ModuleShape::from_keys(true, keys))
    }
}

/// Explicit export manifest for packages whose shape cannot be read statically.
#[derive(Debug, Clone)]
pub struct KnownExportsAdapter {
    entries: HashMap<String, Vec<String>>,
}

impl KnownExportsAdapter {
    /// An empty manifest.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_entry<I, S>(mut self, specifier: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .insert(specifier.into(), keys.into_iter().map(Into::into).collect());
        self
    }
}

impl Default for KnownExportsAdapter {
    /// Ships the React family.
    fn default() -> Self {
        Self::empty()
            .with_entry(
                "react",
                [
                    "Children",
                    "Component",
                    "Fragment",
                    "Profiler",
                    "PureComponent",
                    "StrictMode",
                    "Suspense",
                    "cloneElement",
                    "createContext",
                    "createElement",
                    "createRef",
                    "forwardRef",
                    "isValidElement",
                    "lazy",
                    "memo",
                    "startTransition",
                    "useCallback",
                    "useContext",
                    "useDebugValue",
                    "useDeferredValue",
                    "useEffect",
                    "useId",
                    "useImperativeHandle",
                    "useInsertionEffect",
                    "useLayoutEffect",
                    "useMemo",
                    "useReducer",
                    "useRef",
                    "useState",
                    "useSyncExternalStore",
                    "useTransition",
                    "version",
                ],
            )
            .with_entry(
                "react-dom",
                [
                    "createPortal",
                    "findDOMNode",
                    "flushSync",
                    "hydrate",
                    "render",
                    "unmountComponentAtNode",
                    "unstable_batchedUpdates",
                    "version",
                ],
            )
            .with_entry("react-dom/client", ["createRoot", "hydrateRoot"])
            .with_entry("react/jsx-runtime", ["Fragment", "jsx", "jsxs"])
            .with_entry("react/jsx-dev-runtime", ["Fragment", "jsxDEV"])
    }
}

impl ShapeAdapter for KnownExportsAdapter {
    fn shape(&self, module: &ResolvedModule) -> Result<ModuleShape, ShapeError> {
        self.entries
            .get(&module.specifier)
            .map(|keys| ModuleShape::from_keys(true, keys.iter().cloned()))
            .ok_or_else(|| ShapeError::Unknown {
                specifier: module.specifier.clone(),
            })
    }
}

/// Tries adapters in order.
///
/// The first non-empty shape wins; otherwise an empty shape if any adapter
/// produced one; otherwise the last error. An ES module is reported
/// immediately so no manifest can claim CommonJS exports for it.
pub struct ChainAdapter {
    adapters: Vec<Box<dyn ShapeAdapter>>,
}

impl ChainAdapter {
    pub fn new(adapters: Vec<Box<dyn ShapeAdapter>>) -> Self {
        Self { adapters }
    }

    /// Lexer first, React manifest second.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(CjsLexerAdapter),
            Box::new(KnownExportsAdapter::default()),
        ])
    }
}

impl ShapeAdapter for ChainAdapter {
    fn shape(&self, module: &ResolvedModule) -> Result<ModuleShape, ShapeError> {
        let mut empty = None;
        let mut last_err = None;
        for adapter in &self.adapters {
            match adapter.shape(module) {
                Ok(shape) if !shape.is_empty() => return Ok(shape),
                Ok(shape) => empty = Some(shape),
                Err(e @ ShapeError::NotCommonJs { .. }) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        match (empty, last_err) {
            (Some(shape), _) => Ok(shape),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ShapeError::Unknown {
                specifier: module.specifier.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cjs_module(dir: &Path, specifier: &str, files: &[(&str, &str)]) -> ResolvedModule {
        let package_dir = dir.join("node_modules").join(specifier);
        for (name, content) in files {
            let path = package_dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        ResolvedModule {
            specifier: specifier.to_string(),
            path: package_dir.join(files[0].0),
            package_dir,
            kind: ModuleKind::CommonJs,
        }
    }

    #[test]
    fn test_exportable_keys() {
        assert!(is_exportable_key("useState"));
        assert!(is_exportable_key("$store"));
        assert!(is_exportable_key("_private"));
        assert!(!is_exportable_key("default"));
        assert!(!is_exportable_key("__esModule"));
        assert!(!is_exportable_key("with-dash"));
        assert!(!is_exportable_key("1abc"));
        assert!(!is_exportable_key("delete"));
        assert!(!is_exportable_key(""));
    }

    #[test]
    fn test_lexer_reads_assignments_in_order() {
        let dir = tempdir().unwrap();
        let module = cjs_module(
            dir.path(),
            "lib",
            &[(
                "index.js",
                r#"'use strict';
Object.defineProperty(exports, '__esModule', { value: true });
exports.alpha = 1;
module.exports.beta = function () {};
Object.defineProperty(exports, "gamma", { enumerable: false, get: () => 3 });
exports.default = 4;
if (exports.alpha === 1) {}
"#,
            )],
        );

        let shape = CjsLexerAdapter.shape(&module).unwrap();
        assert!(shape.has_default);
        assert_eq!(shape.named_keys, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_lexer_object_literal_and_reexports() {
        let dir = tempdir().unwrap();
        let module = cjs_module(
            dir.path(),
            "react-like",
            &[
                (
                    "index.js",
                    "if (process.env.NODE_ENV === 'production') {\n  module.exports = require('./cjs/prod.js');\n} else {\n  module.exports = require('./cjs/dev.js');\n}\n",
                ),
                ("cjs/dev.js", "exports.useState = a;\nexports.useEffect = b;\n"),
                (
                    "cjs/prod.js",
                    "module.exports = { useState: a, useEffect, 'memo': m, ...rest };\n",
                ),
            ],
        );

        let shape = CjsLexerAdapter.shape(&module).unwrap();
        assert_eq!(shape.named_keys, vec!["useState", "useEffect", "memo"]);
    }

    #[test]
    fn test_lexer_reexport_cycle_terminates() {
        let dir = tempdir().unwrap();
        let module = cjs_module(
            dir.path(),
            "cyclic",
            &[
                ("a.js", "module.exports = require('./b.js');\nexports.a = 1;\n"),
                ("b.js", "module.exports = require('./a.js');\nexports.b = 1;\n"),
            ],
        );
        let shape = CjsLexerAdapter.shape(&module).unwrap();
        assert_eq!(shape.named_keys, vec!["a", "b"]);
    }

    #[test]
    fn test_lexer_rejects_esm() {
        let dir = tempdir().unwrap();
        let mut module = cjs_module(dir.path(), "esm", &[("index.mjs", "export const a = 1;")]);
        module.kind = ModuleKind::Esm;
        assert!(matches!(
            CjsLexerAdapter.shape(&module),
            Err(ShapeError::NotCommonJs { .. })
        ));
    }

    #[test]
    fn test_chain_falls_back_to_manifest_when_lexer_finds_nothing() {
        let dir = tempdir().unwrap();
        let module = cjs_module(
            dir.path(),
            "react-dom/client",
            &[("client.js", "var m = require('./x'); module.exports = m;\n")],
        );

        let shape = ChainAdapter::standard().shape(&module).unwrap();
        assert_eq!(shape.named_keys, vec!["createRoot", "hydrateRoot"]);
    }

    #[test]
    fn test_chain_returns_empty_shape_for_unknown_opaque_module() {
        let dir = tempdir().unwrap();
        let module = cjs_module(dir.path(), "opaque", &[("index.js", "module.exports = make();\n")]);

        let shape = ChainAdapter::standard().shape(&module).unwrap();
        assert!(shape.has_default);
        assert!(shape.is_empty());
    }

    #[test]
    fn test_chain_reports_esm_without_consulting_manifest() {
        let dir = tempdir().unwrap();
        let mut module = cjs_module(dir.path(), "react", &[("index.mjs", "")]);
        module.kind = ModuleKind::Esm;
        assert!(matches!(
            ChainAdapter::standard().shape(&module),
            Err(ShapeError::NotCommonJs { .. })
        ));
    }
}
