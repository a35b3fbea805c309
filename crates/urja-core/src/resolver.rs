//! Module resolution.
//!
//! Bare specifiers resolve by walking up `node_modules` directories and
//! reading the package manifest (`exports`, then `main`, then `module`, then
//! `index.js`). Relative specifiers resolve against the importing file with
//! extension and directory-index probing.

use crate::imports::{package_name, subpath};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions tried for files inside packages.
const PACKAGE_EXTENSIONS: &[&str] = &[".js", ".mjs", ".cjs", ".json"];

/// Extensions tried for first-party source files.
const SOURCE_EXTENSIONS: &[&str] = &[".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs", ".json"];

/// Export conditions, in preference order.
const CONDITIONS: &[&str] = &["import", "require", "default"];

/// Module system of a resolved file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    CommonJs,
    Esm,
}

/// A bare specifier resolved to a file inside a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// The specifier as written (`react`, `react-dom/client`).
    pub specifier: String,
    /// The package directory inside `node_modules`.
    pub package_dir: PathBuf,
    /// The entry file.
    pub path: PathBuf,
    pub kind: ModuleKind,
}

/// Resolution failure.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Cannot find module '{specifier}' from {}", .from.display())]
    NotFound { specifier: String, from: PathBuf },

    #[error("Invalid package.json at {}: {message}", .path.display())]
    InvalidPackageJson { path: PathBuf, message: String },

    #[error("No entry points configured")]
    NoEntries,
}

/// Resolve a bare specifier from `root`.
pub fn resolve_package(root: &Path, specifier: &str) -> Result<ResolvedModule, ResolveError> {
    let name = package_name(specifier);
    let sub = subpath(specifier);

    for dir in root.ancestors() {
        let package_dir = dir.join("node_modules").join(name);
        if !package_dir.is_dir() {
            continue;
        }

        let manifest = read_manifest(&package_dir)?;
        let entry = match sub {
            None => resolve_root_entry(&package_dir, manifest.as_ref()),
            Some(sub) => resolve_subpath(&package_dir, manifest.as_ref(), sub),
        };

        return match entry {
            Some((path, from_module_field)) => {
                let path = dunce::canonicalize(&path).unwrap_or(path);
                let kind = detect_kind(&path, manifest.as_ref(), from_module_field);
                Ok(ResolvedModule {
                    specifier: specifier.to_string(),
                    package_dir,
                    path,
                    kind,
                })
            }
            None => Err(ResolveError::NotFound {
                specifier: specifier.to_string(),
                from: root.to_path_buf(),
            }),
        };
    }

    Err(ResolveError::NotFound {
        specifier: specifier.to_string(),
        from: root.to_path_buf(),
    })
}

/// Resolve a relative specifier against the file that imports it.
pub fn resolve_relative(from_file: &Path, specifier: &str) -> Result<PathBuf, ResolveError> {
    let base = from_file.parent().unwrap_or(Path::new("."));
    let candidate = base.join(specifier);
    find_with_extensions(&candidate, SOURCE_EXTENSIONS).ok_or_else(|| ResolveError::NotFound {
        specifier: specifier.to_string(),
        from: from_file.to_path_buf(),
    })
}

fn read_manifest(package_dir: &Path) -> Result<Option<Value>, ResolveError> {
    let path = package_dir.join("package.json");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Ok(None);
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| ResolveError::InvalidPackageJson {
            path,
            message: e.to_string(),
        })
}

/// Returns the entry and whether it came from the `module` field.
fn resolve_root_entry(package_dir: &Path, manifest: Option<&Value>) -> Option<(PathBuf, bool)> {
    if let Some(manifest) = manifest {
        if let Some(target) = manifest.get("exports").and_then(|e| export_target(e, ".")) {
            if let Some(path) = find_with_extensions(&package_dir.join(&target), PACKAGE_EXTENSIONS) {
                return Some((path, false));
            }
        }
        if let Some(main) = manifest.get("main").and_then(Value::as_str) {
            if let Some(path) = find_with_extensions(&package_dir.join(main), PACKAGE_EXTENSIONS) {
                return Some((path, false));
            }
        }
        if let Some(module) = manifest.get("module").and_then(Value::as_str) {
            if let Some(path) = find_with_extensions(&package_dir.join(module), PACKAGE_EXTENSIONS) {
                return Some((path, true));
            }
        }
    }
    find_with_extensions(&package_dir.join("index"), PACKAGE_EXTENSIONS).map(|p| (p, false))
}

fn resolve_subpath(
    package_dir: &Path,
    manifest: Option<&Value>,
    sub: &str,
) -> Option<(PathBuf, bool)> {
    let key = format!("./{sub}");
    if let Some(exports) = manifest.and_then(|m| m.get("exports")) {
        if let Some(target) = export_target(exports, &key) {
            return find_with_extensions(&package_dir.join(&target), PACKAGE_EXTENSIONS).map(|p| (p, false));
        }
    }
    find_with_extensions(&package_dir.join(sub), PACKAGE_EXTENSIONS).map(|p| (p, false))
}

/// Look up `key` (`.` or `./sub`) in an `exports` field.
fn export_target(exports: &Value, key: &str) -> Option<String> {
    match exports {
        Value::String(s) if key == "." => Some(s.clone()),
        Value::Object(map) => {
            if map.keys().any(|k| k.starts_with('.')) {
                map.get(key).and_then(condition_target)
            } else if key == "." {
                condition_target(exports)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn condition_target(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => CONDITIONS
            .iter()
            .find_map(|cond| map.get(*cond).and_then(condition_target)),
        Value::Array(items) => items.iter().find_map(condition_target),
        _ => None,
    }
}

fn find_with_extensions(candidate: &Path, extensions: &[&str]) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    for ext in extensions {
        let with_ext = PathBuf::from(format!("{}{ext}", candidate.display()));
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }
    if candidate.is_dir() {
        for ext in extensions {
            let index = candidate.join(format!("index{ext}"));
            if index.is_file() {
                return Some(index);
            }
        }
    }
    None
}

fn detect_kind(path: &Path, manifest: Option<&Value>, from_module_field: bool) -> ModuleKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mjs") => return ModuleKind::Esm,
        Some("cjs") => return ModuleKind::CommonJs,
        _ => {}
    }
    let type_module = manifest
        .and_then(|m| m.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t == "module");
    if type_module || from_module_field {
        ModuleKind::Esm
    } else {
        ModuleKind::CommonJs
    }
}
