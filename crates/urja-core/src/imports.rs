//! Static import scanning.
//!
//! A lightweight scan, not a parse: it finds the string literal of
//! `import ... from '<x>'`, `export ... from '<x>'` and side-effect
//! `import '<x>'` statements, including ones split across lines.

use regex_lite::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn from_clause() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*(?:import|export)\b[^'"`;]*?\bfrom\s*['"]([^'"\n]+)['"]"#).ok()
    })
    .as_ref()
}

fn side_effect_import() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*import\s*['"]([^'"\n]+)['"]"#).ok())
        .as_ref()
}

/// Every import specifier in `source`, in first-seen order, deduplicated.
pub fn scan_specifiers(source: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = from_clause()
        .into_iter()
        .chain(side_effect_import())
        .flat_map(|re| re.captures_iter(source))
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str()))
        .collect();
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|(_, spec)| seen.insert(*spec))
        .map(|(_, spec)| spec.to_string())
        .collect()
}

/// Relative specifiers only.
pub fn scan_relative(source: &str) -> Vec<String> {
    scan_specifiers(source)
        .into_iter()
        .filter(|s| s.starts_with("./") || s.starts_with("../"))
        .collect()
}

/// Whether `specifier` names a package rather than a path or URL scheme.
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !specifier.starts_with('\0')
        && !specifier.starts_with("node:")
        && !specifier.starts_with("data:")
        && !specifier.starts_with("http:")
        && !specifier.starts_with("https:")
}

/// Package name of a bare specifier (`@scope/pkg/sub` → `@scope/pkg`).
pub fn package_name(specifier: &str) -> &str {
    let segments = if specifier.starts_with('@') { 2 } else { 1 };
    match specifier.match_indices('/').nth(segments - 1) {
        Some((idx, _)) => &specifier[..idx],
        None => specifier,
    }
}

/// The subpath after the package name, if any (`react/jsx-runtime` → `jsx-runtime`).
pub fn subpath(specifier: &str) -> Option<&str> {
    let name = package_name(specifier);
    specifier
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_specifiers_order_and_dedup() {
        let source = r#"
import React from 'react';
import { useState, useEffect } from 'react';
import {
  createRoot,
} from "react-dom/client";
import './App.css';
import { Button } from './components/Button';
export { helper } from '@scope/utils';
export * from '@scope/utils/deep';
const text = "import nope from 'fake'";
"#;
        let specs = scan_specifiers(source);
        assert_eq!(
            specs,
            vec![
                "react",
                "react-dom/client",
                "./App.css",
                "./components/Button",
                "@scope/utils",
                "@scope/utils/deep",
            ]
        );
    }

    #[test]
    fn test_scan_relative() {
        let source = "import a from './a';\nimport b from 'b';\nimport c from '../c.js';\n";
        assert_eq!(scan_relative(source), vec!["./a", "../c.js"]);
    }

    #[test]
    fn test_is_bare_specifier() {
        assert!(is_bare_specifier("react"));
        assert!(is_bare_specifier("@scope/pkg"));
        assert!(!is_bare_specifier("./local"));
        assert!(!is_bare_specifier("../parent"));
        assert!(!is_bare_specifier("/absolute"));
        assert!(!is_bare_specifier("node:fs"));
        assert!(!is_bare_specifier("data:text/javascript,1"));
        assert!(!is_bare_specifier(""));
    }

    #[test]
    fn test_package_name_and_subpath() {
        assert_eq!(package_name("react"), "react");
        assert_eq!(package_name("react/jsx-runtime"), "react");
        assert_eq!(package_name("@scope/pkg"), "@scope/pkg");
        assert_eq!(package_name("@scope/pkg/utils/x"), "@scope/pkg");
        assert_eq!(subpath("react/jsx-runtime"), Some("jsx-runtime"));
        assert_eq!(subpath("@scope/pkg/utils"), Some("utils"));
        assert_eq!(subpath("@scope/pkg"), None);
        assert_eq!(subpath("react"), None);
    }
}
