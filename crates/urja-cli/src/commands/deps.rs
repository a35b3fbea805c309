//! `urja deps`: pre-bundle the bare imports reachable from entry files.

use miette::{IntoDiagnostic, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use urja_core::{default_engine, DependencyPreBundler};

#[derive(Debug, Clone)]
pub struct DepsAction {
    /// Project root.
    pub cwd: PathBuf,
    pub entries: Vec<PathBuf>,
    /// Print the specifier → file map as JSON.
    pub json: bool,
}

pub async fn run(action: DepsAction) -> Result<()> {
    let prebundler = DependencyPreBundler::new(action.cwd.clone(), default_engine());
    let deps = prebundler.scan_recursive(&action.entries);
    if deps.is_empty() {
        println!("  no bare imports found");
        return Ok(());
    }

    let result = prebundler.pre_bundle(&deps).await.into_diagnostic()?;
    if action.json {
        let map: BTreeMap<&str, String> = result
            .entries()
            .map(|e| (e.specifier.as_str(), e.output.display().to_string()))
            .collect();
        println!("{}", serde_json::to_string(&map).into_diagnostic()?);
    } else {
        for entry in result.entries() {
            println!("  {} -> {}", entry.specifier, entry.output.display());
        }
        for failed in &result.failed {
            println!("  {} failed: {}", failed.specifier, failed.reason);
        }
        if result.is_cache_hit() {
            println!("  (cached)");
        }
    }

    if result.failed.is_empty() {
        Ok(())
    } else {
        Err(miette::miette!(
            "{} of {} dependencies failed to pre-bundle",
            result.failed.len(),
            deps.len()
        ))
    }
}
