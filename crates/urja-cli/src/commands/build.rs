//! `urja build`: run the production pipeline once.

use super::load_config;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use urja_core::{default_engine, Mode, PipelineExecutor};

#[derive(Debug, Clone)]
pub struct BuildAction {
    /// Config file path.
    pub config: PathBuf,
    /// Mode override.
    pub mode: Option<Mode>,
    /// Print a JSON summary instead of the human one.
    pub json: bool,
}

/// JSON summary printed on success.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildResultJson {
    ok: bool,
    mode: Mode,
    out_dir: String,
    modules: usize,
    cached: bool,
    /// Relative path → bytes.
    files: BTreeMap<String, u64>,
    duration_ms: u128,
}

pub async fn run(action: BuildAction) -> Result<()> {
    let start = Instant::now();

    let mut config = load_config(&action.config)?;
    if let Some(mode) = action.mode {
        config.mode = mode;
    }
    let out_dir = config.out_path();
    let mode = config.mode;

    let executor = PipelineExecutor::with_engine(default_engine());
    let ctx = executor
        .execute(config)
        .await
        .into_diagnostic()
        .wrap_err("build failed")?;

    let duration_ms = start.elapsed().as_millis();
    let files: BTreeMap<String, u64> = ctx
        .manifest()
        .map(|m| m.files.iter().map(|(f, e)| (f.clone(), e.bytes)).collect())
        .unwrap_or_default();

    if action.json {
        let summary = BuildResultJson {
            ok: true,
            mode,
            out_dir: out_dir.display().to_string(),
            modules: ctx.module_graph().len(),
            cached: ctx.cache_hit(),
            files,
            duration_ms,
        };
        println!("{}", serde_json::to_string(&summary).into_diagnostic()?);
        return Ok(());
    }

    let cached = if ctx.cache_hit() { ", cached" } else { "" };
    println!(
        "  {} build -> {} ({} modules{cached}, {duration_ms}ms)",
        mode,
        out_dir.display(),
        ctx.module_graph().len(),
    );
    for (file, bytes) in &files {
        #[allow(clippy::cast_precision_loss)]
        let size_kb = *bytes as f64 / 1024.0;
        println!("    {file} ({size_kb:.1}KB)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_build_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.js"), "console.log('cli');\n").unwrap();
        let config = dir.path().join("urja.config.json");
        fs::write(&config, r#"{"entry":["src/main.js"],"outDir":"out"}"#).unwrap();

        run(BuildAction {
            config,
            mode: Some(Mode::Production),
            json: true,
        })
        .await
        .unwrap();

        assert!(dir.path().join("out/main.js").is_file());
        assert!(dir.path().join("out/manifest.json").is_file());
    }

    #[tokio::test]
    async fn test_missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(BuildAction {
            config: dir.path().join("urja.config.json"),
            mode: None,
            json: false,
        })
        .await;
        assert!(result.is_err());
    }
}
