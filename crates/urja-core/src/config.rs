//! Build configuration.
//!
//! `BuildConfig` is produced outside the core (CLI flags, config files) and
//! consumed read-only by the pipeline, the pre-bundler and the dev server.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default whole-pipeline budget.
pub const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default dev server port.
pub const DEFAULT_PORT: u16 = 5173;

/// Build mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
    Test,
}

impl Mode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(format!("unknown mode '{other}' (expected development, production or test)")),
        }
    }
}

/// Target platform for emitted bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Browser,
    Node,
    Edge,
}

impl Platform {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Node => "node",
            Self::Edge => "edge",
        }
    }
}

/// Module federation descriptor.
///
/// A config with `exposes` produces a remote entry; a config with `remotes`
/// consumes other remotes at run time. Both may be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    /// Global name of this container (`window[name]`).
    pub name: String,
    /// Remote entry file name inside `outDir`.
    #[serde(default = "default_remote_entry")]
    pub filename: String,
    /// Exposed module key (`./Button`) → source path relative to root.
    #[serde(default)]
    pub exposes: BTreeMap<String, String>,
    /// Remote name → URL of its remote entry script.
    #[serde(default)]
    pub remotes: BTreeMap<String, String>,
    /// Shared dependency name → version.
    #[serde(default)]
    pub shared: BTreeMap<String, String>,
}

fn default_remote_entry() -> String {
    "remoteEntry.js".to_string()
}

impl FederationConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: default_remote_entry(),
            exposes: BTreeMap::new(),
            remotes: BTreeMap::new(),
            shared: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn expose(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.exposes.insert(key.into(), path.into());
        self
    }

    #[must_use]
    pub fn remote(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.remotes.insert(name.into(), url.into());
        self
    }

    #[must_use]
    pub fn share(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.shared.insert(name.into(), version.into());
        self
    }

    /// Whether this build produces a remote entry.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !self.exposes.is_empty()
    }

    /// Whether this build consumes remotes.
    #[must_use]
    pub fn is_host(&self) -> bool {
        !self.remotes.is_empty()
    }
}

/// CSS sub-config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CssConfig {
    /// Minify emitted CSS. Defaults to the build's minify setting.
    pub minify: Option<bool>,
}

/// Build sub-config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptionsConfig {
    /// Whole-pipeline budget in milliseconds.
    pub timeout_ms: Option<u64>,
    pub minify: Option<bool>,
    pub sourcemap: Option<bool>,
    /// Reuse build artifacts when inputs are unchanged.
    pub cache: Option<bool>,
}

/// Dev server sub-config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// Immutable per-build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Project root. Relative roots are resolved against the config file.
    #[serde(default)]
    pub root: PathBuf,
    /// Entry files relative to `root`.
    #[serde(default)]
    pub entry: Vec<String>,
    #[serde(default)]
    pub mode: Mode,
    /// Output directory relative to `root`.
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<FederationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<CssConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildOptionsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

fn default_out_dir() -> String {
    "dist".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl BuildConfig {
    /// Create a config rooted at `root` with no entries.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entry: Vec::new(),
            mode: Mode::default(),
            out_dir: default_out_dir(),
            platform: Platform::default(),
            port: DEFAULT_PORT,
            federation: None,
            css: None,
            build: None,
            server: None,
        }
    }

    /// Load a config from an explicit JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or(Path::new("."));
        if config.root.as_os_str().is_empty() {
            config.root = base.to_path_buf();
        } else if config.root.is_relative() {
            config.root = base.join(&config.root);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry.push(entry.into());
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_out_dir(mut self, out_dir: impl Into<String>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_federation(mut self, federation: FederationConfig) -> Self {
        self.federation = Some(federation);
        self
    }

    #[must_use]
    pub fn with_build_options(mut self, build: BuildOptionsConfig) -> Self {
        self.build = Some(build);
        self
    }

    /// Absolute output directory.
    #[must_use]
    pub fn out_path(&self) -> PathBuf {
        self.root.join(&self.out_dir)
    }

    /// Whole-pipeline budget.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Duration {
        self.build
            .as_ref()
            .and_then(|b| b.timeout_ms)
            .map_or(DEFAULT_PIPELINE_TIMEOUT, Duration::from_millis)
    }

    #[must_use]
    pub fn minify(&self) -> bool {
        self.build
            .as_ref()
            .and_then(|b| b.minify)
            .unwrap_or_else(|| self.mode.is_production())
    }

    #[must_use]
    pub fn sourcemap(&self) -> bool {
        self.build
            .as_ref()
            .and_then(|b| b.sourcemap)
            .unwrap_or_else(|| !self.mode.is_production())
    }

    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.build.as_ref().and_then(|b| b.cache).unwrap_or(true)
    }

    #[must_use]
    pub fn css_minify(&self) -> bool {
        self.css
            .as_ref()
            .and_then(|c| c.minify)
            .unwrap_or_else(|| self.minify())
    }

    #[must_use]
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(self.port)
    }

    /// Bind host; `localhost` maps to the IPv4 loopback.
    #[must_use]
    pub fn server_host(&self) -> String {
        match self.server.as_ref().and_then(|s| s.host.as_deref()) {
            None | Some("localhost") => "127.0.0.1".to_string(),
            Some(host) => host.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("production".parse::<Mode>(), Ok(Mode::Production));
        assert_eq!("test".parse::<Mode>().map(|m| m.as_str()), Ok("test"));
        assert!("prod".parse::<Mode>().is_err());
    }

    #[test]
    fn test_from_json_file_resolves_relative_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urja.config.json");
        std::fs::write(
            &path,
            r#"{
                "root": "app",
                "entry": ["src/main.js"],
                "mode": "production",
                "federation": {
                    "name": "remote_app",
                    "exposes": { "./Button": "./src/Button.js" }
                }
            }"#,
        )
        .unwrap();

        let config = BuildConfig::from_json_file(&path).unwrap();
        assert_eq!(config.root, dir.path().join("app"));
        assert_eq!(config.entry, vec!["src/main.js"]);
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(config.out_dir, "dist");
        assert_eq!(config.port, DEFAULT_PORT);

        let federation = config.federation.unwrap();
        assert_eq!(federation.filename, "remoteEntry.js");
        assert!(federation.is_remote());
        assert!(!federation.is_host());
    }

    #[test]
    fn test_from_json_file_missing_root_uses_config_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urja.config.json");
        std::fs::write(&path, r#"{"entry": ["src/main.ts"]}"#).unwrap();

        let config = BuildConfig::from_json_file(&path).unwrap();
        assert_eq!(config.root, dir.path());
    }

    #[test]
    fn test_from_json_file_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            BuildConfig::from_json_file(&missing),
            Err(Error::ConfigRead { .. })
        ));

        let invalid = dir.path().join("bad.json");
        std::fs::write(&invalid, "{ not json").unwrap();
        assert!(matches!(
            BuildConfig::from_json_file(&invalid),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_mode_driven_defaults() {
        let dev = BuildConfig::new("/project");
        assert!(!dev.minify());
        assert!(dev.sourcemap());
        assert!(dev.cache_enabled());
        assert_eq!(dev.pipeline_timeout(), DEFAULT_PIPELINE_TIMEOUT);

        let prod = BuildConfig::new("/project").with_mode(Mode::Production);
        assert!(prod.minify());
        assert!(!prod.sourcemap());
        assert!(prod.css_minify());
    }

    #[test]
    fn test_build_options_override() {
        let config = BuildConfig::new("/project").with_build_options(BuildOptionsConfig {
            timeout_ms: Some(1500),
            minify: Some(true),
            sourcemap: Some(false),
            cache: Some(false),
        });
        assert_eq!(config.pipeline_timeout(), Duration::from_millis(1500));
        assert!(config.minify());
        assert!(!config.sourcemap());
        assert!(!config.cache_enabled());
    }

    #[test]
    fn test_server_host_maps_localhost() {
        let mut config = BuildConfig::new("/project");
        assert_eq!(config.server_host(), "127.0.0.1");
        config.server = Some(ServerConfig {
            port: Some(4000),
            host: Some("0.0.0.0".to_string()),
        });
        assert_eq!(config.server_host(), "0.0.0.0");
        assert_eq!(config.server_port(), 4000);
    }
}
