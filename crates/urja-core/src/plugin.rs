//! Source transform plugins.
//!
//! The dev server and the pipeline's Transformer step run every loaded
//! source through a [`PluginChain`]. Plugins are applied in registration
//! order; each one may rewrite the code or pass it through by returning
//! `Ok(None)`.
//!
//! ```ignore
//! struct Banner;
//!
//! impl TransformPlugin for Banner {
//!     fn name(&self) -> &str { "banner" }
//!
//!     fn transform(&self, code: &str, _id: &str) -> PluginResult<Option<String>> {
//!         Ok(Some(format!("/* built by urja */\n{code}")))
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Result type for plugin hooks.
pub type PluginResult<T> = Result<T, PluginError>;

/// Error from a plugin.
#[derive(Error, Debug)]
#[error("[{plugin}] {message}")]
pub struct PluginError {
    /// Plugin name that caused the error.
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// A source-to-source rewrite.
pub trait TransformPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite `code` loaded from `id`, or return `Ok(None)` to leave it as is.
    fn transform(&self, code: &str, id: &str) -> PluginResult<Option<String>>;
}

/// Ordered list of plugins.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn TransformPlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin; it runs after every plugin already registered.
    pub fn register(&mut self, plugin: Arc<dyn TransformPlugin>) {
        self.plugins.push(plugin);
    }

    #[must_use]
    pub fn with(mut self, plugin: impl TransformPlugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Append every plugin of `other`, keeping its order.
    pub fn extend(&mut self, other: &PluginChain) {
        self.plugins.extend(other.plugins.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin names in run order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run every plugin over `code`; the first error stops the chain.
    pub fn transform(&self, code: &str, id: &str) -> PluginResult<String> {
        let mut current = code.to_string();
        for plugin in &self.plugins {
            if let Some(next) = plugin.transform(&current, id)? {
                current = next;
            }
        }
        Ok(current)
    }
}

impl std::fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChain")
            .field("plugins", &self.names())
            .finish()
    }
}

/// Literal string replacements, e.g. `process.env.NODE_ENV` → `"development"`.
#[derive(Debug, Clone, Default)]
pub struct DefinePlugin {
    replacements: BTreeMap<String, String>,
}

impl DefinePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn replace(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replacements.insert(from.into(), to.into());
        self
    }

    /// Replace `process.env.KEY` with the JSON string of `value`.
    #[must_use]
    pub fn env(self, key: &str, value: &str) -> Self {
        let quoted = serde_json::Value::from(value).to_string();
        self.replace(format!("process.env.{key}"), quoted)
    }
}

impl TransformPlugin for DefinePlugin {
    fn name(&self) -> &str {
        "define"
    }

    fn transform(&self, code: &str, _id: &str) -> PluginResult<Option<String>> {
        let mut result = None::<String>;
        for (from, to) in &self.replacements {
            let current = result.as_deref().unwrap_or(code);
            if current.contains(from.as_str()) {
                result = Some(current.replace(from.as_str(), to));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Suffix(&'static str);

    impl TransformPlugin for Suffix {
        fn name(&self) -> &str {
            self.0
        }

        fn transform(&self, code: &str, _id: &str) -> PluginResult<Option<String>> {
            Ok(Some(format!("{code}{}", self.0)))
        }
    }

    struct Fails;

    impl TransformPlugin for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn transform(&self, _code: &str, id: &str) -> PluginResult<Option<String>> {
            Err(PluginError::new("fails", format!("cannot handle {id}")))
        }
    }

    #[test]
    fn test_chain_runs_in_registration_order() {
        let chain = PluginChain::new().with(Suffix("-a")).with(Suffix("-b"));
        assert_eq!(chain.names(), vec!["-a", "-b"]);
        assert_eq!(chain.transform("x", "/src/x.js").unwrap(), "x-a-b");
    }

    #[test]
    fn test_chain_stops_on_error() {
        let chain = PluginChain::new().with(Fails).with(Suffix("-never"));
        let err = chain.transform("x", "/src/x.js").unwrap_err();
        assert_eq!(err.to_string(), "[fails] cannot handle /src/x.js");
    }

    #[test]
    fn test_define_plugin() {
        let plugin = DefinePlugin::new()
            .env("NODE_ENV", "development")
            .replace("__DEV__", "true");

        let out = plugin
            .transform("if (__DEV__) log(process.env.NODE_ENV);", "a.js")
            .unwrap()
            .unwrap();
        assert_eq!(out, "if (true) log(\"development\");");

        assert!(plugin.transform("plain", "a.js").unwrap().is_none());
    }
}
