use crate::config::FederationConfig;
use crate::plugin::{PluginResult, TransformPlugin};
use regex_lite::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

/// First line of [`FEDERATION_RUNTIME_JS`]; marks code that already carries the runtime.
pub const RUNTIME_MARKER: &str = "// urja federation runtime";

/// Browser runtime prepended to host modules that import remotes.
///
/// Script loads are shared per URL and container init is shared per scope,
/// so concurrent `loadRemote` calls inject one `<script>` and call
/// `container.init` once. A failed load or init is forgotten so a later
/// call can retry.
pub const FEDERATION_RUNTIME_JS: &str = r"// urja federation runtime
const __urja_share_scope = globalThis.__urja_share_scope || (globalThis.__urja_share_scope = {});
const __urja_loading = globalThis.__urja_loading || (globalThis.__urja_loading = new Map());
const __urja_init = globalThis.__urja_init || (globalThis.__urja_init = new Map());

function __urja_load_script(url) {
  let pending = __urja_loading.get(url);
  if (!pending) {
    pending = new Promise((resolve, reject) => {
      const script = document.createElement('script');
      script.src = url;
      script.type = 'text/javascript';
      script.async = true;
      script.onload = () => resolve();
      script.onerror = () => {
        __urja_loading.delete(url);
        reject(new Error(`Failed to load remote entry: ${url}`));
      };
      document.head.appendChild(script);
    });
    __urja_loading.set(url, pending);
  }
  return pending;
}

function __urja_init_remote(scope, container) {
  let pending = __urja_init.get(scope);
  if (!pending) {
    pending = Promise.resolve()
      .then(() => container.init(__urja_share_scope))
      .catch((err) => {
        __urja_init.delete(scope);
        throw err;
      });
    __urja_init.set(scope, pending);
  }
  return pending;
}

async function loadRemote(url, scope, module) {
  if (!window[scope]) {
    await __urja_load_script(url);
  }
  const container = window[scope];
  if (!container) {
    throw new Error(`Remote container '${scope}' was not found after loading ${url}`);
  }
  await __urja_init_remote(scope, container);
  const factory = await container.get(module);
  return factory();
}

function registerShared(name, version, factory) {
  const versions = __urja_share_scope[name] || (__urja_share_scope[name] = {});
  versions[version] = { loaded: false, get: factory };
}
";

fn import_statement() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^[ \t]*import\s+(?:([^'"\n;]+?)\s+from\s+)?['"]([^'"\n]+)['"][ \t]*;?"#)
            .ok()
    })
    .as_ref()
}

/// Quote `s` as a single-quoted JavaScript string.
fn js_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Output name of an exposed module (`./Button` → `__federation_expose_Button`).
pub fn expose_chunk_name(key: &str) -> String {
    let trimmed = key.trim_start_matches("./");
    let sanitized: String = trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("__federation_expose_{sanitized}")
}

/// Container script for a remote.
///
/// `files` maps each exposed key to the file the bundler wrote for it,
/// relative to the remote entry.
pub fn remote_entry_source(config: &FederationConfig, files: &BTreeMap<String, String>) -> String {
    let manifest = serde_json::json!({
        "name": config.name,
        "exposes": config.exposes.keys().collect::<Vec<_>>(),
        "shared": config.shared,
    });

    let mut module_map = String::new();
    for (key, file) in files {
        let _ = writeln!(
            module_map,
            "    {}: () => import({}).then((m) => () => m),",
            js_str(key),
            js_str(&format!("./{file}"))
        );
    }

    format!(
        r"window[{scope}] = (function () {{
  const moduleMap = {{
{module_map}  }};
  let shareScope = null;
  return {{
    manifest: {manifest},
    init(scope) {{
      shareScope = scope;
      return Promise.resolve();
    }},
    get(module) {{
      const load = moduleMap[module];
      if (!load) {{
        return Promise.reject(new Error(`Module ${{module}} does not exist in container {name}`));
      }}
      return load();
    }},
  }};
}})();
",
        scope = js_str(&config.name),
        name = config.name,
    )
}

/// Rewrites imports of configured remotes into `loadRemote` calls.
#[derive(Debug, Clone)]
pub struct FederationPlugin {
    config: FederationConfig,
}

impl FederationPlugin {
    pub fn new(config: FederationConfig) -> Self {
        Self { config }
    }

    /// Remote name and in-container module of a specifier, if it targets a remote.
    fn remote_target<'a>(&'a self, specifier: &'a str) -> Option<(&'a str, &'a str, String)> {
        let (remote, rest) = match specifier.split_once('/') {
            Some((remote, rest)) => (remote, rest),
            None => (specifier, ""),
        };
        let (name, url) = self.config.remotes.get_key_value(remote)?;
        let module = if rest.is_empty() {
            ".".to_string()
        } else {
            format!("./{rest}")
        };
        Some((name.as_str(), url.as_str(), module))
    }

    fn shared_registrations(&self) -> String {
        let mut out = String::new();
        for (name, version) in &self.config.shared {
            let _ = writeln!(
                out,
                "registerShared({}, {}, () => import({}));",
                js_str(name),
                js_str(version),
                js_str(name)
            );
        }
        out
    }
}

/// Replacement for one import statement.
fn rewrite_import(bindings: Option<&str>, call: &str, index: usize) -> String {
    let Some(bindings) = bindings.map(str::trim).filter(|b| !b.is_empty()) else {
        return format!("{call};");
    };

    if let Some(ns) = bindings.strip_prefix("* as ") {
        return format!("const {} = {call};", ns.trim());
    }

    let (default, named) = match bindings.find('{') {
        Some(idx) => {
            let default = bindings[..idx].trim().trim_end_matches(',').trim();
            (default, Some(&bindings[idx..]))
        }
        None => (bindings, None),
    };

    let named = named.map(|n| n.replace(" as ", ": "));
    match (default.is_empty(), named) {
        (false, None) => format!("const {default} = ({call}).default;"),
        (true, Some(named)) => format!("const {named} = {call};"),
        (false, Some(named)) => {
            let tmp = format!("__urja_remote_{index}");
            format!("const {tmp} = {call}; const {default} = {tmp}.default; const {named} = {tmp};")
        }
        (true, None) => format!("{call};"),
    }
}

impl TransformPlugin for FederationPlugin {
    fn name(&self) -> &str {
        "federation"
    }

    fn transform(&self, code: &str, _id: &str) -> PluginResult<Option<String>> {
        if !self.config.is_host() {
            return Ok(None);
        }
        let Some(re) = import_statement() else {
            return Ok(None);
        };

        let mut out = String::with_capacity(code.len());
        let mut last = 0;
        let mut rewrites = 0;
        for caps in re.captures_iter(code) {
            let (Some(whole), Some(spec)) = (caps.get(0), caps.get(2)) else {
                continue;
            };
            let Some((remote, url, module)) = self.remote_target(spec.as_str()) else {
                continue;
            };
            let call = format!(
                "await loadRemote({}, {}, {})",
                js_str(url),
                js_str(remote),
                js_str(&module)
            );
            out.push_str(&code[last..whole.start()]);
            out.push_str(&rewrite_import(caps.get(1).map(|m| m.as_str()), &call, rewrites));
            last = whole.end();
            rewrites += 1;
        }

        if rewrites == 0 {
            return Ok(None);
        }
        out.push_str(&code[last..]);

        if code.contains(RUNTIME_MARKER) {
            return Ok(Some(out));
        }
        Ok(Some(format!(
            "{FEDERATION_RUNTIME_JS}{}\n{out}",
            self.shared_registrations()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> FederationPlugin {
        FederationPlugin::new(
            FederationConfig::new("host")
                .remote("remote_app", "http://localhost:3001/remoteEntry.js")
                .share("react", "18.2.0"),
        )
    }

    #[test]
    fn test_expose_chunk_name() {
        assert_eq!(expose_chunk_name("./Button"), "__federation_expose_Button");
        assert_eq!(
            expose_chunk_name("./widgets/Card-v2"),
            "__federation_expose_widgets_Card_v2"
        );
    }

    #[test]
    fn test_remote_entry_source() {
        let config = FederationConfig::new("remote_app").expose("./Button", "./src/Button.js");
        let mut files = BTreeMap::new();
        files.insert(
            "./Button".to_string(),
            "__federation_expose_Button.js".to_string(),
        );

        let src = remote_entry_source(&config, &files);
        assert!(src.starts_with("window['remote_app'] = "));
        assert!(src.contains("'./Button': () => import('./__federation_expose_Button.js')"));
        assert!(src.contains(r#""exposes":["./Button"]"#));
        assert!(src.contains("init(scope)"));
        assert!(src.contains("get(module)"));
    }

    #[test]
    fn test_rewrites_default_named_and_namespace_imports() {
        let code = "import React from 'react';\n\
                    import Button from 'remote_app/Button';\n\
                    import { Card, Row as R } from 'remote_app/layout';\n\
                    import * as Utils from \"remote_app/utils\";\n\
                    import Theme, { dark } from 'remote_app/theme';\n\
                    import 'remote_app/styles';\n";

        let out = host().transform(code, "/src/main.js").unwrap().unwrap();
        assert!(out.starts_with(RUNTIME_MARKER));
        assert!(out.contains("registerShared('react', '18.2.0', () => import('react'));"));
        assert!(out.contains("import React from 'react';"));

        let url = "'http://localhost:3001/remoteEntry.js', 'remote_app'";
        assert!(out.contains(&format!(
            "const Button = (await loadRemote({url}, './Button')).default;"
        )));
        assert!(out.contains(&format!(
            "const {{ Card, Row: R }} = await loadRemote({url}, './layout');"
        )));
        assert!(out.contains(&format!(
            "const Utils = await loadRemote({url}, './utils');"
        )));
        assert!(out.contains(&format!(
            "const __urja_remote_3 = await loadRemote({url}, './theme'); const Theme = __urja_remote_3.default; const {{ dark }} = __urja_remote_3;"
        )));
        assert!(out.contains(&format!("await loadRemote({url}, './styles');")));
    }

    #[test]
    fn test_runtime_prepended_once() {
        let plugin = host();
        let once = plugin
            .transform("import A from 'remote_app/A';\n", "a.js")
            .unwrap()
            .unwrap();
        let twice = plugin
            .transform(&format!("{once}import B from 'remote_app/B';\n"), "a.js")
            .unwrap()
            .unwrap();
        assert_eq!(twice.matches(RUNTIME_MARKER).count(), 1);
    }

    #[test]
    fn test_leaves_unrelated_code_alone() {
        assert!(host()
            .transform("import x from 'remote_application';\n", "a.js")
            .unwrap()
            .is_none());

        let remote_only = FederationPlugin::new(
            FederationConfig::new("remote_app").expose("./Button", "./src/Button.js"),
        );
        assert!(remote_only
            .transform("import B from 'remote_app/Button';", "a.js")
            .unwrap()
            .is_none());
    }
}
