//! Dev server over real HTTP on an ephemeral port.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use urja_core::config::ServerConfig;
use urja_core::dev::RunningServer;
use urja_core::{default_engine, BuildConfig, DevServer, Engine, NativeEngine};

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "package.json", r#"{"dependencies":{"lib":"1.0.0"}}"#);
    write(dir.path(), "node_modules/lib/index.js", "exports.hello = 1;\n");
    write(
        dir.path(),
        "public/index.html",
        "<!doctype html><script type=\"module\" src=\"/src/main.js\"></script>\n",
    );
    write(dir.path(), "public/logo.txt", "logo");
    write(
        dir.path(),
        "src/main.js",
        "import { hello } from 'lib';\nconsole.log(hello, process.env.NODE_ENV);\n",
    );
    write(dir.path(), "src/style.css", ".a { color: red; }\n");
    dir
}

async fn start(root: &Path) -> RunningServer {
    start_with(root, Arc::new(NativeEngine::new())).await
}

async fn start_with(root: &Path, engine: Arc<dyn Engine>) -> RunningServer {
    let mut config = BuildConfig::new(root).with_entry("src/main.js");
    config.server = Some(ServerConfig {
        port: Some(0),
        host: None,
    });
    DevServer::new(config, engine)
        .watch(false)
        .start()
        .await
        .unwrap()
}

async fn get(server: &RunningServer, path: &str) -> reqwest::Response {
    reqwest::get(format!("http://{}{path}", server.local_addr()))
        .await
        .unwrap()
}

fn content_type(res: &reqwest::Response) -> String {
    res.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_serves_index_and_public_files() {
    let dir = project();
    let server = start(dir.path()).await;

    let index = get(&server, "/").await;
    assert_eq!(index.status(), 200);
    assert!(content_type(&index).starts_with("text/html"));
    assert!(index.text().await.unwrap().contains("/src/main.js"));

    let logo = get(&server, "/logo.txt").await;
    assert_eq!(logo.status(), 200);
    assert_eq!(logo.text().await.unwrap(), "logo");

    server.shutdown();
}

#[tokio::test]
async fn test_missing_index_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;

    assert_eq!(get(&server, "/").await.status(), 404);

    server.shutdown();
}

#[tokio::test]
async fn test_transforms_scripts_on_request() {
    let dir = project();
    let server = start(dir.path()).await;
    assert_eq!(server.prebundle().bundled.len(), 1);

    let res = get(&server, "/src/main.js").await;
    assert_eq!(res.status(), 200);
    assert_eq!(content_type(&res), "application/javascript");
    let code = res.text().await.unwrap();
    assert!(code.contains("/@urja-deps/lib.js"));
    assert!(code.contains("\"development\""));
    assert!(!code.contains("from 'lib'"));

    let css = get(&server, "/src/style.css").await;
    assert_eq!(css.status(), 200);
    assert_eq!(content_type(&css), "text/css");

    server.shutdown();
}

#[tokio::test]
async fn test_serves_prebundled_dependencies() {
    let dir = project();
    let server = start(dir.path()).await;

    let res = get(&server, "/@urja-deps/lib.js").await;
    assert_eq!(res.status(), 200);
    assert_eq!(content_type(&res), "application/javascript");
    assert!(res.text().await.unwrap().contains("hello"));

    assert_eq!(get(&server, "/@urja-deps/absent.js").await.status(), 404);

    server.shutdown();
}

#[tokio::test]
async fn test_request_failures_are_not_found() {
    let dir = project();
    write(dir.path(), "src/broken.js", "function broken( {\n");
    let server = start(dir.path()).await;

    assert_eq!(get(&server, "/src/nope.js").await.status(), 404);
    assert_eq!(get(&server, "/src/broken.js").await.status(), 404);
    assert_eq!(get(&server, "/@react-refresh").await.status(), 404);

    server.shutdown();
}

#[tokio::test]
async fn test_react_refresh_runtime_is_wrapped_as_module() {
    let dir = project();
    write(
        dir.path(),
        "node_modules/react-refresh/cjs/react-refresh-runtime.development.js",
        "exports.injectIntoGlobalHook = function () {};\n",
    );
    let server = start(dir.path()).await;

    let res = get(&server, "/@react-refresh").await;
    assert_eq!(res.status(), 200);
    let code = res.text().await.unwrap();
    assert!(code.contains("exports.injectIntoGlobalHook"));
    assert!(code.trim_end().ends_with("export default module.exports;"));

    server.shutdown();
}

#[tokio::test]
async fn test_serves_tsx_components() {
    let dir = project();
    write(
        dir.path(),
        "src/types.tsx",
        "export interface Props {\n  name: string;\n}\nexport const greeting = 'hi';\n",
    );
    write(
        dir.path(),
        "src/App.tsx",
        "import type { Props } from './types';\n\
         export default function App({ name }: Props) {\n  return <h1>Hello, {name}!</h1>;\n}\n",
    );
    let server = start_with(dir.path(), default_engine()).await;

    let types = get(&server, "/src/types.tsx").await;
    assert_eq!(types.status(), 200);
    assert_eq!(content_type(&types), "application/javascript");
    let code = types.text().await.unwrap();
    assert!(code.contains("$RefreshReg$"));
    assert!(code.contains("greeting"));
    assert!(!code.contains("interface"));

    let app = get(&server, "/src/App.tsx").await;
    if cfg!(feature = "swc") {
        assert_eq!(app.status(), 200);
        let code = app.text().await.unwrap();
        assert!(!code.contains("<h1>"));
        assert!(!code.contains(": Props"));
        assert!(code.contains("react/jsx-runtime"));
    } else {
        // The native engine has no JSX transform and refuses markup.
        assert_eq!(app.status(), 404);
    }

    server.shutdown();
}
