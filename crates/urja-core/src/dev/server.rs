//! HTTP and WebSocket surface of the dev server.

use super::hmr::{client_frame, HmrBroadcaster};
use super::transform::{ModuleTransformer, RequestError, ServeKind};
use super::watch::spawn_watcher;
use crate::config::BuildConfig;
use crate::engine::Engine;
use crate::error::Error;
use crate::federation::FederationPlugin;
use crate::plugin::{DefinePlugin, PluginChain, TransformPlugin};
use crate::prebundle::{scan_bare_imports, DependencyPreBundler, PreBundleResult, DEPS_URL_PREFIX};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use notify::RecommendedWatcher;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// WebSocket endpoint HMR clients connect to.
pub const HMR_PATH: &str = "/__hmr";

/// Virtual module serving the fast-refresh runtime as ESM.
pub const REACT_REFRESH_PATH: &str = "/@react-refresh";

/// CommonJS runtime wrapped for [`REACT_REFRESH_PATH`], relative to the root.
pub const REACT_REFRESH_RUNTIME: &str =
    "node_modules/react-refresh/cjs/react-refresh-runtime.development.js";

const JS: &str = "application/javascript";

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        debug!(error = %self, "request failed");
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Content type for static files.
fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") => JS,
        Some("css") => "text/css",
        _ => "application/octet-stream",
    }
}

fn ok(content_type: &'static str, body: impl IntoResponse) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// `path` joined onto `base`, or `None` when it would escape `base`.
fn contained(base: &Path, path: &str) -> Option<PathBuf> {
    let rel = Path::new(path);
    rel.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| base.join(rel))
}

async fn read(path: &Path) -> Result<Vec<u8>, RequestError> {
    tokio::fs::read(path).await.map_err(|source| RequestError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
struct DevState {
    root: PathBuf,
    cache_dir: PathBuf,
    transformer: Arc<ModuleTransformer>,
    hmr: HmrBroadcaster,
}

type AppState = Arc<DevState>;

fn router(state: AppState) -> Router {
    Router::new()
        .route(HMR_PATH, get(hmr_socket))
        .route("/", get(serve_index))
        .route("/*path", get(serve_path))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn serve_index(State(state): State<AppState>) -> Response {
    match tokio::fs::read(state.root.join("public").join("index.html")).await {
        Ok(html) => ok("text/html; charset=utf-8", html),
        Err(_) => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "index.html not found",
        )
            .into_response(),
    }
}

async fn serve_path(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, RequestError> {
    let not_found = || RequestError::NotFound {
        path: format!("/{path}"),
    };

    if format!("/{path}") == REACT_REFRESH_PATH {
        let runtime = read(&state.root.join(REACT_REFRESH_RUNTIME)).await?;
        let runtime = String::from_utf8_lossy(&runtime);
        let wrapped = format!(
            "const process = {{ env: {{ NODE_ENV: 'development' }} }};\nconst exports = {{}};\nconst module = {{ exports }};\n{runtime}\nexport default module.exports;\n"
        );
        return Ok(ok(JS, wrapped));
    }

    if let Some(file) = path.strip_prefix(DEPS_URL_PREFIX.trim_start_matches('/')) {
        let target = contained(&state.cache_dir, file).ok_or_else(not_found)?;
        return Ok(ok(JS, read(&target).await?));
    }

    if let Some(public) = contained(&state.root.join("public"), &path).filter(|p| p.is_file()) {
        return Ok(ok(content_type(&public), read(&public).await?));
    }

    let file = contained(&state.root, &path)
        .filter(|p| p.is_file())
        .ok_or_else(not_found)?;
    match ServeKind::from_path(&file) {
        ServeKind::Raw => Ok(ok(content_type(&file), read(&file).await?)),
        _ => {
            let module = state.transformer.transform_file(&file).await?;
            Ok(ok(module.content_type, module.code))
        }
    }
}

async fn hmr_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.hmr.subscribe();
    ws.on_upgrade(move |socket| forward_hmr(socket, rx))
}

/// Forward broadcasts until the client leaves or the channel closes.
async fn forward_hmr(mut socket: WebSocket, mut rx: broadcast::Receiver<Arc<str>>) {
    debug!("hmr client connected");
    loop {
        tokio::select! {
            msg = rx.recv() => {
                if let Err(broadcast::error::RecvError::Lagged(skipped)) = &msg {
                    debug!(skipped, "hmr client lagged, requesting full reload");
                }
                let Some(frame) = client_frame(msg) else {
                    break;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("hmr client disconnected");
}

/// Development server: serves transformed modules on demand and pushes HMR messages.
pub struct DevServer {
    config: BuildConfig,
    engine: Arc<dyn Engine>,
    plugins: PluginChain,
    watch: bool,
}

impl DevServer {
    pub fn new(config: BuildConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            config,
            engine,
            plugins: PluginChain::new(),
            watch: true,
        }
    }

    /// Append a transform plugin. Plugins run in registration order.
    #[must_use]
    pub fn plugin(mut self, plugin: impl TransformPlugin + 'static) -> Self {
        self.plugins.register(Arc::new(plugin));
        self
    }

    /// Enable or disable the file watcher.
    #[must_use]
    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Pre-bundle entry dependencies, start the watcher and bind the listener.
    ///
    /// Pre-bundling and watcher failures are logged; only a bind failure
    /// is returned.
    pub async fn start(self) -> Result<RunningServer, Error> {
        let root = dunce::canonicalize(&self.config.root).unwrap_or_else(|_| self.config.root.clone());

        let mut chain =
            PluginChain::new().with(DefinePlugin::new().env("NODE_ENV", self.config.mode.as_str()));
        chain.extend(&self.plugins);
        if let Some(federation) = self.config.federation.as_ref().filter(|f| f.is_host()) {
            chain.register(Arc::new(FederationPlugin::new(federation.clone())));
        }

        let transformer = Arc::new(ModuleTransformer::new(Arc::clone(&self.engine), chain));
        let prebundler = DependencyPreBundler::new(root.clone(), Arc::clone(&self.engine));
        let prebundle = prebundle_entries(&prebundler, &root, &self.config.entry).await;
        transformer.set_dependencies(prebundle.servable_map());

        let hmr = HmrBroadcaster::default();
        let watcher = if self.watch {
            match spawn_watcher(root.clone(), Arc::clone(&transformer), hmr.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, root = %root.display(), "file watcher unavailable; HMR disabled");
                    None
                }
            }
        } else {
            None
        };

        let state = Arc::new(DevState {
            root: root.clone(),
            cache_dir: prebundler.cache_dir().to_path_buf(),
            transformer,
            hmr: hmr.clone(),
        });

        let host = self.config.server_host();
        let port = self.config.server_port();
        let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            url = %format!("http://{local_addr}"),
            root = %root.display(),
            deps = prebundle.entries().count(),
            "dev server listening"
        );

        let task = tokio::spawn(async move { axum::serve(listener, router(state)).await });

        Ok(RunningServer {
            local_addr,
            hmr,
            prebundle,
            task,
            watcher,
        })
    }
}

impl std::fmt::Debug for DevServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevServer")
            .field("root", &self.config.root)
            .field("engine", &self.engine.name())
            .field("plugins", &self.plugins)
            .field("watch", &self.watch)
            .finish()
    }
}

async fn prebundle_entries(
    prebundler: &DependencyPreBundler,
    root: &Path,
    entries: &[String],
) -> PreBundleResult {
    let entries: Vec<PathBuf> = entries.iter().map(|e| root.join(e)).collect();
    let deps = match tokio::task::spawn_blocking(move || scan_bare_imports(&entries)).await {
        Ok(deps) => deps,
        Err(e) => {
            warn!(error = %e, "dependency scan failed");
            return PreBundleResult::default();
        }
    };
    if deps.is_empty() {
        return PreBundleResult::default();
    }
    match prebundler.pre_bundle(&deps).await {
        Ok(result) => {
            for failed in &result.failed {
                warn!(dep = %failed.specifier, reason = %failed.reason, "dependency not pre-bundled");
            }
            result
        }
        Err(e) => {
            warn!(error = %e, "dependency pre-bundling skipped");
            PreBundleResult::default()
        }
    }
}

/// A started dev server. Dropping it leaves the server running; use
/// [`shutdown`](Self::shutdown) to stop it.
pub struct RunningServer {
    local_addr: SocketAddr,
    hmr: HmrBroadcaster,
    prebundle: PreBundleResult,
    task: JoinHandle<std::io::Result<()>>,
    watcher: Option<RecommendedWatcher>,
}

impl RunningServer {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn hmr(&self) -> &HmrBroadcaster {
        &self.hmr
    }

    /// Outcome of the startup pre-bundle pass.
    #[must_use]
    pub fn prebundle(&self) -> &PreBundleResult {
        &self.prebundle
    }

    /// Serve until the listener fails.
    pub async fn wait(self) -> Result<(), Error> {
        let _watcher = self.watcher;
        match self.task.await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(Error::other(format!("Dev server task failed: {e}"))),
        }
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningServer")
            .field("local_addr", &self.local_addr)
            .field("clients", &self.hmr.client_count())
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}
