//! Run side of module federation.
//!
//! [`FederationClient`] loads remote containers through a [`ScriptLoader`],
//! initializes each one exactly once against the shared [`ShareScope`] and
//! resolves exposed modules. Concurrent loads of the same remote share one
//! in-flight future.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Opaque module exports.
pub type Exports = Arc<dyn Any + Send + Sync>;

/// Deferred module instantiation returned by [`RemoteContainer::get`].
pub type ModuleFactory = Box<dyn FnOnce() -> Exports + Send>;

/// Factory registered in a [`ShareScope`].
pub type SharedFactory = Arc<dyn Fn() -> Exports + Send + Sync>;

type SharedLoad = Shared<BoxFuture<'static, Result<(), RemoteLoadError>>>;

/// Failure scoped to a single `load_remote` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteLoadError {
    #[error("Failed to load remote entry {url}: {message}")]
    ScriptLoad { url: String, message: String },

    #[error("Remote container '{scope}' was not found after loading {url}")]
    ContainerMissing { scope: String, url: String },

    #[error("Module {module} does not exist in container {scope}")]
    ModuleMissing { scope: String, module: String },

    #[error("Failed to initialize container '{scope}': {message}")]
    Init { scope: String, message: String },
}

/// Loads a remote entry script (`<script src=url>`).
#[async_trait]
pub trait ScriptLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<(), RemoteLoadError>;
}

/// Looks up containers a loaded script defined (`window[scope]`).
pub trait ContainerHost: Send + Sync {
    fn container(&self, scope: &str) -> Option<Arc<dyn RemoteContainer>>;
}

/// A remote's runtime entry.
#[async_trait]
pub trait RemoteContainer: Send + Sync {
    async fn init(&self, share_scope: &ShareScope) -> Result<(), RemoteLoadError>;

    async fn get(&self, module: &str) -> Result<ModuleFactory, RemoteLoadError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct SharedEntry {
    loaded: bool,
    get: SharedFactory,
}

/// Registry of shared dependency versions: name → version → factory.
///
/// Cloning yields a handle to the same registry. Keys are exact; there is
/// no range negotiation and the last registration of a `(name, version)`
/// wins.
#[derive(Clone, Default)]
pub struct ShareScope {
    inner: Arc<Mutex<HashMap<String, BTreeMap<String, SharedEntry>>>>,
}

impl ShareScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `(name, version)`. Returns true when an entry was replaced.
    pub fn register(&self, name: &str, version: &str, factory: SharedFactory) -> bool {
        let mut scope = lock(&self.inner);
        let replaced = scope
            .entry(name.to_string())
            .or_default()
            .insert(
                version.to_string(),
                SharedEntry {
                    loaded: false,
                    get: factory,
                },
            )
            .is_some();
        if replaced {
            debug!(name, version, "shared dependency overwritten");
        }
        replaced
    }

    /// Factory for an exact `(name, version)`.
    pub fn get(&self, name: &str, version: &str) -> Option<SharedFactory> {
        lock(&self.inner)
            .get(name)
            .and_then(|versions| versions.get(version))
            .map(|entry| Arc::clone(&entry.get))
    }

    /// Instantiate `(name, version)` and mark it loaded.
    pub fn load(&self, name: &str, version: &str) -> Option<Exports> {
        let factory = {
            let mut scope = lock(&self.inner);
            let entry = scope.get_mut(name)?.get_mut(version)?;
            entry.loaded = true;
            Arc::clone(&entry.get)
        };
        Some(factory())
    }

    pub fn is_loaded(&self, name: &str, version: &str) -> bool {
        lock(&self.inner)
            .get(name)
            .and_then(|versions| versions.get(version))
            .is_some_and(|entry| entry.loaded)
    }

    /// Registered versions of `name`, ascending.
    pub fn versions(&self, name: &str) -> Vec<String> {
        lock(&self.inner)
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ShareScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scope = lock(&self.inner);
        let mut map = f.debug_map();
        for (name, versions) in scope.iter() {
            map.entry(name, &versions.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

enum InitState {
    Initializing(SharedLoad),
    Ready,
}

/// Federation client for one session.
///
/// Owns the share scope, per-container init state and in-flight script
/// loads. Concurrent loads of the same URL share one script load and
/// concurrent first uses of a container share one `init` call.
pub struct FederationClient {
    loader: Arc<dyn ScriptLoader>,
    host: Arc<dyn ContainerHost>,
    share_scope: ShareScope,
    /// Absent scope means uninitialized.
    containers: Mutex<HashMap<String, InitState>>,
    loading: Mutex<HashMap<String, SharedLoad>>,
}

impl FederationClient {
    pub fn new(loader: Arc<dyn ScriptLoader>, host: Arc<dyn ContainerHost>) -> Self {
        Self {
            loader,
            host,
            share_scope: ShareScope::new(),
            containers: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
        }
    }

    pub fn share_scope(&self) -> &ShareScope {
        &self.share_scope
    }

    /// Register a shared dependency version in this session's scope.
    pub fn register_shared(&self, name: &str, version: &str, factory: SharedFactory) {
        self.share_scope.register(name, version, factory);
    }

    /// Whether the container for `scope` finished `init`.
    pub fn is_initialized(&self, scope: &str) -> bool {
        matches!(lock(&self.containers).get(scope), Some(InitState::Ready))
    }

    /// Load `module` from the remote container `scope` published at `url`.
    pub async fn load_remote(
        &self,
        url: &str,
        scope: &str,
        module: &str,
    ) -> Result<Exports, RemoteLoadError> {
        let container = match self.host.container(scope) {
            Some(container) => container,
            None => {
                self.load_script(url).await?;
                self.host
                    .container(scope)
                    .ok_or_else(|| RemoteLoadError::ContainerMissing {
                        scope: scope.to_string(),
                        url: url.to_string(),
                    })?
            }
        };

        self.init_remote(scope, &container).await?;
        let factory = container.get(module).await?;
        Ok(factory())
    }

    async fn load_script(&self, url: &str) -> Result<(), RemoteLoadError> {
        let pending = {
            let mut loading = lock(&self.loading);
            if let Some(pending) = loading.get(url) {
                pending.clone()
            } else {
                let loader = Arc::clone(&self.loader);
                let owned = url.to_string();
                let pending = async move { loader.load(&owned).await }.boxed().shared();
                loading.insert(url.to_string(), pending.clone());
                debug!(url, "loading remote entry");
                pending
            }
        };

        let result = pending.clone().await;
        if let Err(e) = &result {
            warn!(url, error = %e, "remote entry failed to load");
            let mut loading = lock(&self.loading);
            if loading.get(url).is_some_and(|current| current.ptr_eq(&pending)) {
                loading.remove(url);
            }
        }
        result
    }

    async fn init_remote(
        &self,
        scope: &str,
        container: &Arc<dyn RemoteContainer>,
    ) -> Result<(), RemoteLoadError> {
        let pending = {
            let mut containers = lock(&self.containers);
            match containers.get(scope) {
                Some(InitState::Ready) => return Ok(()),
                Some(InitState::Initializing(pending)) => pending.clone(),
                None => {
                    let container = Arc::clone(container);
                    let share_scope = self.share_scope.clone();
                    let pending = async move { container.init(&share_scope).await }
                        .boxed()
                        .shared();
                    containers.insert(
                        scope.to_string(),
                        InitState::Initializing(pending.clone()),
                    );
                    pending
                }
            }
        };

        let result = pending.clone().await;
        let mut containers = lock(&self.containers);
        let owns_state = matches!(
            containers.get(scope),
            Some(InitState::Initializing(current)) if current.ptr_eq(&pending)
        );
        if owns_state {
            if result.is_ok() {
                debug!(scope, "container initialized");
                containers.insert(scope.to_string(), InitState::Ready);
            } else {
                containers.remove(scope);
            }
        }
        result
    }
}
