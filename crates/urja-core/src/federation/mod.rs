//! Module federation.
//!
//! Build side: [`FederationPlugin`] rewrites imports of configured remotes
//! into `loadRemote(...)` calls and [`remote_entry_source`] generates the
//! container script a remote publishes. Run side: [`FederationClient`]
//! implements the container protocol (deduplicated script loads, one `init`
//! per container, a shared-dependency scope) against pluggable script
//! loading and container lookup.

mod plugin;
mod runtime;

pub use plugin::{
    expose_chunk_name, remote_entry_source, FederationPlugin, FEDERATION_RUNTIME_JS,
    RUNTIME_MARKER,
};
pub use runtime::{
    ContainerHost, Exports, FederationClient, ModuleFactory, RemoteContainer, RemoteLoadError,
    ScriptLoader, ShareScope, SharedFactory,
};
