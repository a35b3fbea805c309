//! Development server.
//!
//! Request routing, first match wins:
//! 1. `/` → `public/index.html`
//! 2. `/@react-refresh` → the fast-refresh runtime wrapped as an ES module
//! 3. `/@urja-deps/<file>` → a pre-bundled dependency
//! 4. `public/<path>` → static file
//! 5. `<root>/<path>` → transformed script or stylesheet, other files raw
//!
//! Every per-request failure becomes a 404. File changes under the root are
//! pushed to WebSocket clients on `/__hmr`.

mod hmr;
mod server;
mod transform;
mod watch;

pub use hmr::{client_frame, HmrBroadcaster, HmrMessage, HMR_CHANNEL_CAPACITY};
pub use server::{DevServer, RunningServer, HMR_PATH, REACT_REFRESH_PATH, REACT_REFRESH_RUNTIME};
pub use transform::{
    rewrite_bare_imports, ModuleTransformer, RequestError, ServeKind, TransformedModule,
};
pub use watch::{handle_change, should_ignore, spawn_watcher};
