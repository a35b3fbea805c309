//! File watching for HMR.

use super::hmr::{HmrBroadcaster, HmrMessage};
use super::transform::ModuleTransformer;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Directories whose changes never reach clients.
const IGNORED_DIRS: &[&str] = &[".git", "node_modules"];

/// Whether `path` lies under a version-control or dependency directory.
#[must_use]
pub fn should_ignore(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => IGNORED_DIRS.iter().any(|d| name == *d),
        _ => false,
    })
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(_) | EventKind::Create(_))
}

/// Handle one changed path: drop its cached transform and broadcast the HMR message.
pub fn handle_change(
    root: &Path,
    path: &Path,
    transformer: &ModuleTransformer,
    hmr: &HmrBroadcaster,
) -> Option<HmrMessage> {
    if should_ignore(path.strip_prefix(root).unwrap_or(path)) {
        return None;
    }
    transformer.invalidate(path);
    let message = HmrMessage::for_change(root, path)?;
    let clients = hmr.broadcast(&message);
    debug!(path = %message.path(), clients, "hmr broadcast");
    Some(message)
}

/// Watch `root` recursively and broadcast a message per changed file.
///
/// Events are handled on a tokio task in the order the watcher emits them.
/// The returned watcher stops when dropped.
pub fn spawn_watcher(
    root: PathBuf,
    transformer: Arc<ModuleTransformer>,
    hmr: HmrBroadcaster,
) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !is_relevant(&event.kind) {
                continue;
            }
            for path in &event.paths {
                handle_change(&root, path, &transformer, &hmr);
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NativeEngine;
    use crate::plugin::PluginChain;

    #[test]
    fn test_should_ignore() {
        assert!(should_ignore(Path::new("node_modules/react/index.js")));
        assert!(should_ignore(Path::new("/app/.git/HEAD")));
        assert!(!should_ignore(Path::new("/app/src/main.js")));
        assert!(!should_ignore(Path::new("/app/src/.gitkeep")));
    }

    #[test]
    fn test_relevant_events() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind};
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(!is_relevant(&EventKind::Remove(RemoveKind::File)));
    }

    #[tokio::test]
    async fn test_handle_change_classifies_and_broadcasts() {
        let transformer = ModuleTransformer::new(Arc::new(NativeEngine::new()), PluginChain::new());
        let hmr = HmrBroadcaster::default();
        let mut client = hmr.subscribe();
        let root = Path::new("/app");

        let css = handle_change(root, Path::new("/app/foo.css"), &transformer, &hmr).unwrap();
        assert_eq!(css, HmrMessage::UpdateCss { path: "/foo.css".into() });
        let js = handle_change(root, Path::new("/app/foo.js"), &transformer, &hmr).unwrap();
        assert_eq!(js, HmrMessage::Reload { path: "/foo.js".into() });
        assert!(handle_change(root, Path::new("/app/node_modules/x/a.js"), &transformer, &hmr).is_none());

        assert_eq!(&*client.recv().await.unwrap(), r#"{"type":"update-css","path":"/foo.css"}"#);
        assert_eq!(&*client.recv().await.unwrap(), r#"{"type":"reload","path":"/foo.js"}"#);
        assert!(client.try_recv().is_err());
    }
}
