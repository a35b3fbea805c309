//! HMR wire messages and fan-out.
//!
//! Delivery is best effort. A message reaches the clients connected when it
//! is broadcast. Missed messages are never replayed: a client that falls
//! behind the channel is told to reload the whole page instead.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Messages buffered per client before it is considered lagging.
pub const HMR_CHANNEL_CAPACITY: usize = 64;

/// Server → client HMR message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrMessage {
    /// Full page reload.
    Reload { path: String },
    /// Swap a stylesheet in place.
    UpdateCss { path: String },
}

impl HmrMessage {
    /// Classify a changed file. `path` is root-relative with a leading slash.
    ///
    /// Returns `None` for files outside `root`.
    #[must_use]
    pub fn for_change(root: &Path, changed: &Path) -> Option<Self> {
        let rel = changed.strip_prefix(root).ok()?;
        let segments: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        if segments.is_empty() {
            return None;
        }
        let path = format!("/{}", segments.join("/"));

        if rel.extension().is_some_and(|e| e == "css") {
            Some(Self::UpdateCss { path })
        } else {
            Some(Self::Reload { path })
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Reload { path } | Self::UpdateCss { path } => path,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frame to send a client for one receive from its channel.
///
/// A lagged receiver gets a full reload of `/` since the skipped messages
/// are gone. `None` means the channel is closed and the client is done.
#[must_use]
pub fn client_frame(received: Result<Arc<str>, RecvError>) -> Option<String> {
    match received {
        Ok(json) => Some(json.to_string()),
        Err(RecvError::Lagged(_)) => Some(
            HmrMessage::Reload {
                path: "/".to_string(),
            }
            .to_json(),
        ),
        Err(RecvError::Closed) => None,
    }
}

/// Fans serialized [`HmrMessage`]s out to every connected client.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct HmrBroadcaster {
    tx: broadcast::Sender<Arc<str>>,
}

impl Default for HmrBroadcaster {
    fn default() -> Self {
        Self::new(HMR_CHANNEL_CAPACITY)
    }
}

impl HmrBroadcaster {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New client stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Serialize `message` once and send it to every current client.
    /// Returns how many clients it was queued for.
    pub fn broadcast(&self, message: &HmrMessage) -> usize {
        let json: Arc<str> = Arc::from(message.to_json());
        self.tx.send(json).unwrap_or(0)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_css_change_updates_css() {
        let msg = HmrMessage::for_change(Path::new("/app"), Path::new("/app/foo.css")).unwrap();
        assert_eq!(
            msg,
            HmrMessage::UpdateCss {
                path: "/foo.css".to_string()
            }
        );
        assert_eq!(msg.to_json(), r#"{"type":"update-css","path":"/foo.css"}"#);
    }

    #[test]
    fn test_other_change_reloads() {
        let msg =
            HmrMessage::for_change(Path::new("/app"), Path::new("/app/src/foo.js")).unwrap();
        assert_eq!(msg.path(), "/src/foo.js");
        assert_eq!(msg.to_json(), r#"{"type":"reload","path":"/src/foo.js"}"#);
    }

    #[test]
    fn test_outside_root_is_ignored() {
        assert!(HmrMessage::for_change(Path::new("/app"), Path::new("/other/foo.js")).is_none());
        assert!(HmrMessage::for_change(Path::new("/app"), Path::new("/app")).is_none());
    }

    #[test]
    fn test_message_round_trips_from_json() {
        let msg: HmrMessage =
            serde_json::from_str(r#"{"type":"reload","path":"/index.html"}"#).unwrap();
        assert_eq!(msg.path(), "/index.html");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let hmr = HmrBroadcaster::default();
        assert_eq!(hmr.broadcast(&HmrMessage::Reload { path: "/a.js".into() }), 0);

        let mut a = hmr.subscribe();
        let mut b = hmr.subscribe();
        assert_eq!(hmr.client_count(), 2);

        let sent = hmr.broadcast(&HmrMessage::UpdateCss {
            path: "/a.css".into(),
        });
        assert_eq!(sent, 2);

        let expected = r#"{"type":"update-css","path":"/a.css"}"#;
        assert_eq!(&*a.recv().await.unwrap(), expected);
        assert_eq!(&*b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_lagging_client_loses_messages() {
        let hmr = HmrBroadcaster::new(1);
        let mut slow = hmr.subscribe();
        hmr.broadcast(&HmrMessage::Reload { path: "/1.js".into() });
        hmr.broadcast(&HmrMessage::Reload { path: "/2.js".into() });

        assert!(matches!(
            slow.recv().await,
            Err(RecvError::Lagged(1))
        ));
    }

    #[tokio::test]
    async fn test_lagging_client_is_told_to_reload() {
        let hmr = HmrBroadcaster::new(1);
        let mut slow = hmr.subscribe();
        hmr.broadcast(&HmrMessage::Reload { path: "/1.js".into() });
        hmr.broadcast(&HmrMessage::UpdateCss { path: "/2.css".into() });

        let frame = client_frame(slow.recv().await).unwrap();
        assert_eq!(frame, r#"{"type":"reload","path":"/"}"#);

        // The receiver keeps going after the lag.
        let frame = client_frame(slow.recv().await).unwrap();
        assert_eq!(frame, r#"{"type":"update-css","path":"/2.css"}"#);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_client() {
        let hmr = HmrBroadcaster::new(4);
        let mut rx = hmr.subscribe();
        drop(hmr);
        assert_eq!(client_frame(rx.recv().await), None);
    }
}
