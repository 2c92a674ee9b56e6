//! Streaming watch client.
//!
//! Opens one long-lived HTTP read per (resource kind, scope, resume token)
//! and yields decoded frames in feed order. The caller cancels by dropping
//! the returned [`WatchStream`]; the reader task observes the closed
//! channel at its next read boundary, drops the connection (which unblocks
//! any in-flight read), and exits.

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::event::{decode_frame, DecodeError, Decoded, Status, WatchEvent};
use crate::resources::ResourceKind;

/// Channel depth between the reader task and the consumer.
const FRAME_BUFFER: usize = 64;

/// Errors surfaced through the frame stream.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Transport-level failure (request, read, or premature close).
    #[error("watch I/O error: {0}")]
    Io(String),
    /// The feed produced a frame the decoder does not recognize.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// One item from an active subscription. `Control` and `Failed` are
/// terminal: the stream closes after emitting them.
#[derive(Debug)]
pub enum WatchFrame {
    Event(WatchEvent),
    Control(Status),
    Failed(WatchError),
}

/// Handle to an active subscription. Dropping it cancels the watch.
pub struct WatchStream {
    rx: mpsc::Receiver<WatchFrame>,
}

impl WatchStream {
    /// Next frame, or None once the feed reaches EOF or a terminal frame
    /// has been delivered.
    pub async fn recv(&mut self) -> Option<WatchFrame> {
        self.rx.recv().await
    }
}

/// Client for the control plane watch endpoints.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    /// Creates a client for the feed at `host:port`. The address is not
    /// validated beyond being non-empty.
    pub fn new(feed_addr: &str) -> Result<Self> {
        if feed_addr.is_empty() {
            anyhow::bail!("no feed address specified; unable to create API client");
        }
        let base = Url::parse(&format!("http://{}/api/v1/", feed_addr))
            .with_context(|| format!("invalid feed address {}", feed_addr))?;
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { http, base })
    }

    /// Opens a watch for one resource kind. `namespace` is ignored for
    /// cluster-scoped kinds; an empty `resume_token` requests the feed's
    /// current-state snapshot followed by live events.
    pub fn watch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        resume_token: Option<&str>,
    ) -> WatchStream {
        let url = watch_url(&self.base, kind, namespace, resume_token);
        let http = self.http.clone();
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);

        tokio::spawn(async move {
            debug!(url = %url, "Opening watch stream");
            let mut resp = match http.get(url.clone()).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = tx
                        .send(WatchFrame::Failed(WatchError::Io(format!(
                            "unable to request watch at {}: {}",
                            url, e
                        ))))
                        .await;
                    return;
                }
            };

            let mut buf: Vec<u8> = Vec::new();
            loop {
                let chunk = tokio::select! {
                    chunk = resp.chunk() => chunk,
                    _ = tx.closed() => {
                        debug!(url = %url, "Watch canceled by consumer");
                        return;
                    }
                };
                match chunk {
                    Ok(Some(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        if !drain_lines(kind, &mut buf, &tx).await {
                            return;
                        }
                    }
                    // Natural EOF: close the stream without a frame.
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx
                            .send(WatchFrame::Failed(WatchError::Io(e.to_string())))
                            .await;
                        return;
                    }
                }
            }
        });

        WatchStream { rx }
    }
}

/// Decodes and forwards every complete line in `buf`. Returns false when
/// the stream is finished (terminal frame sent or consumer gone).
async fn drain_lines(
    kind: ResourceKind,
    buf: &mut Vec<u8>,
    tx: &mpsc::Sender<WatchFrame>,
) -> bool {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_frame(kind, line) {
            Ok(Decoded::Event(event)) => {
                if tx.send(WatchFrame::Event(event)).await.is_err() {
                    return false;
                }
            }
            Ok(Decoded::Control(status)) => {
                let _ = tx.send(WatchFrame::Control(status)).await;
                return false;
            }
            Err(e) => {
                let _ = tx.send(WatchFrame::Failed(WatchError::Decode(e))).await;
                return false;
            }
        }
    }
    true
}

/// Builds the watch URL for a (kind, namespace, resume token) triple.
fn watch_url(base: &Url, kind: ResourceKind, namespace: &str, resume_token: Option<&str>) -> Url {
    let path = if kind.namespaced() && !namespace.is_empty() {
        format!("watch/namespaces/{}/{}", namespace, kind.as_str())
    } else {
        format!("watch/{}", kind.as_str())
    };
    // The base URL is validated at construction; joining a relative path
    // cannot fail.
    let mut url = base.join(&path).expect("watch path join");
    if let Some(token) = resume_token {
        if !token.is_empty() {
            url.query_pairs_mut().append_pair("resourceVersion", token);
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://10.0.0.1:8080/api/v1/").unwrap()
    }

    #[test]
    fn test_client_rejects_empty_address() {
        assert!(ApiClient::new("").is_err());
        assert!(ApiClient::new("10.0.0.1:8080").is_ok());
    }

    #[test]
    fn test_watch_url_namespaced() {
        let url = watch_url(&base(), ResourceKind::Pods, "apps", Some("42"));
        assert_eq!(
            url.as_str(),
            "http://10.0.0.1:8080/api/v1/watch/namespaces/apps/pods?resourceVersion=42"
        );
    }

    #[test]
    fn test_watch_url_global_namespace() {
        let url = watch_url(&base(), ResourceKind::PersistentVolumeClaims, "", None);
        assert_eq!(
            url.as_str(),
            "http://10.0.0.1:8080/api/v1/watch/persistentvolumeclaims"
        );
    }

    #[test]
    fn test_watch_url_pvs_ignore_namespace() {
        let url = watch_url(&base(), ResourceKind::PersistentVolumes, "apps", None);
        assert_eq!(
            url.as_str(),
            "http://10.0.0.1:8080/api/v1/watch/persistentvolumes"
        );
    }

    #[test]
    fn test_watch_url_empty_token_omitted() {
        let url = watch_url(&base(), ResourceKind::Pods, "apps", Some(""));
        assert!(url.query().is_none());
    }
}
