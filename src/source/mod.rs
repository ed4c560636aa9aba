//! Static source supervision
//!
//! A static source is a path-owned worker that pulls media from an upstream
//! URL and acts as the path's publisher. The protocol-specific pulling logic
//! lives behind [`SourceImpl`]; this module supervises it: run it, forward
//! configuration reloads, restart it after a fixed pause on failure, stop it
//! on cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conf::PathConf;
use crate::error::Result;
use crate::media::SessionDescription;
use crate::stream::Stream;

/// Pause before restarting a source that returned
const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Capacity of the per-source reload channel
const RELOAD_CHANNEL_CAPACITY: usize = 4;

/// Tagged description of a source, for API introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescription {
    /// Source kind label, e.g. `rtspSource`
    #[serde(rename = "type")]
    pub kind: String,
}

impl SourceDescription {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Interface a source implementation uses to drive its path as publisher
#[async_trait]
pub trait SourceParent: Send + Sync {
    /// Publish a description, creating the path's stream.
    ///
    /// Must strictly precede any unit written to the returned stream.
    async fn set_ready(
        &self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
    ) -> Result<Arc<Stream>>;

    /// Withdraw the publication; the stream is torn down.
    async fn set_not_ready(&self);
}

/// A protocol-specific source puller
#[async_trait]
pub trait SourceImpl: Send + Sync + 'static {
    /// Pull from the upstream until an error occurs, the upstream ends, or
    /// `reload_rx` delivery demands reconfiguration. Calls
    /// `parent.set_ready` once the upstream's description is known, then
    /// writes units to the returned stream, and `parent.set_not_ready` on
    /// the way out.
    async fn run(
        &self,
        parent: Arc<dyn SourceParent>,
        conf: Arc<PathConf>,
        reload_rx: &mut mpsc::Receiver<Arc<PathConf>>,
    ) -> Result<()>;

    /// Tagged description for API introspection
    fn describe(&self) -> SourceDescription;
}

/// Supervisor for one activation of a static source
///
/// Created when the owning path decides the source must run (at
/// initialization, or on first demand for `sourceOnDemand` paths) and closed
/// when the path decides it must stop. In between, the implementation is
/// restarted after a fixed pause every time it returns.
pub struct StaticSourceHandler {
    description: SourceDescription,
    reload_tx: mpsc::Sender<Arc<PathConf>>,
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

impl StaticSourceHandler {
    /// Start supervising `source` for `path_name`
    pub fn new(
        path_name: &str,
        conf: Arc<PathConf>,
        source: Arc<dyn SourceImpl>,
        parent: Arc<dyn SourceParent>,
    ) -> Self {
        let (reload_tx, mut reload_rx) = mpsc::channel(RELOAD_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let description = source.describe();

        let token = cancel.clone();
        let name = path_name.to_string();
        let done = tokio::spawn(async move {
            loop {
                let res = tokio::select! {
                    res = source.run(Arc::clone(&parent), Arc::clone(&conf), &mut reload_rx) => res,
                    _ = token.cancelled() => break,
                };

                match res {
                    Ok(()) => tracing::debug!(path = %name, "source ended"),
                    Err(e) => tracing::warn!(path = %name, error = %e, "source failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(RESTART_PAUSE) => {}
                    _ = token.cancelled() => break,
                }
            }
        });

        Self {
            description,
            reload_tx,
            cancel,
            done,
        }
    }

    /// Tagged description of the supervised source
    pub fn describe(&self) -> SourceDescription {
        self.description.clone()
    }

    /// Forward a configuration reload to the running implementation
    pub fn reload(&self, conf: Arc<PathConf>) {
        let _ = self.reload_tx.try_send(conf);
    }

    /// Stop the source and wait for it to wind down
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }
}
