//! Path manager
//!
//! Process-wide registry of paths and the single serialization point for
//! create/find/attach/detach requests. The manager runs one control task;
//! every operation arrives through its mailbox, is authorized against the
//! path's effective configuration, and is then forwarded into the owning
//! path's mailbox. Media flow never passes through here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;

use crate::auth::{authorize, Action, Credentials, AUTH_FAIL_PAUSE};
use crate::conf::{Conf, PathConf};
use crate::error::{Error, Result};
use crate::externalcmd::CmdPool;
use crate::media::SessionDescription;
use crate::record::RecorderHooks;
use crate::source::SourceImpl;
use crate::stats::ManagerSnapshot;

use super::path::{
    spawn_path, PathEvent, PathRequest, PathSettings, PublisherHandle, ReaderHandle,
};
use super::PathError;

/// Maps a source URL to a protocol-specific puller implementation.
///
/// Registered by the embedding application; a `None` return means no
/// front-end claims the URL.
pub type SourceFactory = Arc<dyn Fn(&str) -> Option<Arc<dyn SourceImpl>> + Send + Sync>;

/// Mailbox depth of the manager control task
const MAILBOX_CAPACITY: usize = 256;

/// How long a registry snapshot waits for unresponsive paths
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on the drain phase of `close`
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators handed to the manager at spawn time
#[derive(Default)]
pub struct ManagerOptions {
    /// Builds static-source workers from source URLs
    pub source_factory: Option<SourceFactory>,

    /// Segment lifecycle hooks passed to recorder agents
    pub recorder_hooks: RecorderHooks,
}

enum ManagerRequest {
    Describe {
        name: String,
        credentials: Credentials,
        ip: IpAddr,
        reply: oneshot::Sender<Result<SessionDescription>>,
    },
    AddPublisher {
        name: String,
        credentials: Credentials,
        ip: IpAddr,
        desc: SessionDescription,
        generate_rtp_packets: bool,
        reply: oneshot::Sender<Result<PublisherHandle>>,
    },
    AddReader {
        name: String,
        credentials: Credentials,
        ip: IpAddr,
        reply: oneshot::Sender<Result<ReaderHandle>>,
    },
    ApiList {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
    ReloadConf {
        conf: Conf,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// The path manager; spawned once per process
pub struct PathManager;

impl PathManager {
    /// Validate `conf`, create all configured paths, and start the control
    /// task. The returned handle is the only way to reach the manager.
    pub fn spawn(conf: Conf, options: ManagerOptions) -> Result<PathManagerHandle> {
        conf.validate()?;

        let (request_tx, request_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let actor = ManagerActor {
            conf,
            options,
            paths: HashMap::new(),
            next_generation: 1,
            event_tx,
            cmd_pool: Arc::new(CmdPool::new()),
            closing: false,
            close_replies: Vec::new(),
        };

        tokio::spawn(actor.run(request_rx, event_rx));

        Ok(PathManagerHandle { tx: request_tx })
    }
}

/// Cloneable handle to the path manager control task
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: mpsc::Sender<ManagerRequest>,
}

impl PathManagerHandle {
    /// Resolve a path's session description, parking if the path is
    /// activating on demand. Dropping the returned future cancels a parked
    /// request.
    pub async fn describe(
        &self,
        name: &str,
        credentials: Credentials,
        ip: IpAddr,
    ) -> Result<SessionDescription> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerRequest::Describe {
            name: name.to_string(),
            credentials,
            ip,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| Error::Path(PathError::Terminated))?
    }

    /// Attach as the publisher of a path
    pub async fn add_publisher(
        &self,
        name: &str,
        credentials: Credentials,
        ip: IpAddr,
        desc: SessionDescription,
        generate_rtp_packets: bool,
    ) -> Result<PublisherHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerRequest::AddPublisher {
            name: name.to_string(),
            credentials,
            ip,
            desc,
            generate_rtp_packets,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| Error::Path(PathError::Terminated))?
    }

    /// Attach as a reader of a path
    pub async fn add_reader(
        &self,
        name: &str,
        credentials: Credentials,
        ip: IpAddr,
    ) -> Result<ReaderHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerRequest::AddReader {
            name: name.to_string(),
            credentials,
            ip,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| Error::Path(PathError::Terminated))?
    }

    /// Consistent snapshot of every live path
    pub async fn api_list(&self) -> Result<ManagerSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerRequest::ApiList { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| Error::Path(PathError::Terminated).into())
    }

    /// Apply a new configuration snapshot. Paths whose effective
    /// configuration is unchanged are kept; all others are closed and, when
    /// still configured, recreated.
    pub async fn reload_conf(&self, conf: Conf) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ManagerRequest::ReloadConf {
            conf,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| Error::Path(PathError::Terminated))?
    }

    /// Close every path and wait for the registry to drain
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(ManagerRequest::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    async fn send(&self, req: ManagerRequest) -> Result<()> {
        self.tx
            .send(req)
            .await
            .map_err(|_| Error::Path(PathError::Terminated))
    }
}

struct PathEntry {
    generation: u64,
    conf: Arc<PathConf>,
    tx: mpsc::Sender<PathRequest>,
}

struct ManagerActor {
    conf: Conf,
    options: ManagerOptions,
    paths: HashMap<String, PathEntry>,
    next_generation: u64,
    event_tx: mpsc::Sender<PathEvent>,
    cmd_pool: Arc<CmdPool>,
    closing: bool,
    close_replies: Vec<oneshot::Sender<()>>,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<ManagerRequest>,
        mut event_rx: mpsc::Receiver<PathEvent>,
    ) {
        // Configured paths exist from startup; templated ones are created on
        // first matching request.
        let configured: Vec<(String, PathConf)> = self
            .conf
            .paths
            .iter()
            .filter(|(name, _)| {
                !crate::conf::is_path_template(name) && crate::conf::is_valid_path_name(name)
            })
            .map(|(name, conf)| (name.clone(), conf.clone()))
            .collect();
        for (name, path_conf) in configured {
            self.create_path(&name, path_conf);
        }

        let mut close_deadline: Option<tokio::time::Instant> = None;
        let mut requests_open = true;

        loop {
            tokio::select! {
                req = request_rx.recv(), if requests_open => match req {
                    Some(req) => {
                        if self.closing {
                            Self::answer_terminated(req, &mut self.close_replies);
                        } else {
                            self.handle(req).await;
                            if self.closing {
                                close_deadline =
                                    Some(tokio::time::Instant::now() + CLOSE_TIMEOUT);
                            }
                        }
                    }
                    // Every handle is gone; shut down on our own.
                    None => {
                        requests_open = false;
                        if !self.closing {
                            self.begin_close();
                            close_deadline = Some(tokio::time::Instant::now() + CLOSE_TIMEOUT);
                        }
                    }
                },

                ev = event_rx.recv() => {
                    if let Some(PathEvent::Closed { name, generation }) = ev {
                        self.on_path_closed(&name, generation);
                    }
                }

                _ = sleep_until(close_deadline.unwrap_or_else(tokio::time::Instant::now)),
                        if close_deadline.is_some() => {
                    tracing::warn!(
                        remaining = self.paths.len(),
                        "close timed out, forcing shutdown"
                    );
                    self.paths.clear();
                }
            }

            if self.closing && self.paths.is_empty() {
                break;
            }
        }

        // Backstop for hook commands the draining paths did not stop
        // themselves (one-shot notifications included).
        self.cmd_pool.close();

        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
        tracing::info!("path manager closed");
    }

    async fn handle(&mut self, req: ManagerRequest) {
        match req {
            ManagerRequest::Describe {
                name,
                credentials,
                ip,
                reply,
            } => {
                if let Some(reply) =
                    self.authorized(&name, Action::Read, &credentials, ip, reply)
                {
                    self.forward(&name, PathRequest::Describe { reply }, |req| match req {
                        PathRequest::Describe { reply } => reply,
                        _ => unreachable!(),
                    })
                    .await;
                }
            }

            ManagerRequest::AddReader {
                name,
                credentials,
                ip,
                reply,
            } => {
                if let Some(reply) =
                    self.authorized(&name, Action::Read, &credentials, ip, reply)
                {
                    self.forward(&name, PathRequest::AddReader { reply }, |req| match req {
                        PathRequest::AddReader { reply } => reply,
                        _ => unreachable!(),
                    })
                    .await;
                }
            }

            ManagerRequest::AddPublisher {
                name,
                credentials,
                ip,
                desc,
                generate_rtp_packets,
                reply,
            } => {
                if let Some(reply) =
                    self.authorized(&name, Action::Publish, &credentials, ip, reply)
                {
                    self.forward(
                        &name,
                        PathRequest::AddPublisher {
                            desc,
                            generate_rtp_packets,
                            reply,
                        },
                        |req| match req {
                            PathRequest::AddPublisher { reply, .. } => reply,
                            _ => unreachable!(),
                        },
                    )
                    .await;
                }
            }

            ManagerRequest::ApiList { reply } => self.api_list(reply),

            ManagerRequest::ReloadConf { conf, reply } => {
                let _ = reply.send(self.reload(conf).await);
            }

            ManagerRequest::Close { reply } => {
                self.close_replies.push(reply);
                self.begin_close();
            }
        }
    }

    /// Authorize a request against the path's effective configuration.
    ///
    /// On success returns the reply sender back to the caller; on failure
    /// answers it after the anti-brute-force pause (off the control task)
    /// and returns `None`. A missing template answers immediately.
    fn authorized<T: Send + 'static>(
        &mut self,
        name: &str,
        action: Action,
        credentials: &Credentials,
        ip: IpAddr,
        reply: oneshot::Sender<Result<T>>,
    ) -> Option<oneshot::Sender<Result<T>>> {
        let effective = match self.paths.get(name) {
            Some(entry) => Some(entry.conf.as_ref().clone()),
            None => self.conf.find_path_conf(name),
        };

        let Some(path_conf) = effective else {
            let _ = reply.send(Err(Error::Path(PathError::NoConfMatches(name.to_string()))));
            return None;
        };

        match authorize(action, &path_conf, credentials, ip) {
            Ok(()) => Some(reply),
            Err(e) => {
                tracing::info!(path = %name, %action, ip = %ip, error = %e, "access denied");
                tokio::spawn(async move {
                    tokio::time::sleep(AUTH_FAIL_PAUSE).await;
                    let _ = reply.send(Err(Error::Auth(e)));
                });
                None
            }
        }
    }

    /// Forward a request into a path mailbox, creating the path on first
    /// use. If the path closed concurrently, it is recreated once.
    async fn forward<T>(
        &mut self,
        name: &str,
        request: PathRequest,
        recover_reply: impl Fn(PathRequest) -> oneshot::Sender<Result<T>>,
    ) {
        let mut request = request;

        for attempt in 0..2 {
            let tx = match self.paths.get(name) {
                Some(entry) => entry.tx.clone(),
                None => {
                    let Some(path_conf) = self.conf.find_path_conf(name) else {
                        let reply = recover_reply(request);
                        let _ = reply.send(Err(Error::Path(PathError::NoConfMatches(
                            name.to_string(),
                        ))));
                        return;
                    };
                    self.create_path(name, path_conf)
                }
            };

            match tx.send(request).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The path shut down between lookup and send.
                    self.paths.remove(name);
                    request = returned;
                    if attempt == 1 {
                        let reply = recover_reply(request);
                        let _ = reply.send(Err(Error::Path(PathError::Terminated)));
                        return;
                    }
                }
            }
        }
    }

    fn create_path(&mut self, name: &str, path_conf: PathConf) -> mpsc::Sender<PathRequest> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let conf = Arc::new(path_conf);
        let tx = spawn_path(
            PathSettings {
                name: name.to_string(),
                conf: Arc::clone(&conf),
                write_queue_size: self.conf.write_queue_size,
                generation,
                source_factory: self.options.source_factory.clone(),
                recorder_hooks: self.options.recorder_hooks.clone(),
                cmd_pool: Arc::clone(&self.cmd_pool),
            },
            self.event_tx.clone(),
        );

        self.paths.insert(
            name.to_string(),
            PathEntry {
                generation,
                conf,
                tx: tx.clone(),
            },
        );
        tx
    }

    fn on_path_closed(&mut self, name: &str, generation: u64) {
        let matches = self
            .paths
            .get(name)
            .is_some_and(|entry| entry.generation == generation);
        if matches {
            self.paths.remove(name);
            tracing::debug!(path = %name, "path removed from registry");
        }
    }

    /// Gather per-path snapshots off the control task
    fn api_list(&self, reply: oneshot::Sender<ManagerSnapshot>) {
        let mut pending = Vec::with_capacity(self.paths.len());
        for entry in self.paths.values() {
            let (snap_tx, snap_rx) = oneshot::channel();
            if entry
                .tx
                .try_send(PathRequest::Snapshot { reply: snap_tx })
                .is_ok()
            {
                pending.push(snap_rx);
            }
        }

        tokio::spawn(async move {
            let mut snapshot = ManagerSnapshot::default();
            for rx in pending {
                if let Ok(Ok(path)) = tokio::time::timeout(SNAPSHOT_TIMEOUT, rx).await {
                    snapshot.paths.push(path);
                }
            }
            let _ = reply.send(snapshot);
        });
    }

    async fn reload(&mut self, new_conf: Conf) -> Result<()> {
        new_conf.validate()?;

        let queue_size_changed = new_conf.write_queue_size != self.conf.write_queue_size;

        // Keep paths whose effective configuration is identical; close the
        // rest. Closed paths that are still configured are recreated below
        // or on next demand.
        let names: Vec<String> = self.paths.keys().cloned().collect();
        for name in names {
            let effective = new_conf.find_path_conf(&name);
            let entry = &self.paths[&name];

            let keep = !queue_size_changed
                && effective
                    .as_ref()
                    .is_some_and(|conf| conf == entry.conf.as_ref());

            if keep {
                let _ = entry.tx.try_send(PathRequest::ReloadConf {
                    conf: Arc::clone(&entry.conf),
                });
            } else {
                tracing::info!(path = %name, "configuration changed, closing path");
                let _ = entry.tx.try_send(PathRequest::Close);
                self.paths.remove(&name);
            }
        }

        self.conf = new_conf;

        // Newly configured concrete paths exist immediately.
        let to_create: Vec<(String, PathConf)> = self
            .conf
            .paths
            .iter()
            .filter(|(name, _)| {
                !crate::conf::is_path_template(name)
                    && crate::conf::is_valid_path_name(name)
                    && !self.paths.contains_key(*name)
            })
            .map(|(name, conf)| (name.clone(), conf.clone()))
            .collect();
        for (name, path_conf) in to_create {
            self.create_path(&name, path_conf);
        }

        Ok(())
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        tracing::info!(paths = self.paths.len(), "path manager closing");

        for entry in self.paths.values() {
            let tx = entry.tx.clone();
            if tx.try_send(PathRequest::Close).is_err() {
                tokio::spawn(async move {
                    let _ = tx.send(PathRequest::Close).await;
                });
            }
        }
    }

    fn answer_terminated(req: ManagerRequest, close_replies: &mut Vec<oneshot::Sender<()>>) {
        match req {
            ManagerRequest::Describe { reply, .. } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            ManagerRequest::AddPublisher { reply, .. } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            ManagerRequest::AddReader { reply, .. } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            ManagerRequest::ApiList { reply } => {
                let _ = reply.send(ManagerSnapshot::default());
            }
            ManagerRequest::ReloadConf { reply, .. } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            ManagerRequest::Close { reply } => {
                close_replies.push(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use super::*;
    use crate::media::{Format, MediaDescription, MediaType, Unit};

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn desc() -> SessionDescription {
        SessionDescription::new(vec![MediaDescription::with_format(
            MediaType::Video,
            Format::h264(),
        )])
    }

    fn conf_with_path(name: &str, path_conf: PathConf) -> Conf {
        let mut conf = Conf::default();
        conf.paths.insert(name.into(), path_conf);
        conf
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_conf() {
        let mut conf = Conf::default();
        conf.write_queue_size = 0;
        assert!(PathManager::spawn(conf, ManagerOptions::default()).is_err());
    }

    #[tokio::test]
    async fn test_publish_then_describe_through_manager() {
        let conf = conf_with_path("live", PathConf::default());
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        let publisher = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();
        assert_eq!(publisher.path_name(), "live");

        let got = manager
            .describe("live", Credentials::default(), ip())
            .await
            .unwrap();
        assert_eq!(got, desc());

        let snapshot = manager.api_list().await.unwrap();
        let path = snapshot.path("live").expect("path in snapshot");
        assert!(path.ready);
        assert_eq!(path.tracks, vec!["H264".to_string()]);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_unknown_path_has_no_conf_match() {
        let conf = conf_with_path("live", PathConf::default());
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        let res = manager.describe("other", Credentials::default(), ip()).await;
        assert!(matches!(
            res,
            Err(Error::Path(PathError::NoConfMatches(_)))
        ));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_catch_all_template_creates_paths_on_demand() {
        let conf = conf_with_path("all_others", PathConf::default());
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        // No configured concrete paths: registry starts empty.
        assert!(manager.api_list().await.unwrap().paths.is_empty());

        let _publisher = manager
            .add_publisher("anything/goes", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();

        let snapshot = manager.api_list().await.unwrap();
        assert!(snapshot.path("anything/goes").is_some());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_failed_auth_is_delayed() {
        let mut path_conf = PathConf::default();
        path_conf.read_user = "alice".into();
        path_conf.read_pass = "secret".into();
        let conf = conf_with_path("live", path_conf);
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        let started = Instant::now();
        let res = manager
            .describe("live", Credentials::new("alice", "wrong"), ip())
            .await;
        assert!(matches!(res, Err(Error::Auth(_))));
        assert!(started.elapsed() >= AUTH_FAIL_PAUSE);

        // Correct credentials are not delayed into an error.
        let _publisher = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();
        let got = manager
            .describe("live", Credentials::new("alice", "secret"), ip())
            .await;
        assert!(got.is_ok());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_publisher_conflict_through_manager() {
        let conf = conf_with_path("live", PathConf::default());
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        let _first = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();
        let second = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await;
        assert!(matches!(
            second,
            Err(Error::Path(PathError::AlreadyPublished(_)))
        ));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_reload_with_identical_conf_is_a_noop() {
        let conf = conf_with_path("live", PathConf::default());
        let manager = PathManager::spawn(conf.clone(), ManagerOptions::default()).unwrap();

        let publisher = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();

        manager.reload_conf(conf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The path was kept: the existing stream still accepts units.
        publisher
            .stream()
            .write_unit(0, 0, Unit::new(0, Bytes::from_static(&[1])))
            .unwrap();

        manager.close().await;
    }

    #[tokio::test]
    async fn test_reload_with_changed_conf_recreates_path() {
        let conf = conf_with_path("live", PathConf::default());
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        let mut publisher = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();

        let mut changed = PathConf::default();
        changed.override_publisher = true;
        manager
            .reload_conf(conf_with_path("live", changed))
            .await
            .unwrap();

        // The old path was closed; its publisher is told.
        let err = tokio::time::timeout(Duration::from_secs(1), publisher.error())
            .await
            .unwrap();
        assert!(matches!(err, Error::Path(PathError::Terminated)));

        // The recreated path accepts a fresh publisher.
        let _publisher = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();

        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_terminates_outstanding_sessions() {
        let conf = conf_with_path("live", PathConf::default());
        let manager = PathManager::spawn(conf, ManagerOptions::default()).unwrap();

        let mut publisher = manager
            .add_publisher("live", Credentials::default(), ip(), desc(), false)
            .await
            .unwrap();
        let mut reader = manager
            .add_reader("live", Credentials::default(), ip())
            .await
            .unwrap();

        manager.close().await;

        let err = tokio::time::timeout(Duration::from_secs(1), publisher.error())
            .await
            .unwrap();
        assert!(matches!(err, Error::Path(PathError::Terminated)));
        let err = tokio::time::timeout(Duration::from_secs(1), reader.error())
            .await
            .unwrap();
        assert!(matches!(err, Error::Path(PathError::Terminated)));

        // The manager refuses further work.
        let res = manager.describe("live", Credentials::default(), ip()).await;
        assert!(matches!(res, Err(Error::Path(PathError::Terminated))));
    }
}
