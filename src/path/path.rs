//! Path control task
//!
//! Each path owns one control task processing a mailbox of requests
//! sequentially: attach/detach, describe, static-source events, snapshots,
//! close. Control operations may be slow (hooks, source startup); the media
//! path never enters this mailbox — publishers write straight into the
//! stream they were handed at attach time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;

use crate::conf::PathConf;
use crate::error::{Error, Result};
use crate::externalcmd::{Cmd, CmdPool, Environment};
use crate::media::SessionDescription;
use crate::record::{RecorderAgent, RecorderHooks};
use crate::source::{SourceDescription, SourceParent, StaticSourceHandler};
use crate::stats::PathSnapshot;
use crate::stream::{Stream, StreamReader};

use super::manager::SourceFactory;
use super::PathError;

/// Mailbox depth of a path control task
pub(crate) const MAILBOX_CAPACITY: usize = 64;

/// Capacity of a publisher's error channel
const ERROR_CHANNEL_CAPACITY: usize = 8;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Path lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// Created, control task not yet started
    Initial,
    /// No publisher bound; readers and describes may be parked
    WaitingPublisher,
    /// Publisher bound, stream exists
    Ready,
    /// Draining readers and workers
    Closing,
    /// Removed from the registry
    Closed,
}

impl std::fmt::Display for PathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathState::Initial => write!(f, "initial"),
            PathState::WaitingPublisher => write!(f, "waitingPublisher"),
            PathState::Ready => write!(f, "ready"),
            PathState::Closing => write!(f, "closing"),
            PathState::Closed => write!(f, "closed"),
        }
    }
}

/// Requests processed by a path control task
pub(crate) enum PathRequest {
    Describe {
        reply: oneshot::Sender<Result<SessionDescription>>,
    },
    AddPublisher {
        desc: SessionDescription,
        generate_rtp_packets: bool,
        reply: oneshot::Sender<Result<PublisherHandle>>,
    },
    AddReader {
        reply: oneshot::Sender<Result<ReaderHandle>>,
    },
    RemovePublisher {
        id: u64,
    },
    RemoveReader {
        id: u64,
    },
    SourceSetReady {
        desc: SessionDescription,
        generate_rtp_packets: bool,
        reply: oneshot::Sender<Result<Arc<Stream>>>,
    },
    SourceSetNotReady,
    ReloadConf {
        conf: Arc<PathConf>,
    },
    Snapshot {
        reply: oneshot::Sender<PathSnapshot>,
    },
    Close,
}

/// Events a path posts back to its manager
pub(crate) enum PathEvent {
    Closed { name: String, generation: u64 },
}

/// Handle held by the session currently publishing to a path
///
/// Exposes the stream to write into, an error channel on which detach
/// reasons arrive (replacement, termination), and `close`.
pub struct PublisherHandle {
    id: u64,
    path_name: String,
    stream: Arc<Stream>,
    path_tx: mpsc::Sender<PathRequest>,
    error_rx: mpsc::Receiver<Error>,
    closed: bool,
}

impl PublisherHandle {
    /// The stream this publisher writes into
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Name of the path this publisher is bound to
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    /// Wait for a terminal error (replaced, terminated)
    pub async fn error(&mut self) -> Error {
        match self.error_rx.recv().await {
            Some(err) => err,
            None => Error::Path(PathError::Terminated),
        }
    }

    /// Detach from the path
    pub async fn close(mut self) {
        self.closed = true;
        let _ = self
            .path_tx
            .send(PathRequest::RemovePublisher { id: self.id })
            .await;
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self
                .path_tx
                .try_send(PathRequest::RemovePublisher { id: self.id });
        }
    }
}

/// Handle held by a session reading from a path
///
/// The session registers per-format callbacks through
/// [`Stream::add_reader`] using [`ReaderHandle::reader`]; overflow and
/// detach reasons arrive on the error channel.
pub struct ReaderHandle {
    path_name: String,
    stream: Arc<Stream>,
    reader: StreamReader,
    path_tx: mpsc::Sender<PathRequest>,
    error_rx: mpsc::Receiver<Error>,
    closed: bool,
}

impl ReaderHandle {
    /// The stream this reader consumes
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// The reader identity to pass to [`Stream::add_reader`]
    pub fn reader(&self) -> &StreamReader {
        &self.reader
    }

    /// Name of the path this reader is attached to
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    /// Wait for the next error (overflow, publisher gone, terminated)
    pub async fn error(&mut self) -> Error {
        match self.error_rx.recv().await {
            Some(err) => err,
            None => Error::Path(PathError::Terminated),
        }
    }

    /// Detach from the path
    pub async fn close(mut self) {
        self.closed = true;
        let id = self.reader.id();
        let _ = self.path_tx.send(PathRequest::RemoveReader { id }).await;
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        if !self.closed {
            let id = self.reader.id();
            let _ = self.path_tx.try_send(PathRequest::RemoveReader { id });
        }
    }
}

/// Everything a path needs at spawn time
pub(crate) struct PathSettings {
    pub name: String,
    pub conf: Arc<PathConf>,
    pub write_queue_size: usize,
    pub generation: u64,
    pub source_factory: Option<SourceFactory>,
    pub recorder_hooks: RecorderHooks,
    pub cmd_pool: Arc<CmdPool>,
}

/// Spawn the control task of one path and return its mailbox
pub(crate) fn spawn_path(
    settings: PathSettings,
    event_tx: mpsc::Sender<PathEvent>,
) -> mpsc::Sender<PathRequest> {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

    let actor = PathActor {
        name: settings.name,
        conf: settings.conf,
        write_queue_size: settings.write_queue_size,
        generation: settings.generation,
        source_factory: settings.source_factory,
        recorder_hooks: settings.recorder_hooks,
        cmd_pool: settings.cmd_pool,
        state: PathState::Initial,
        stream: None,
        publisher: None,
        readers: HashMap::new(),
        parked_describes: Vec::new(),
        parked_readers: Vec::new(),
        source: None,
        recorder: None,
        on_init_cmd: None,
        on_demand_cmd: None,
        on_ready_cmd: None,
        close_after_deadline: None,
        tx: tx.clone(),
        event_tx,
    };

    tokio::spawn(actor.run(rx));
    tx
}

/// Forwards static-source readiness events into the path mailbox
struct PathSourceContext {
    tx: mpsc::Sender<PathRequest>,
}

#[async_trait]
impl SourceParent for PathSourceContext {
    async fn set_ready(
        &self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
    ) -> Result<Arc<Stream>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::SourceSetReady {
                desc,
                generate_rtp_packets,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Path(PathError::Terminated))?;
        reply_rx.await.map_err(|_| Error::Path(PathError::Terminated))?
    }

    async fn set_not_ready(&self) {
        let _ = self.tx.send(PathRequest::SourceSetNotReady).await;
    }
}

enum PublisherSlot {
    /// An external protocol session
    External { id: u64, error_tx: mpsc::Sender<Error> },
    /// The path's own static source worker
    Source,
}

struct ReaderBinding {
    reader: StreamReader,
    on_read_cmd: Option<Cmd>,
}

struct ParkedDescribe {
    reply: oneshot::Sender<Result<SessionDescription>>,
    expires: Instant,
}

struct ParkedReader {
    reply: oneshot::Sender<Result<ReaderHandle>>,
    expires: Instant,
}

struct PathActor {
    name: String,
    conf: Arc<PathConf>,
    write_queue_size: usize,
    generation: u64,
    source_factory: Option<SourceFactory>,
    recorder_hooks: RecorderHooks,
    cmd_pool: Arc<CmdPool>,

    state: PathState,
    stream: Option<Arc<Stream>>,
    publisher: Option<PublisherSlot>,
    readers: HashMap<u64, ReaderBinding>,
    parked_describes: Vec<ParkedDescribe>,
    parked_readers: Vec<ParkedReader>,
    source: Option<StaticSourceHandler>,
    recorder: Option<RecorderAgent>,
    on_init_cmd: Option<Cmd>,
    on_demand_cmd: Option<Cmd>,
    on_ready_cmd: Option<Cmd>,
    close_after_deadline: Option<Instant>,

    tx: mpsc::Sender<PathRequest>,
    event_tx: mpsc::Sender<PathEvent>,
}

impl PathActor {
    async fn run(mut self, mut rx: mpsc::Receiver<PathRequest>) {
        self.init();

        while self.state != PathState::Closing {
            let deadline = self.next_deadline();

            tokio::select! {
                req = rx.recv() => match req {
                    None | Some(PathRequest::Close) => break,
                    Some(req) => self.handle(req).await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now).into()),
                        if deadline.is_some() => {
                    self.handle_deadlines().await;
                }
            }
        }

        self.shutdown(rx).await;
    }

    fn init(&mut self) {
        tracing::debug!(path = %self.name, "path created");
        self.state = PathState::WaitingPublisher;

        if !self.conf.run_on_init.is_empty() {
            self.on_init_cmd = Some(self.cmd_pool.spawn(
                &self.conf.run_on_init,
                self.conf.run_on_init_restart,
                self.env(),
                None,
            ));
        }

        // Always-on static sources start with the path; on-demand ones wait
        // for the first describe or reader.
        if self.conf.has_static_source() && !self.conf.source_on_demand {
            self.start_source();
        }
    }

    fn env(&self) -> Environment {
        let mut env = Environment::new();
        env.insert("RELAY_PATH".into(), self.name.clone());
        env
    }

    fn start_source(&mut self) {
        if self.source.is_some() {
            return;
        }
        let Some(factory) = &self.source_factory else {
            tracing::warn!(path = %self.name, source = %self.conf.source,
                "static source configured but no source factory registered");
            return;
        };
        match factory(&self.conf.source) {
            Some(source) => {
                tracing::debug!(path = %self.name, source = %self.conf.source, "starting source");
                self.source = Some(StaticSourceHandler::new(
                    &self.name,
                    Arc::clone(&self.conf),
                    source,
                    Arc::new(PathSourceContext { tx: self.tx.clone() }),
                ));
            }
            None => {
                tracing::warn!(path = %self.name, source = %self.conf.source,
                    "no source implementation for this URL");
            }
        }
    }

    /// Begin whatever on-demand machinery this path is configured with
    fn demand_start(&mut self) {
        if self.conf.has_static_source() && self.conf.source_on_demand {
            self.start_source();
        }
        if !self.conf.run_on_demand.is_empty() && self.on_demand_cmd.is_none() {
            tracing::debug!(path = %self.name, "starting on-demand command");
            self.on_demand_cmd = Some(self.cmd_pool.spawn(
                &self.conf.run_on_demand,
                self.conf.run_on_demand_restart,
                self.env(),
                None,
            ));
        }
    }

    /// Stop on-demand machinery
    async fn demand_stop(&mut self) {
        if let Some(source) = self.source.take() {
            source.close().await;
        }
        if let Some(cmd) = self.on_demand_cmd.take() {
            cmd.close();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let parked = self
            .parked_describes
            .iter()
            .map(|p| p.expires)
            .chain(self.parked_readers.iter().map(|p| p.expires))
            .min();
        [parked, self.close_after_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    async fn handle(&mut self, req: PathRequest) {
        match req {
            PathRequest::Describe { reply } => self.on_describe(reply),
            PathRequest::AddPublisher {
                desc,
                generate_rtp_packets,
                reply,
            } => self.on_add_publisher(desc, generate_rtp_packets, reply).await,
            PathRequest::AddReader { reply } => self.on_add_reader(reply),
            PathRequest::RemovePublisher { id } => self.on_remove_publisher(id).await,
            PathRequest::RemoveReader { id } => self.on_remove_reader(id).await,
            PathRequest::SourceSetReady {
                desc,
                generate_rtp_packets,
                reply,
            } => self.on_source_set_ready(desc, generate_rtp_packets, reply),
            PathRequest::SourceSetNotReady => self.on_source_set_not_ready().await,
            PathRequest::ReloadConf { conf } => {
                if let Some(source) = &self.source {
                    source.reload(conf);
                }
            }
            PathRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PathRequest::Close => unreachable!("handled by the run loop"),
        }
    }

    fn on_describe(&mut self, reply: oneshot::Sender<Result<SessionDescription>>) {
        match self.state {
            PathState::Ready => {
                let desc = self
                    .stream
                    .as_ref()
                    .map(|s| s.desc().clone())
                    .unwrap_or_default();
                let _ = reply.send(Ok(desc));
            }
            _ if self.conf.is_on_demand() => {
                self.demand_start();
                self.parked_describes.push(ParkedDescribe {
                    reply,
                    expires: Instant::now() + self.conf.source_on_demand_start_timeout,
                });
            }
            _ => {
                let _ = reply.send(Err(Error::Path(PathError::NotReady(self.name.clone()))));
                self.maybe_close_if_empty();
            }
        }
    }

    fn on_add_reader(&mut self, reply: oneshot::Sender<Result<ReaderHandle>>) {
        match self.state {
            PathState::Ready => {
                let handle = self.accept_reader();
                let _ = reply.send(Ok(handle));
            }
            _ if self.conf.is_on_demand() => {
                self.demand_start();
                self.parked_readers.push(ParkedReader {
                    reply,
                    expires: Instant::now() + self.conf.source_on_demand_start_timeout,
                });
            }
            _ => {
                let _ = reply.send(Err(Error::Path(PathError::NotReady(self.name.clone()))));
                self.maybe_close_if_empty();
            }
        }
    }

    /// Build a reader binding against the current stream. Only valid in
    /// `Ready`.
    fn accept_reader(&mut self) -> ReaderHandle {
        let (reader, error_rx) = StreamReader::new();
        let stream = self
            .stream
            .as_ref()
            .expect("accept_reader called outside ready state")
            .clone();

        let on_read_cmd = if !self.conf.run_on_read.is_empty() {
            Some(self.cmd_pool.spawn(&self.conf.run_on_read, false, self.env(), None))
        } else {
            None
        };

        self.readers.insert(
            reader.id(),
            ReaderBinding {
                reader: reader.clone(),
                on_read_cmd,
            },
        );
        self.close_after_deadline = None;

        tracing::info!(
            path = %self.name,
            reader_id = reader.id(),
            readers = self.readers.len(),
            "reader attached"
        );

        ReaderHandle {
            path_name: self.name.clone(),
            stream,
            reader,
            path_tx: self.tx.clone(),
            error_rx,
            closed: false,
        }
    }

    async fn on_add_publisher(
        &mut self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
        reply: oneshot::Sender<Result<PublisherHandle>>,
    ) {
        if !desc.is_valid() {
            let _ = reply.send(Err(Error::Internal(
                "session description has no formats".into(),
            )));
            return;
        }

        // Static-source paths are published by their own worker.
        if self.conf.has_static_source() {
            let _ = reply.send(Err(Error::Path(PathError::AlreadyPublished(
                self.name.clone(),
            ))));
            return;
        }

        if self.publisher.is_some() {
            if !self.conf.override_publisher {
                let _ = reply.send(Err(Error::Path(PathError::AlreadyPublished(
                    self.name.clone(),
                ))));
                return;
            }
            tracing::info!(path = %self.name, "replacing current publisher");
            self.detach_publisher(PathError::PublisherReplaced).await;
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let stream = self.set_ready(
            desc,
            generate_rtp_packets,
            PublisherSlot::External { id, error_tx },
        );

        let _ = reply.send(Ok(PublisherHandle {
            id,
            path_name: self.name.clone(),
            stream,
            path_tx: self.tx.clone(),
            error_rx,
            closed: false,
        }));
    }

    fn on_source_set_ready(
        &mut self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
        reply: oneshot::Sender<Result<Arc<Stream>>>,
    ) {
        if !desc.is_valid() {
            let _ = reply.send(Err(Error::Internal(
                "session description has no formats".into(),
            )));
            return;
        }
        if self.publisher.is_some() {
            let _ = reply.send(Err(Error::Path(PathError::AlreadyPublished(
                self.name.clone(),
            ))));
            return;
        }

        let stream = self.set_ready(desc, generate_rtp_packets, PublisherSlot::Source);
        let _ = reply.send(Ok(stream));
    }

    /// Bind a publisher, create the stream, wake parked requests. The single
    /// transition into `Ready`.
    fn set_ready(
        &mut self,
        desc: SessionDescription,
        generate_rtp_packets: bool,
        slot: PublisherSlot,
    ) -> Arc<Stream> {
        let stream = Arc::new(Stream::new(
            desc.clone(),
            self.write_queue_size,
            generate_rtp_packets,
        ));
        self.stream = Some(Arc::clone(&stream));
        self.publisher = Some(slot);
        self.state = PathState::Ready;

        tracing::info!(path = %self.name, desc = %desc.summary(), "path is ready");

        if self.conf.record {
            match RecorderAgent::new(
                &self.name,
                &self.conf,
                self.write_queue_size,
                Arc::clone(&stream),
                self.recorder_hooks.clone(),
            ) {
                Ok(agent) => self.recorder = Some(agent),
                Err(e) => {
                    tracing::error!(path = %self.name, error = %e, "recorder failed to start")
                }
            }
        }

        if !self.conf.run_on_ready.is_empty() {
            self.on_ready_cmd =
                Some(self.cmd_pool.spawn(&self.conf.run_on_ready, false, self.env(), None));
        }

        // Answer parked describes, skipping requesters that went away.
        for parked in std::mem::take(&mut self.parked_describes) {
            if !parked.reply.is_closed() {
                let _ = parked.reply.send(Ok(desc.clone()));
            }
        }

        for parked in std::mem::take(&mut self.parked_readers) {
            if !parked.reply.is_closed() {
                let handle = self.accept_reader();
                let _ = parked.reply.send(Ok(handle));
            }
        }

        if self.readers.is_empty() && self.conf.is_on_demand() {
            self.close_after_deadline =
                Some(Instant::now() + self.conf.source_on_demand_close_after);
        }

        stream
    }

    /// Notify and drop the current publisher binding, then tear the stream
    /// down. Readers are detached with the same reason.
    async fn detach_publisher(&mut self, reason: PathError) {
        if let Some(PublisherSlot::External { error_tx, .. }) = self.publisher.take() {
            let _ = error_tx.try_send(Error::Path(reason.clone()));
        }
        self.teardown_stream(reason).await;
    }

    /// Close the stream and every attachment that depends on it
    async fn teardown_stream(&mut self, reason: PathError) {
        self.close_after_deadline = None;

        if let Some(recorder) = self.recorder.take() {
            recorder.close().await;
        }

        for (_, binding) in self.readers.drain() {
            binding.reader.report(Error::Path(reason.clone()));
            if let Some(stream) = &self.stream {
                stream.remove_reader(&binding.reader).await;
            } else {
                binding.reader.cancel();
            }
            if let Some(cmd) = binding.on_read_cmd {
                cmd.close();
            }
        }

        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }

        if let Some(cmd) = self.on_ready_cmd.take() {
            cmd.close();
        }
        if !self.conf.run_on_not_ready.is_empty() {
            // One-shot notification; runs to completion on its own, but the
            // pool can still stop it at shutdown.
            let _ = self
                .cmd_pool
                .spawn(&self.conf.run_on_not_ready, false, self.env(), None);
        }
    }

    async fn on_remove_publisher(&mut self, id: u64) {
        let matches = matches!(
            self.publisher,
            Some(PublisherSlot::External { id: bound, .. }) if bound == id
        );
        if !matches {
            return;
        }
        self.publisher = None;

        let had_readers = !self.readers.is_empty() || !self.parked_readers.is_empty();
        tracing::info!(path = %self.name, "publisher detached");
        self.teardown_stream(PathError::PublisherGone).await;

        let warm = self.conf.is_on_demand()
            && (had_readers || !self.parked_describes.is_empty());
        if had_readers || warm {
            self.state = PathState::WaitingPublisher;
        } else {
            self.start_closing();
        }
    }

    async fn on_source_set_not_ready(&mut self) {
        if !matches!(self.publisher, Some(PublisherSlot::Source)) {
            return;
        }
        self.publisher = None;

        let had_readers = !self.readers.is_empty() || !self.parked_readers.is_empty();
        tracing::info!(path = %self.name, "source not ready");
        self.teardown_stream(PathError::PublisherGone).await;

        // The supervisor keeps restarting an always-on source, so the path
        // keeps waiting; an on-demand source that already stopped means the
        // demand ended.
        if had_readers || self.source.is_some() {
            self.state = PathState::WaitingPublisher;
        } else {
            self.start_closing();
        }
    }

    async fn on_remove_reader(&mut self, id: u64) {
        let Some(binding) = self.readers.remove(&id) else {
            return;
        };
        if let Some(stream) = &self.stream {
            stream.remove_reader(&binding.reader).await;
        } else {
            binding.reader.cancel();
        }
        if let Some(cmd) = binding.on_read_cmd {
            cmd.close();
        }

        tracing::info!(
            path = %self.name,
            reader_id = id,
            readers = self.readers.len(),
            "reader detached"
        );

        if self.readers.is_empty() {
            if self.state == PathState::Ready && self.conf.is_on_demand() {
                self.close_after_deadline =
                    Some(Instant::now() + self.conf.source_on_demand_close_after);
            } else {
                self.maybe_close_if_empty();
            }
        }
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();

        let expired = |expires: Instant| expires <= now;

        let mut timed_out = 0;
        self.parked_describes.retain_mut(|parked| {
            if expired(parked.expires) || parked.reply.is_closed() {
                if !parked.reply.is_closed() {
                    timed_out += 1;
                }
                let reply = std::mem::replace(&mut parked.reply, oneshot::channel().0);
                let _ = reply.send(Err(Error::Path(PathError::NotReady(self.name.clone()))));
                false
            } else {
                true
            }
        });
        self.parked_readers.retain_mut(|parked| {
            if expired(parked.expires) || parked.reply.is_closed() {
                if !parked.reply.is_closed() {
                    timed_out += 1;
                }
                let reply = std::mem::replace(&mut parked.reply, oneshot::channel().0);
                let _ = reply.send(Err(Error::Path(PathError::NotReady(self.name.clone()))));
                false
            } else {
                true
            }
        });
        if timed_out > 0 {
            tracing::debug!(path = %self.name, timed_out, "parked requests timed out");
        }

        // On-demand activation that never became ready: stop and close.
        if self.state == PathState::WaitingPublisher
            && self.conf.is_on_demand()
            && self.parked_describes.is_empty()
            && self.parked_readers.is_empty()
            && self.readers.is_empty()
            && (self.source.is_some() || self.on_demand_cmd.is_some())
        {
            tracing::debug!(path = %self.name, "on-demand start timed out");
            self.demand_stop().await;
            self.maybe_close_if_empty();
        }

        // Idle close-after elapsed: stop the source or command. The
        // deadline is consumed even if the path left `Ready` meanwhile.
        if let Some(deadline) = self.close_after_deadline {
            if expired(deadline) {
                self.close_after_deadline = None;
                if self.state == PathState::Ready && self.readers.is_empty() {
                    tracing::debug!(path = %self.name, "on-demand source is idle, stopping");
                    self.demand_stop().await;

                    if matches!(self.publisher, Some(PublisherSlot::Source)) {
                        // The worker was cancelled and cannot withdraw
                        // itself.
                        self.publisher = None;
                        self.teardown_stream(PathError::Terminated).await;
                        self.start_closing();
                    }
                    // An external on-demand publisher will detach on its
                    // own once its command is gone.
                }
            }
        }
    }

    /// Close the path once nothing refers to it anymore
    fn maybe_close_if_empty(&mut self) {
        let empty = self.state == PathState::WaitingPublisher
            && self.publisher.is_none()
            && self.readers.is_empty()
            && self.parked_describes.is_empty()
            && self.parked_readers.is_empty()
            && self.source.is_none()
            && self.on_demand_cmd.is_none();
        if empty {
            self.start_closing();
        }
    }

    fn start_closing(&mut self) {
        if self.state != PathState::Closing {
            tracing::debug!(path = %self.name, "path closing");
            self.state = PathState::Closing;
        }
    }

    fn snapshot(&self) -> PathSnapshot {
        let source = match (&self.publisher, &self.source) {
            (_, Some(source)) => Some(source.describe()),
            (Some(PublisherSlot::External { .. }), None) => {
                Some(SourceDescription::new("publisher"))
            }
            _ => None,
        };
        PathSnapshot {
            name: self.name.clone(),
            state: self.state.to_string(),
            ready: self.state == PathState::Ready,
            source,
            reader_count: self.readers.len(),
            bytes_received: self.stream.as_ref().map(|s| s.bytes_received()).unwrap_or(0),
            tracks: self
                .stream
                .as_ref()
                .map(|s| {
                    s.desc()
                        .medias
                        .iter()
                        .flat_map(|m| m.formats.iter().map(|f| f.kind.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Final drain: answer everything outstanding with `terminated`, stop
    /// workers, join children, report closure to the manager.
    async fn shutdown(mut self, mut rx: mpsc::Receiver<PathRequest>) {
        self.state = PathState::Closing;
        rx.close();

        for parked in std::mem::take(&mut self.parked_describes) {
            let _ = parked.reply.send(Err(Error::Path(PathError::Terminated)));
        }
        for parked in std::mem::take(&mut self.parked_readers) {
            let _ = parked.reply.send(Err(Error::Path(PathError::Terminated)));
        }

        self.detach_publisher(PathError::Terminated).await;

        if let Some(source) = self.source.take() {
            source.close().await;
        }
        for cmd in [
            self.on_init_cmd.take(),
            self.on_demand_cmd.take(),
            self.on_ready_cmd.take(),
        ]
        .into_iter()
        .flatten()
        {
            cmd.close();
        }

        // Requests that raced with the shutdown are answered, not dropped.
        while let Some(req) = rx.recv().await {
            self.answer_terminated(req);
        }

        self.state = PathState::Closed;
        tracing::info!(path = %self.name, "path closed");

        let _ = self
            .event_tx
            .send(PathEvent::Closed {
                name: self.name.clone(),
                generation: self.generation,
            })
            .await;
    }

    fn answer_terminated(&self, req: PathRequest) {
        match req {
            PathRequest::Describe { reply } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            PathRequest::AddPublisher { reply, .. } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            PathRequest::AddReader { reply } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            PathRequest::SourceSetReady { reply, .. } => {
                let _ = reply.send(Err(Error::Path(PathError::Terminated)));
            }
            PathRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PathRequest::RemovePublisher { .. }
            | PathRequest::RemoveReader { .. }
            | PathRequest::SourceSetNotReady
            | PathRequest::ReloadConf { .. }
            | PathRequest::Close => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::media::{Format, MediaDescription, MediaType, Unit};
    use crate::source::{SourceDescription, SourceImpl};

    fn desc() -> SessionDescription {
        SessionDescription::new(vec![MediaDescription::with_format(
            MediaType::Video,
            Format::h264(),
        )])
    }

    fn spawn_test_path(
        conf: PathConf,
        factory: Option<SourceFactory>,
    ) -> (mpsc::Sender<PathRequest>, mpsc::Receiver<PathEvent>) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let tx = spawn_path(
            PathSettings {
                name: "test".into(),
                conf: Arc::new(conf),
                write_queue_size: 16,
                generation: 1,
                source_factory: factory,
                recorder_hooks: RecorderHooks::default(),
                cmd_pool: Arc::new(CmdPool::new()),
            },
            event_tx,
        );
        (tx, event_rx)
    }

    async fn attach_publisher(tx: &mpsc::Sender<PathRequest>) -> Result<PublisherHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PathRequest::AddPublisher {
            desc: desc(),
            generate_rtp_packets: false,
            reply: reply_tx,
        })
        .await
        .unwrap();
        reply_rx.await.unwrap()
    }

    async fn attach_reader(tx: &mpsc::Sender<PathRequest>) -> Result<ReaderHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PathRequest::AddReader { reply: reply_tx })
            .await
            .unwrap();
        reply_rx.await.unwrap()
    }

    async fn describe(tx: &mpsc::Sender<PathRequest>) -> Result<SessionDescription> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PathRequest::Describe { reply: reply_tx })
            .await
            .unwrap();
        reply_rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_describe_read_detach() {
        let (tx, mut events) = spawn_test_path(PathConf::default(), None);

        let publisher = attach_publisher(&tx).await.unwrap();
        assert_eq!(describe(&tx).await.unwrap(), desc());

        let reader = attach_reader(&tx).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        reader
            .stream()
            .add_reader(
                reader.reader(),
                0,
                0,
                Box::new(move |u| {
                    seen2.lock().push(u.pts);
                    Ok(())
                }),
            )
            .unwrap();

        for i in 0..10 {
            publisher
                .stream()
                .write_unit(0, 0, Unit::new(i, Bytes::from_static(&[1])))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<i64>>());

        // Reader leaves, then the publisher: the path drains and closes.
        reader.close().await;
        publisher.close().await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("path did not close");
        assert!(matches!(event, Some(PathEvent::Closed { generation: 1, .. })));
    }

    #[tokio::test]
    async fn test_second_publisher_rejected_without_override() {
        let (tx, _events) = spawn_test_path(PathConf::default(), None);

        let first = attach_publisher(&tx).await.unwrap();
        let second = attach_publisher(&tx).await;
        assert!(matches!(
            second,
            Err(Error::Path(PathError::AlreadyPublished(_)))
        ));

        // The incumbent is untouched.
        first
            .stream()
            .write_unit(0, 0, Unit::new(0, Bytes::from_static(&[1])))
            .unwrap();
    }

    #[tokio::test]
    async fn test_override_publisher_replaces_and_detaches_readers() {
        let mut conf = PathConf::default();
        conf.override_publisher = true;
        let (tx, _events) = spawn_test_path(conf, None);

        let mut first = attach_publisher(&tx).await.unwrap();
        let mut reader = attach_reader(&tx).await.unwrap();

        let second = attach_publisher(&tx).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), first.error())
            .await
            .unwrap();
        assert!(matches!(err, Error::Path(PathError::PublisherReplaced)));

        let err = tokio::time::timeout(Duration::from_secs(1), reader.error())
            .await
            .unwrap();
        assert!(matches!(err, Error::Path(PathError::PublisherReplaced)));

        // The old stream is detached, the new one is live.
        assert!(first.stream().write_unit(0, 0, Unit::new(0, Bytes::new())).is_err());
        assert!(second.stream().write_unit(0, 0, Unit::new(0, Bytes::new())).is_ok());
    }

    #[tokio::test]
    async fn test_describe_not_ready_closes_empty_path() {
        let (tx, mut events) = spawn_test_path(PathConf::default(), None);

        let res = describe(&tx).await;
        assert!(matches!(res, Err(Error::Path(PathError::NotReady(_)))));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("empty path did not close");
        assert!(matches!(event, Some(PathEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn test_parked_describe_cancelled_before_ready() {
        let mut conf = PathConf::default();
        conf.run_on_demand = "true".into();
        let (tx, _events) = spawn_test_path(conf, None);

        // Two parked describes; the first requester goes away.
        let (reply_a, rx_a) = oneshot::channel();
        tx.send(PathRequest::Describe { reply: reply_a }).await.unwrap();
        drop(rx_a);

        let (reply_b, rx_b) = oneshot::channel();
        tx.send(PathRequest::Describe { reply: reply_b }).await.unwrap();

        let _publisher = attach_publisher(&tx).await.unwrap();

        // The surviving requester is answered; the cancelled one is not
        // delivered anything (its channel is gone).
        let got = tokio::time::timeout(Duration::from_secs(1), rx_b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap(), desc());
    }

    #[tokio::test]
    async fn test_parked_describe_times_out() {
        let mut conf = PathConf::default();
        conf.run_on_demand = "true".into();
        conf.source_on_demand_start_timeout = Duration::from_millis(100);
        let (tx, mut events) = spawn_test_path(conf, None);

        let started = std::time::Instant::now();
        let res = describe(&tx).await;
        assert!(matches!(res, Err(Error::Path(PathError::NotReady(_)))));
        assert!(started.elapsed() >= Duration::from_millis(100));

        // Nothing was demanded anymore: the path closes.
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("on-demand path did not close after timeout");
        assert!(matches!(event, Some(PathEvent::Closed { .. })));
    }

    struct ReadySource;

    #[async_trait]
    impl SourceImpl for ReadySource {
        async fn run(
            &self,
            parent: Arc<dyn SourceParent>,
            _conf: Arc<PathConf>,
            _reload_rx: &mut mpsc::Receiver<Arc<PathConf>>,
        ) -> Result<()> {
            let stream = parent.set_ready(desc(), true).await?;
            stream.write_unit(0, 0, Unit::new(0, Bytes::from_static(&[9])))?;
            // Hold the publication until the supervisor cancels us.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            parent.set_not_ready().await;
            Ok(())
        }

        fn describe(&self) -> SourceDescription {
            SourceDescription::new("readySource")
        }
    }

    fn ready_source_factory() -> SourceFactory {
        Arc::new(|_url| Some(Arc::new(ReadySource) as Arc<dyn SourceImpl>))
    }

    #[tokio::test]
    async fn test_on_demand_source_resolves_parked_describe() {
        let mut conf = PathConf::default();
        conf.source = "test://upstream".into();
        conf.source_on_demand = true;
        conf.source_on_demand_start_timeout = Duration::from_secs(5);
        let (tx, _events) = spawn_test_path(conf, Some(ready_source_factory()));

        // Parked until the source pulls the upstream and publishes.
        let got = tokio::time::timeout(Duration::from_secs(2), describe(&tx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, desc());
    }

    #[tokio::test]
    async fn test_publisher_rejected_on_static_source_path() {
        let mut conf = PathConf::default();
        conf.source = "test://upstream".into();
        let (tx, _events) = spawn_test_path(conf, Some(ready_source_factory()));

        let res = attach_publisher(&tx).await;
        assert!(matches!(
            res,
            Err(Error::Path(PathError::AlreadyPublished(_)))
        ));
    }

    #[tokio::test]
    async fn test_idle_on_demand_source_stops_and_path_closes() {
        let mut conf = PathConf::default();
        conf.source = "test://upstream".into();
        conf.source_on_demand = true;
        conf.source_on_demand_close_after = Duration::from_millis(100);
        let (tx, mut events) = spawn_test_path(conf, Some(ready_source_factory()));

        // Demand, get an answer, never attach a reader.
        describe(&tx).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("idle on-demand path did not close");
        assert!(matches!(event, Some(PathEvent::Closed { .. })));
    }
}
