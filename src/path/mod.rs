//! Paths and the path manager
//!
//! A path is a named stream endpoint with an explicit state machine. The
//! manager owns the set of paths and is the single serialization point for
//! every create/find/attach/detach request; each path runs its own control
//! task with a bounded mailbox. Media never crosses a mailbox: once a
//! session holds a stream, units flow through it directly.
//!
//! # State machine
//!
//! ```text
//! initial ──► waitingPublisher ◄──► ready ──► closing ──► closed
//! ```

pub mod manager;
#[allow(clippy::module_inception)]
pub mod path;

pub use manager::{ManagerOptions, PathManager, PathManagerHandle, SourceFactory};
pub use path::{PathState, PublisherHandle, ReaderHandle};

/// Path lifecycle errors, recoverable at the session level
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The path does not exist and no template permits creating it
    #[error("path '{0}' not found")]
    NotFound(String),

    /// No configuration template matches the requested name
    #[error("no configuration template matches path '{0}'")]
    NoConfMatches(String),

    /// The path exists but has no publisher (and none is expected soon)
    #[error("path '{0}' is not ready")]
    NotReady(String),

    /// Another publisher is already bound to the path
    #[error("path '{0}' is already being published")]
    AlreadyPublished(String),

    /// The incumbent publisher was replaced by a new one
    #[error("publisher replaced")]
    PublisherReplaced,

    /// The publisher disconnected
    #[error("publisher gone")]
    PublisherGone,

    /// The path or the manager shut down while the request was in flight
    #[error("terminated")]
    Terminated,
}
