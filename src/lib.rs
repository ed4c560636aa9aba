//! # mediarelay
//!
//! Path manager and session core for a multi-protocol media relay: ingest
//! real-time audio/video from publishers and fan it out to any number of
//! readers with minimal buffering and no transcoding.
//!
//! A single logical *path* identifies a stream; the same path can be
//! published over one protocol and consumed over another. Protocol
//! front-ends stay outside this crate: their whole contract is to open
//! sessions against [`PathManager`] and to move media units through the
//! [`Stream`] they are handed.
//!
//! # Architecture
//!
//! ```text
//!                      PathManagerHandle (Clone)
//!                               │ mailbox
//!                       ┌───────▼────────┐
//!                       │  PathManager   │  auth, template matching,
//!                       │  control task  │  registry, reload, shutdown
//!                       └───────┬────────┘
//!                 one mailbox per│path
//!            ┌──────────────────┼──────────────────┐
//!            ▼                  ▼                  ▼
//!       [Path "live"]      [Path "cam1"]      [Path ...]
//!       state machine      static source      recorder
//!            │                                  agent
//!            ▼ media (no mailbox)
//!        Arc<Stream> ──► UnitRing per (media, format) ──► readers
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use mediarelay::auth::Credentials;
//! use mediarelay::conf::{Conf, PathConf};
//! use mediarelay::media::{Format, MediaDescription, MediaType, SessionDescription, Unit};
//! use mediarelay::path::{ManagerOptions, PathManager};
//!
//! # async fn example() -> mediarelay::error::Result<()> {
//! let mut conf = Conf::default();
//! conf.paths.insert("live".into(), PathConf::default());
//!
//! let manager = PathManager::spawn(conf, ManagerOptions::default())?;
//!
//! let desc = SessionDescription::new(vec![MediaDescription::with_format(
//!     MediaType::Video,
//!     Format::h264(),
//! )]);
//! let publisher = manager
//!     .add_publisher("live", Credentials::default(), "127.0.0.1".parse().unwrap(), desc, false)
//!     .await?;
//!
//! publisher
//!     .stream()
//!     .write_unit(0, 0, Unit::new(0, Bytes::from_static(&[0, 0, 1])).random_access())?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod conf;
pub mod error;
pub mod externalcmd;
pub mod logging;
pub mod media;
pub mod path;
pub mod record;
pub mod source;
pub mod stats;
pub mod stream;

pub use conf::{Conf, PathConf};
pub use error::{Error, Result};
pub use media::{Format, FormatKind, MediaDescription, MediaType, SessionDescription, Unit};
pub use path::{
    ManagerOptions, PathError, PathManager, PathManagerHandle, PathState, PublisherHandle,
    ReaderHandle, SourceFactory,
};
pub use stream::{Stream, StreamError, StreamReader};
