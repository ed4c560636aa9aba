//! In-memory stream fan-out
//!
//! A `Stream` is the per-path object that carries media from the single
//! publisher to any number of readers without copying payload bytes.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<Stream>
//!              ┌──────────────────────────────────┐
//!              │ desc: SessionDescription         │
//!              │ buffers[media][format]: UnitRing │
//!              │ readers: HashMap<id, Reader>     │
//!              └───────────────┬──────────────────┘
//!                              │
//!        write_unit()          │           cursor per registration
//!   [Publisher session] ──► UnitRing ──┬──► [drain task] ──► on_unit
//!                                      └──► [drain task] ──► on_unit
//! ```
//!
//! The writer and the readers are fully decoupled: a slow reader overflows
//! its own cursor and never stalls the writer; registration and removal of
//! readers take a short lock that the hot write path shares only as a read
//! lock on the reader map — never a mailbox.

pub mod reader;
pub mod ring;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

pub use reader::{OnUnit, StreamReader};
pub use ring::{RingCursor, UnitRing};

use crate::media::{SessionDescription, Unit};

/// Error type for stream operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// A reader lagged behind the writer by more than the buffer capacity
    #[error("reader overflowed, {skipped} units skipped")]
    Overflow {
        /// Units that were discarded for this cursor
        skipped: u64,
    },

    /// The (media, format) pair is not part of the stream description
    #[error("unknown media/format pair ({media_idx}, {format_idx})")]
    UnknownFormat {
        media_idx: usize,
        format_idx: usize,
    },

    /// The stream has been closed
    #[error("stream detached")]
    Detached,
}

struct FormatBuffer {
    ring: Arc<UnitRing>,
    bytes: AtomicU64,
    units: AtomicU64,
}

/// Per-path fan-out object: one ring per (media, format)
pub struct Stream {
    desc: SessionDescription,
    buffers: Vec<Vec<FormatBuffer>>,
    readers: RwLock<HashMap<u64, StreamReader>>,
    bytes_received: AtomicU64,
    generate_rtp_packets: bool,
}

impl Stream {
    /// Create a stream for a session description.
    ///
    /// `write_queue_size` is the per-reader buffer depth, rounded up to a
    /// power of two. `generate_rtp_packets` is carried for protocol
    /// front-ends that re-packetize on the way out.
    pub fn new(
        desc: SessionDescription,
        write_queue_size: usize,
        generate_rtp_packets: bool,
    ) -> Self {
        let buffers = desc
            .medias
            .iter()
            .map(|media| {
                media
                    .formats
                    .iter()
                    .map(|_| FormatBuffer {
                        ring: Arc::new(UnitRing::new(write_queue_size)),
                        bytes: AtomicU64::new(0),
                        units: AtomicU64::new(0),
                    })
                    .collect()
            })
            .collect();

        Self {
            desc,
            buffers,
            readers: RwLock::new(HashMap::new()),
            bytes_received: AtomicU64::new(0),
            generate_rtp_packets,
        }
    }

    /// The immutable session description
    pub fn desc(&self) -> &SessionDescription {
        &self.desc
    }

    /// Whether outgoing RTP packetization was requested by the publisher
    pub fn generate_rtp_packets(&self) -> bool {
        self.generate_rtp_packets
    }

    /// Total payload bytes written since creation
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Payload bytes written for one (media, format) pair
    pub fn format_bytes(&self, media_idx: usize, format_idx: usize) -> Option<u64> {
        Some(
            self.buffers
                .get(media_idx)?
                .get(format_idx)?
                .bytes
                .load(Ordering::Relaxed),
        )
    }

    /// Units written for one (media, format) pair
    pub fn format_units(&self, media_idx: usize, format_idx: usize) -> Option<u64> {
        Some(
            self.buffers
                .get(media_idx)?
                .get(format_idx)?
                .units
                .load(Ordering::Relaxed),
        )
    }

    /// Number of attached readers
    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Register `on_unit` to run for every unit of `(media_idx, format_idx)`.
    ///
    /// The reader starts at the writer's current sequence; units published
    /// before registration are not replayed. A reader may hold multiple
    /// registrations on the same stream.
    pub fn add_reader(
        &self,
        reader: &StreamReader,
        media_idx: usize,
        format_idx: usize,
        on_unit: OnUnit,
    ) -> Result<(), StreamError> {
        let buffer = self
            .buffers
            .get(media_idx)
            .and_then(|m| m.get(format_idx))
            .ok_or(StreamError::UnknownFormat {
                media_idx,
                format_idx,
            })?;

        reader.spawn_drain(buffer.ring.cursor(), on_unit);

        self.readers
            .write()
            .entry(reader.id())
            .or_insert_with(|| reader.clone());

        tracing::debug!(
            reader_id = reader.id(),
            media_idx,
            format_idx,
            "stream reader registered"
        );
        Ok(())
    }

    /// Remove every registration of `reader` and wait for its callbacks to
    /// stop. Idempotent; unknown readers are ignored.
    pub async fn remove_reader(&self, reader: &StreamReader) {
        let removed = self.readers.write().remove(&reader.id());
        if removed.is_some() {
            reader.cancel();
            reader.join().await;
            tracing::debug!(reader_id = reader.id(), "stream reader removed");
        }
    }

    /// Write a unit. Called only by the current publisher's task.
    ///
    /// Never blocks on readers. Fails with [`StreamError::UnknownFormat`]
    /// for pairs outside the description and [`StreamError::Detached`]
    /// after [`Stream::close`].
    pub fn write_unit(
        &self,
        media_idx: usize,
        format_idx: usize,
        unit: Unit,
    ) -> Result<(), StreamError> {
        let buffer = self
            .buffers
            .get(media_idx)
            .and_then(|m| m.get(format_idx))
            .ok_or(StreamError::UnknownFormat {
                media_idx,
                format_idx,
            })?;

        let size = unit.size() as u64;
        buffer.ring.push(Arc::new(unit))?;

        buffer.bytes.fetch_add(size, Ordering::Relaxed);
        buffer.units.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Close the stream: further writes fail, readers drain what is buffered
    /// and are then detached. Waits for every reader callback to stop.
    pub async fn close(&self) {
        for media in &self.buffers {
            for buffer in media {
                buffer.ring.close();
            }
        }

        let readers: Vec<StreamReader> = self.readers.write().drain().map(|(_, r)| r).collect();
        for reader in readers {
            reader.cancel();
            reader.join().await;
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("desc", &self.desc.summary())
            .field("readers", &self.reader_count())
            .field("bytes_received", &self.bytes_received())
            .finish()
    }
}
