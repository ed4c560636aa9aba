//! Media units
//!
//! A unit is one codec access unit (frame or sample group) plus timestamps.
//! Units travel through a stream as `Arc<Unit>`; the payload is a `Bytes`
//! so fan-out to any number of readers never copies frame data.

use std::time::SystemTime;

use bytes::Bytes;

/// One media access unit
#[derive(Debug, Clone)]
pub struct Unit {
    /// Wallclock instant at which the unit entered the relay
    pub ntp: SystemTime,

    /// Presentation timestamp in nanoseconds, relative to stream start.
    /// Signed: reordered streams can present before the reference instant.
    pub pts: i64,

    /// Opaque frame or access-unit bytes (zero-copy via reference counting)
    pub payload: Bytes,

    /// Whether decoding can start at this unit (keyframe / sync sample).
    /// Tagged by the ingesting front-end; the core never parses payloads.
    pub random_access: bool,

    /// Updated static codec parameters carried in-band (e.g. a new SPS),
    /// extracted by the ingesting front-end when present
    pub codec_params: Option<Bytes>,
}

impl Unit {
    /// Create a unit with the current wallclock
    pub fn new(pts: i64, payload: Bytes) -> Self {
        Self {
            ntp: SystemTime::now(),
            pts,
            payload,
            random_access: false,
            codec_params: None,
        }
    }

    /// Mark the unit as a random access point
    pub fn random_access(mut self) -> Self {
        self.random_access = true;
        self
    }

    /// Attach in-band codec parameters
    pub fn with_codec_params(mut self, params: Bytes) -> Self {
        self.codec_params = Some(params);
        self
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
