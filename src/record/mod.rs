//! Recorder agent
//!
//! When recording is configured and a path becomes ready, the agent attaches
//! to the path's stream as an ordinary reader and writes segments to disk.
//! Segments rotate when the maximum segment duration elapses at a random
//! access point, when a track's codec parameters change in-band, and when
//! the agent is closed (publisher detach or shutdown).

pub mod segment;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use segment::{Segment, TrackInfo};

use crate::conf::PathConf;
use crate::error::{Error, Result};
use crate::media::{Format, FormatKind, MediaType, Unit};
use crate::stream::{Stream, StreamError, StreamReader};

/// Callback invoked with the segment path on creation / completion
pub type OnSegmentFunc = Arc<dyn Fn(&Path) + Send + Sync>;

/// Segment lifecycle hooks
#[derive(Clone, Default)]
pub struct RecorderHooks {
    pub on_segment_create: Option<OnSegmentFunc>,
    pub on_segment_complete: Option<OnSegmentFunc>,
}

/// Default H.264 SPS used when the publisher has not signaled parameters
const DEFAULT_H264_SPS: [u8; 25] = [
    0x67, 0x42, 0xc0, 0x1f, 0xd9, 0x00, 0xf0, 0x11, 0x7e, 0xf0, 0x11, 0x00, 0x00, 0x03, 0x00,
    0x01, 0x00, 0x00, 0x03, 0x00, 0x30, 0x8f, 0x18, 0x32, 0x48,
];

/// Default H.264 PPS used when the publisher has not signaled parameters
const DEFAULT_H264_PPS: [u8; 4] = [0x68, 0xcb, 0x8c, 0xb2];

/// Static parameters recorded for a format, default-seeded where the
/// publisher has not provided them
fn seed_params(format: &Format) -> Bytes {
    if let (Some(sps), Some(pps)) = (&format.sps, &format.pps) {
        let mut buf = BytesMut::with_capacity(sps.len() + pps.len());
        buf.extend_from_slice(sps);
        buf.extend_from_slice(pps);
        return buf.freeze();
    }
    if format.kind == FormatKind::H264 {
        let mut buf = BytesMut::with_capacity(DEFAULT_H264_SPS.len() + DEFAULT_H264_PPS.len());
        buf.extend_from_slice(&DEFAULT_H264_SPS);
        buf.extend_from_slice(&DEFAULT_H264_PPS);
        return buf.freeze();
    }
    format.config.clone().unwrap_or_default()
}

/// Expand a record path template: `%path` plus strftime-style fields
pub fn expand_record_path(template: &str, path_name: &str, format_label: &str) -> PathBuf {
    let expanded = template.replace("%path", path_name);

    let mut out = String::new();
    use std::fmt::Write;
    if write!(out, "{}", chrono::Local::now().format(&expanded)).is_err() {
        // Unknown strftime field: keep the template text as-is.
        out = expanded;
    }

    out.push('.');
    out.push_str(format_label);
    PathBuf::from(out)
}

struct RecorderSample {
    track: u8,
    unit: Arc<Unit>,
}

/// Per-path recording controller
pub struct RecorderAgent {
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

impl RecorderAgent {
    /// Attach a recorder to `stream` according to `conf`.
    ///
    /// One reader registration is created per (media, format) of the stream
    /// description; missing codec parameters are seeded with safe defaults.
    pub fn new(
        path_name: &str,
        conf: &PathConf,
        write_queue_size: usize,
        stream: Arc<Stream>,
        hooks: RecorderHooks,
    ) -> Result<Self> {
        let (reader, error_rx) = StreamReader::new();
        let (sample_tx, sample_rx) = mpsc::channel(write_queue_size.max(16));

        let mut tracks = Vec::new();
        let mut has_video = false;
        let mut track_idx: u8 = 0;

        for (mi, media) in stream.desc().medias.iter().enumerate() {
            if media.media_type == MediaType::Video {
                has_video = true;
            }
            for (fi, format) in media.formats.iter().enumerate() {
                tracks.push(TrackInfo {
                    kind: format.kind.to_string(),
                    params: seed_params(format),
                });

                let tx = sample_tx.clone();
                let track = track_idx;
                let name = path_name.to_string();
                stream.add_reader(
                    &reader,
                    mi,
                    fi,
                    Box::new(move |unit| {
                        match tx.try_send(RecorderSample { track, unit }) {
                            Ok(()) => Ok(()),
                            // A full queue only loses this sample; a closed
                            // queue means the agent stopped, detach.
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(
                                    path = %name,
                                    track,
                                    "recorder queue full, sample dropped"
                                );
                                Ok(())
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                Err(Error::Stream(StreamError::Detached))
                            }
                        }
                    }),
                )?;
                track_idx += 1;
            }
        }

        tracing::info!(
            path = %path_name,
            tracks = tracks.len(),
            "recording started"
        );

        let cancel = CancellationToken::new();
        let worker = RecorderWorker {
            path_name: path_name.to_string(),
            record_path: conf.record_path.clone(),
            record_format: conf.record_format.clone(),
            part_duration: conf.record_part_duration,
            segment_duration: conf.record_segment_duration,
            tracks,
            has_video,
            hooks,
            stream,
            reader,
            cancel: cancel.clone(),
        };
        let done = tokio::spawn(worker.run(sample_rx, error_rx));

        Ok(Self { cancel, done })
    }

    /// Stop recording, finalize the current segment, detach from the stream
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }
}

struct RecorderWorker {
    path_name: String,
    record_path: String,
    record_format: String,
    part_duration: Duration,
    segment_duration: Duration,
    tracks: Vec<TrackInfo>,
    has_video: bool,
    hooks: RecorderHooks,
    stream: Arc<Stream>,
    reader: StreamReader,
    cancel: CancellationToken,
}

impl RecorderWorker {
    async fn run(
        self,
        mut sample_rx: mpsc::Receiver<RecorderSample>,
        mut error_rx: mpsc::Receiver<Error>,
    ) {
        let mut state = SegmentState::new(self.tracks.len());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                err = error_rx.recv() => {
                    match err {
                        Some(Error::Stream(StreamError::Overflow { skipped })) => {
                            tracing::warn!(
                                path = %self.path_name,
                                skipped,
                                "recorder lagging, samples skipped"
                            );
                        }
                        _ => break,
                    }
                }

                sample = sample_rx.recv() => {
                    let Some(sample) = sample else { break };
                    if !self.handle_sample(&mut state, sample) {
                        break;
                    }
                }
            }
        }

        self.finish(state).await;
    }

    /// Returns false on a writer error, which stops the agent
    fn handle_sample(&self, state: &mut SegmentState, sample: RecorderSample) -> bool {
        let unit = &sample.unit;
        let track = sample.track as usize;

        // In-band parameter change closes the current segment so the next
        // one records the updated parameters.
        if let Some(params) = &unit.codec_params {
            let seen = &mut state.codec_params[track];
            if seen.as_ref() != Some(params) {
                *seen = Some(params.clone());
                if state.current.is_some() {
                    tracing::debug!(path = %self.path_name, "codec parameters changed");
                    self.complete_segment(state);
                }
            }
        }

        // A new segment starts only at a point decoders can enter.
        let can_start = unit.random_access || !self.has_video;

        if let Some(start_pts) = state.start_pts {
            let elapsed = unit.pts.saturating_sub(start_pts);
            if elapsed >= self.segment_duration.as_nanos() as i64 && can_start {
                self.complete_segment(state);
            }
        }

        if state.current.is_none() {
            if !can_start {
                return true;
            }
            let path = expand_record_path(&self.record_path, &self.path_name, &self.record_format);
            match Segment::create(&path, &self.seeded_tracks(state)) {
                Ok(segment) => {
                    tracing::info!(path = %self.path_name, segment = %path.display(), "segment created");
                    if let Some(hook) = &self.hooks.on_segment_create {
                        hook(&path);
                    }
                    state.current = Some(segment);
                    state.start_pts = Some(unit.pts);
                    state.last_flush = Instant::now();
                }
                Err(e) => {
                    tracing::error!(path = %self.path_name, error = %e, "segment creation failed");
                    return false;
                }
            }
        }

        let Some(segment) = state.current.as_mut() else {
            return true;
        };

        if let Err(e) = segment.write_sample(
            sample.track,
            unit.pts,
            unit.random_access,
            &unit.payload,
        ) {
            tracing::error!(path = %self.path_name, error = %e, "segment write failed");
            return false;
        }

        if state.last_flush.elapsed() >= self.part_duration {
            if let Err(e) = segment.flush() {
                tracing::error!(path = %self.path_name, error = %e, "segment flush failed");
                return false;
            }
            state.last_flush = Instant::now();
        }

        true
    }

    /// Track header for the next segment, preferring parameters observed
    /// in-band over the seeded defaults
    fn seeded_tracks(&self, state: &SegmentState) -> Vec<TrackInfo> {
        self.tracks
            .iter()
            .enumerate()
            .map(|(i, info)| TrackInfo {
                kind: info.kind.clone(),
                params: state.codec_params[i].clone().unwrap_or_else(|| info.params.clone()),
            })
            .collect()
    }

    fn complete_segment(&self, state: &mut SegmentState) {
        if let Some(segment) = state.current.take() {
            let path = segment.path().to_path_buf();
            match segment.finalize() {
                Ok(_) => {
                    tracing::info!(path = %self.path_name, segment = %path.display(), "segment completed");
                    if let Some(hook) = &self.hooks.on_segment_complete {
                        hook(&path);
                    }
                }
                Err(e) => {
                    tracing::error!(path = %self.path_name, error = %e, "segment finalize failed");
                }
            }
        }
        state.start_pts = None;
    }

    async fn finish(self, mut state: SegmentState) {
        self.complete_segment(&mut state);
        self.stream.remove_reader(&self.reader).await;
        tracing::info!(path = %self.path_name, "recording stopped");
    }
}

struct SegmentState {
    current: Option<Segment>,
    start_pts: Option<i64>,
    last_flush: Instant,
    codec_params: Vec<Option<Bytes>>,
}

impl SegmentState {
    fn new(track_count: usize) -> Self {
        Self {
            current: None,
            start_pts: None,
            last_flush: Instant::now(),
            codec_params: vec![None; track_count],
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::media::{MediaDescription, SessionDescription};

    fn desc() -> SessionDescription {
        SessionDescription::new(vec![MediaDescription::with_format(
            MediaType::Video,
            Format::h264(),
        )])
    }

    fn record_conf(dir: &Path) -> PathConf {
        let mut conf = PathConf::default();
        conf.record = true;
        conf.record_path = dir.join("%path/seg-%H%M%S").display().to_string();
        conf.record_format = "fmp4".into();
        conf.record_part_duration = Duration::from_millis(10);
        conf.record_segment_duration = Duration::from_secs(3600);
        conf
    }

    #[test]
    fn test_seed_params_defaults_for_h264() {
        let params = seed_params(&Format::h264());
        assert_eq!(&params[..4], &DEFAULT_H264_SPS[..4]);

        let explicit = Format::h264_with_params(
            Bytes::from_static(&[0x67, 0x01]),
            Bytes::from_static(&[0x68, 0x02]),
        );
        assert_eq!(seed_params(&explicit), Bytes::from_static(&[0x67, 0x01, 0x68, 0x02]));
    }

    #[test]
    fn test_expand_record_path() {
        let out = expand_record_path("/rec/%path/fixed", "live/cam1", "fmp4");
        assert_eq!(out, PathBuf::from("/rec/live/cam1/fixed.fmp4"));

        let out = expand_record_path("/rec/%path/%Y", "cam", "fmp4");
        let s = out.display().to_string();
        assert!(s.starts_with("/rec/cam/2"));
        assert!(s.ends_with(".fmp4"));
    }

    #[tokio::test]
    async fn test_recorder_writes_and_finalizes_segment() {
        let dir = tempfile::tempdir().unwrap();
        let conf = record_conf(dir.path());

        let stream = Arc::new(Stream::new(desc(), 16, false));

        let created = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(Vec::new()));
        let c1 = Arc::clone(&created);
        let c2 = Arc::clone(&completed);
        let hooks = RecorderHooks {
            on_segment_create: Some(Arc::new(move |p: &Path| {
                c1.lock().push(p.to_path_buf());
            })),
            on_segment_complete: Some(Arc::new(move |p: &Path| {
                c2.lock().push(p.to_path_buf());
            })),
        };

        let agent =
            RecorderAgent::new("cam1", &conf, 16, Arc::clone(&stream), hooks).unwrap();

        // First unit is not a random access point and must not open a file.
        stream
            .write_unit(0, 0, Unit::new(0, Bytes::from_static(&[1])))
            .unwrap();
        // Keyframe starts the segment; followers are appended.
        stream
            .write_unit(
                0,
                0,
                Unit::new(10, Bytes::from_static(&[2, 2])).random_access(),
            )
            .unwrap();
        stream
            .write_unit(0, 0, Unit::new(20, Bytes::from_static(&[3])))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.close().await;

        let created = created.lock();
        let completed = completed.lock();
        assert_eq!(created.len(), 1);
        assert_eq!(completed.as_slice(), created.as_slice());

        let data = std::fs::read(&created[0]).unwrap();
        assert_eq!(&data[..4], b"MRSG");
        // Header plus the two recorded samples (3 payload bytes total).
        assert!(data.len() > 22 + 2 * 14);
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_codec_param_change_rotates_segment() {
        let dir = tempfile::tempdir().unwrap();
        let conf = record_conf(dir.path());

        let stream = Arc::new(Stream::new(desc(), 16, false));

        let completed = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&completed);
        let hooks = RecorderHooks {
            on_segment_create: None,
            on_segment_complete: Some(Arc::new(move |p: &Path| {
                c.lock().push(p.to_path_buf());
            })),
        };

        let agent =
            RecorderAgent::new("cam1", &conf, 16, Arc::clone(&stream), hooks).unwrap();

        stream
            .write_unit(
                0,
                0,
                Unit::new(0, Bytes::from_static(&[1]))
                    .random_access()
                    .with_codec_params(Bytes::from_static(&[0x67, 0xAA])),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // New SPS mid-stream closes the current segment.
        stream
            .write_unit(
                0,
                0,
                Unit::new(1_000, Bytes::from_static(&[2]))
                    .random_access()
                    .with_codec_params(Bytes::from_static(&[0x67, 0xBB])),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        agent.close().await;

        // One rotation mid-stream plus the final close.
        assert_eq!(completed.lock().len(), 2);
    }
}
