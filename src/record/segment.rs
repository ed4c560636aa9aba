//! On-disk segment files
//!
//! A segment is one recording interval of a path. The container layout is
//! deliberately minimal: a short header describing the tracks (codec label
//! plus static parameters), followed by framed samples in arrival order.
//! Producing a standard container is the job of an external formatter; the
//! core only guarantees that everything needed to do so is on disk.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;

/// Magic bytes at the start of every segment file
const SEGMENT_MAGIC: &[u8; 4] = b"MRSG";

/// Container layout version
const SEGMENT_VERSION: u8 = 1;

/// One track entry in the segment header
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Codec label, e.g. `H264`
    pub kind: String,
    /// Static codec parameters, possibly default-seeded
    pub params: Bytes,
}

/// A segment file being written
pub struct Segment {
    writer: BufWriter<File>,
    path: PathBuf,
    created: Instant,
    bytes_written: u64,
}

impl Segment {
    /// Create the segment file, its parent directories, and write the track
    /// header.
    pub fn create(path: &Path, tracks: &[TrackInfo]) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SEGMENT_MAGIC)?;
        writer.write_all(&[SEGMENT_VERSION, tracks.len() as u8])?;
        for track in tracks {
            let kind = track.kind.as_bytes();
            writer.write_all(&[kind.len() as u8])?;
            writer.write_all(kind)?;
            writer.write_all(&(track.params.len() as u16).to_be_bytes())?;
            writer.write_all(&track.params)?;
        }

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            created: Instant::now(),
            bytes_written: 0,
        })
    }

    /// Append one sample
    pub fn write_sample(
        &mut self,
        track: u8,
        pts: i64,
        random_access: bool,
        payload: &[u8],
    ) -> std::io::Result<()> {
        self.writer.write_all(&[track, u8::from(random_access)])?;
        self.writer.write_all(&pts.to_be_bytes())?;
        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        self.writer.write_all(payload)?;
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    /// Flush buffered parts to disk
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Finalize the segment and return its path
    pub fn finalize(mut self) -> std::io::Result<PathBuf> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.path)
    }

    /// Path of the segment file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wallclock age of the segment
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Payload bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
