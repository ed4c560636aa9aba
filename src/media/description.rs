//! Media and session descriptions
//!
//! A session description is an ordered list of media descriptions, each
//! carrying an ordered list of formats. Streams address their buffers by
//! `(media index, format index)` pairs into this structure, which is frozen
//! once a stream exists.

use bytes::Bytes;

/// Kind of a media description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Video track
    Video,
    /// Audio track
    Audio,
    /// Application data (e.g. KLV, subtitles)
    Application,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
            MediaType::Application => write!(f, "application"),
        }
    }
}

/// Codec identity of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    H264,
    H265,
    Av1,
    Vp9,
    Mjpeg,
    Opus,
    Mpeg4Audio,
    Mpeg1Audio,
    G711,
    Lpcm,
    /// Codec unknown to the core; payload passes through opaquely
    Generic,
}

impl std::fmt::Display for FormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FormatKind::H264 => "H264",
            FormatKind::H265 => "H265",
            FormatKind::Av1 => "AV1",
            FormatKind::Vp9 => "VP9",
            FormatKind::Mjpeg => "M-JPEG",
            FormatKind::Opus => "Opus",
            FormatKind::Mpeg4Audio => "MPEG-4 Audio",
            FormatKind::Mpeg1Audio => "MPEG-1 Audio",
            FormatKind::G711 => "G711",
            FormatKind::Lpcm => "LPCM",
            FormatKind::Generic => "Generic",
        };
        write!(f, "{name}")
    }
}

/// A codec plus its static parameters
///
/// Two formats compare equal only when codec identity and every static
/// parameter match; this is the definition used when deciding whether a
/// replacement publisher carries a compatible description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Codec identity
    pub kind: FormatKind,

    /// RTP clock rate (90000 for video codecs)
    pub clock_rate: u32,

    /// H.264/H.265 sequence parameter set
    pub sps: Option<Bytes>,

    /// H.264/H.265 picture parameter set
    pub pps: Option<Bytes>,

    /// H.265 video parameter set
    pub vps: Option<Bytes>,

    /// Codec-specific configuration blob (e.g. AudioSpecificConfig)
    pub config: Option<Bytes>,

    /// Audio sample rate
    pub sample_rate: Option<u32>,

    /// Audio channel count
    pub channel_count: Option<u8>,
}

impl Format {
    /// Create a format with no static parameters
    pub fn new(kind: FormatKind, clock_rate: u32) -> Self {
        Self {
            kind,
            clock_rate,
            sps: None,
            pps: None,
            vps: None,
            config: None,
            sample_rate: None,
            channel_count: None,
        }
    }

    /// H.264 format without in-band parameters
    pub fn h264() -> Self {
        Self::new(FormatKind::H264, 90_000)
    }

    /// H.264 format with SPS/PPS
    pub fn h264_with_params(sps: Bytes, pps: Bytes) -> Self {
        Self {
            sps: Some(sps),
            pps: Some(pps),
            ..Self::h264()
        }
    }

    /// H.265 format without in-band parameters
    pub fn h265() -> Self {
        Self::new(FormatKind::H265, 90_000)
    }

    /// Opus format
    pub fn opus(stereo: bool) -> Self {
        Self {
            sample_rate: Some(48_000),
            channel_count: Some(if stereo { 2 } else { 1 }),
            ..Self::new(FormatKind::Opus, 48_000)
        }
    }

    /// MPEG-4 Audio (AAC) format
    pub fn mpeg4_audio(config: Bytes, sample_rate: u32, channel_count: u8) -> Self {
        Self {
            config: Some(config),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Self::new(FormatKind::Mpeg4Audio, sample_rate)
        }
    }

    /// LPCM format
    pub fn lpcm(sample_rate: u32, channel_count: u8) -> Self {
        Self {
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Self::new(FormatKind::Lpcm, sample_rate)
        }
    }
}

/// One media of a session: a type plus its ordered formats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media type
    pub media_type: MediaType,

    /// Ordered formats; at least one
    pub formats: Vec<Format>,
}

impl MediaDescription {
    /// Create a media description with a single format
    pub fn with_format(media_type: MediaType, format: Format) -> Self {
        Self {
            media_type,
            formats: vec![format],
        }
    }
}

/// Ordered list of media descriptions; immutable once a stream exists
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    /// Medias in publisher order
    pub medias: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Create a session description from medias
    pub fn new(medias: Vec<MediaDescription>) -> Self {
        Self { medias }
    }

    /// Look up a format by indices
    pub fn format(&self, media_idx: usize, format_idx: usize) -> Option<&Format> {
        self.medias.get(media_idx)?.formats.get(format_idx)
    }

    /// Find the first `(media_idx, format_idx)` carrying the given codec
    pub fn find_format(&self, kind: FormatKind) -> Option<(usize, usize)> {
        for (mi, media) in self.medias.iter().enumerate() {
            for (fi, format) in media.formats.iter().enumerate() {
                if format.kind == kind {
                    return Some((mi, fi));
                }
            }
        }
        None
    }

    /// Total number of formats across all medias
    pub fn format_count(&self) -> usize {
        self.medias.iter().map(|m| m.formats.len()).sum()
    }

    /// Check structural validity: at least one media, each with a format
    pub fn is_valid(&self) -> bool {
        !self.medias.is_empty() && self.medias.iter().all(|m| !m.formats.is_empty())
    }

    /// Short human-readable codec summary, e.g. "1 track (H264)"
    pub fn summary(&self) -> String {
        let codecs: Vec<String> = self
            .medias
            .iter()
            .flat_map(|m| m.formats.iter().map(|f| f.kind.to_string()))
            .collect();
        let n = codecs.len();
        format!(
            "{} {} ({})",
            n,
            if n == 1 { "track" } else { "tracks" },
            codecs.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_h264_opus() -> SessionDescription {
        SessionDescription::new(vec![
            MediaDescription::with_format(MediaType::Video, Format::h264()),
            MediaDescription::with_format(MediaType::Audio, Format::opus(true)),
        ])
    }

    #[test]
    fn test_find_format() {
        let desc = desc_h264_opus();
        assert_eq!(desc.find_format(FormatKind::H264), Some((0, 0)));
        assert_eq!(desc.find_format(FormatKind::Opus), Some((1, 0)));
        assert_eq!(desc.find_format(FormatKind::Vp9), None);
    }

    #[test]
    fn test_format_lookup() {
        let desc = desc_h264_opus();
        assert_eq!(desc.format(0, 0).unwrap().kind, FormatKind::H264);
        assert!(desc.format(2, 0).is_none());
        assert!(desc.format(0, 1).is_none());
    }

    #[test]
    fn test_validity() {
        assert!(desc_h264_opus().is_valid());
        assert!(!SessionDescription::default().is_valid());

        let empty_media = SessionDescription::new(vec![MediaDescription {
            media_type: MediaType::Video,
            formats: vec![],
        }]);
        assert!(!empty_media.is_valid());
    }

    #[test]
    fn test_format_equality_includes_params() {
        let a = Format::h264_with_params(Bytes::from_static(&[1, 2]), Bytes::from_static(&[3]));
        let b = Format::h264_with_params(Bytes::from_static(&[1, 2]), Bytes::from_static(&[3]));
        let c = Format::h264_with_params(Bytes::from_static(&[9, 9]), Bytes::from_static(&[3]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Format::h264());
    }

    #[test]
    fn test_summary() {
        assert_eq!(desc_h264_opus().summary(), "2 tracks (H264, Opus)");
        let video_only = SessionDescription::new(vec![MediaDescription::with_format(
            MediaType::Video,
            Format::h264(),
        )]);
        assert_eq!(video_only.summary(), "1 track (H264)");
    }
}
