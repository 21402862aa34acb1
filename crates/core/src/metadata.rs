// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream metadata.
//!
//! Metadata describes the stream a packet belongs to, not the packet itself.
//! It is shared (`Arc`) between an output, the inputs it feeds, and the
//! packets in flight. Compatibility between two metadata instances is
//! defined by stream-kind equality only; deeper fields (codec, resolution)
//! are informational.

use crate::data::PcmFormat;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Discriminates every stream flowing through a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Uncompressed audio.
    AudioRaw,
    /// Uncompressed video.
    VideoRaw,
    /// Compressed audio.
    AudioPkt,
    /// Compressed video.
    VideoPkt,
    /// Subtitles and captions.
    SubtitlePkt,
    /// Playlists and adaptive-streaming manifests.
    Playlist,
    /// Adaptive-streaming init and media segments.
    Segment,
    Unknown,
}

/// Picture geometry in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel formats the framework understands natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Y8,
    I420,
    Yuv422p,
    Nv12,
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    /// Total picture size in bytes at the given resolution.
    pub const fn picture_size(self, res: Resolution) -> usize {
        let pixels = (res.width as usize) * (res.height as usize);
        match self {
            Self::Y8 => pixels,
            Self::I420 | Self::Nv12 => pixels * 3 / 2,
            Self::Yuv422p => pixels * 2,
            Self::Rgb24 => pixels * 3,
            Self::Rgba32 => pixels * 4,
        }
    }

    pub const fn num_planes(self) -> usize {
        match self {
            Self::Y8 | Self::Rgb24 | Self::Rgba32 => 1,
            Self::Nv12 => 2,
            Self::I420 | Self::Yuv422p => 3,
        }
    }
}

/// Raw video stream description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVideoInfo {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Frames per second, as an exact `(num, den)` pair.
    pub framerate: (i64, i64),
}

/// Compressed audio stream description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktAudioInfo {
    /// Codec name, e.g. `aac`.
    pub codec: String,
    /// Codec-specific initialization bytes.
    pub init_bytes: Bytes,
    pub bitrate_bps: u64,
    pub timescale: i64,
    pub channels: u32,
    pub sample_rate: u32,
    /// Samples per frame, e.g. 1024 for AAC.
    pub frame_size: u32,
}

/// Compressed video stream description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktVideoInfo {
    pub codec: String,
    pub init_bytes: Bytes,
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Sample aspect ratio `(num, den)`.
    pub sar: (i64, i64),
    pub framerate: (i64, i64),
}

/// Description of a file-shaped payload: a segment or a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// `Segment` or `Playlist`.
    pub kind: StreamKind,
    pub filename: String,
    pub mime_type: String,
    /// RFC 6381 codec string, e.g. `avc1.64001f`.
    pub codec_name: String,
    /// Duration in 180 kHz ticks; zero marks an init segment.
    pub duration_in_180k: i64,
    pub filesize: i64,
    /// End-to-end latency contributed by the producer, in 180 kHz ticks.
    pub latency_in_180k: i64,
    /// The payload starts with a random-access point.
    pub starts_with_rap: bool,
    /// Final packet of the stream.
    pub eos: bool,
    /// Video geometry, when known (manifest writers need it).
    pub resolution: Option<Resolution>,
    /// Audio sampling rate, when known.
    pub sample_rate: Option<u32>,
}

impl FileInfo {
    pub fn segment() -> Self {
        Self::with_kind(StreamKind::Segment)
    }

    pub fn playlist() -> Self {
        Self::with_kind(StreamKind::Playlist)
    }

    /// File metadata tagged with the stream kind it describes. Segment
    /// producers use the packetized kinds so the packager can tell
    /// audio/video/subtitle qualities apart.
    pub fn with_kind(kind: StreamKind) -> Self {
        Self {
            kind,
            filename: String::new(),
            mime_type: String::new(),
            codec_name: String::new(),
            duration_in_180k: 0,
            filesize: 0,
            latency_in_180k: 0,
            starts_with_rap: false,
            eos: false,
            resolution: None,
            sample_rate: None,
        }
    }
}

/// Stream metadata, tagged by [`StreamKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    RawAudio(PcmFormat),
    RawVideo(RawVideoInfo),
    PktAudio(PktAudioInfo),
    PktVideo(PktVideoInfo),
    PktSubtitle,
    File(FileInfo),
}

impl Metadata {
    pub const fn kind(&self) -> StreamKind {
        match self {
            Self::RawAudio(_) => StreamKind::AudioRaw,
            Self::RawVideo(_) => StreamKind::VideoRaw,
            Self::PktAudio(_) => StreamKind::AudioPkt,
            Self::PktVideo(_) => StreamKind::VideoPkt,
            Self::PktSubtitle => StreamKind::SubtitlePkt,
            Self::File(f) => f.kind,
        }
    }

    pub const fn is_audio(&self) -> bool {
        matches!(self.kind(), StreamKind::AudioRaw | StreamKind::AudioPkt)
    }

    pub const fn is_video(&self) -> bool {
        matches!(self.kind(), StreamKind::VideoRaw | StreamKind::VideoPkt)
    }

    pub const fn is_subtitle(&self) -> bool {
        matches!(self.kind(), StreamKind::SubtitlePkt)
    }

    /// Minimal compatibility check: stream kinds must match.
    pub fn compatible_with(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }

    pub const fn as_file(&self) -> Option<&FileInfo> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }
}
