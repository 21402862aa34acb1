// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Data packets.
//!
//! A [`Packet`] is the unit of data flowing over a connection: a payload,
//! the stream [`Metadata`], and a small attribute bag. Packets clone in
//! O(1) — the payload is shared behind an `Arc` — which is what makes
//! fan-out over a signal cheap. By convention a packet is immutable once it
//! has been posted on an output.

use crate::attributes::{Attribute, Attributes};
use crate::metadata::{Metadata, PixelFormat, Resolution};
use crate::pool::PooledBuffer;
use bytes::Bytes;
use std::sync::Arc;

/// Tail padding after each picture plane so SIMD consumers may read past
/// the nominal end.
pub const PLANE_PADDING: usize = 16;

/// Sample formats for raw audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SampleFormat {
    S16,
    F32,
}

impl SampleFormat {
    pub const fn bytes(self) -> usize {
        match self {
            Self::S16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Channel layouts for raw audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AudioLayout {
    Mono,
    Stereo,
    FivePointOne,
}

impl AudioLayout {
    pub const fn num_channels(self) -> u32 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::FivePointOne => 6,
        }
    }
}

/// Plane organization for raw audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AudioStruct {
    Interleaved,
    Planar,
}

/// Raw audio stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub layout: AudioLayout,
    pub sample_format: SampleFormat,
    pub organization: AudioStruct,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, layout: AudioLayout, sample_format: SampleFormat, organization: AudioStruct) -> Self {
        Self { sample_rate, layout, sample_format, organization }
    }

    pub const fn num_channels(&self) -> u32 {
        self.layout.num_channels()
    }

    pub const fn num_planes(&self) -> usize {
        match self.organization {
            AudioStruct::Interleaved => 1,
            AudioStruct::Planar => self.layout.num_channels() as usize,
        }
    }

    /// Bytes of one sample across all channels.
    pub const fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes() * self.layout.num_channels() as usize
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::new(44_100, AudioLayout::Stereo, SampleFormat::F32, AudioStruct::Planar)
    }
}

/// A frame of raw audio. Planes live side by side in one contiguous buffer,
/// so the whole frame is also addressable as a single byte span.
#[derive(Debug)]
pub struct PcmFrame {
    format: PcmFormat,
    sample_count: usize,
    data: PooledBuffer,
}

impl PcmFrame {
    /// Wrap a buffer sized for `sample_count` samples of `format`.
    /// The buffer is resized to the exact frame size.
    pub fn new(format: PcmFormat, sample_count: usize, mut data: PooledBuffer) -> Self {
        data.resize(sample_count * format.bytes_per_sample());
        Self { format, sample_count, data }
    }

    pub const fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub const fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Bytes of one plane.
    pub const fn plane_size(&self) -> usize {
        self.sample_count * self.format.bytes_per_sample() / self.format.num_planes()
    }

    pub fn plane(&self, idx: usize) -> &[u8] {
        let sz = self.plane_size();
        &self.data.as_slice()[idx * sz..(idx + 1) * sz]
    }

    pub fn plane_mut(&mut self, idx: usize) -> &mut [u8] {
        let sz = self.plane_size();
        &mut self.data.as_mut_slice()[idx * sz..(idx + 1) * sz]
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// A raw picture: planes in one buffer, each padded by [`PLANE_PADDING`]
/// bytes. The internal resolution may be wider than the visible one, e.g.
/// when a decoder emits aligned strides.
#[derive(Debug)]
pub struct VideoFrame {
    pixel_format: PixelFormat,
    internal: Resolution,
    visible: Resolution,
    plane_offsets: Vec<usize>,
    plane_sizes: Vec<usize>,
    strides: Vec<usize>,
    data: PooledBuffer,
}

impl VideoFrame {
    /// Lay out a picture of `internal` resolution inside `data`, resizing it
    /// to the required size. The visible resolution starts equal to the
    /// internal one.
    pub fn new(pixel_format: PixelFormat, internal: Resolution, mut data: PooledBuffer) -> Self {
        let mut plane_offsets = Vec::new();
        let mut plane_sizes = Vec::new();
        let mut strides = Vec::new();
        let mut offset = 0usize;
        for idx in 0..pixel_format.num_planes() {
            let (w, h) = Self::plane_dims(pixel_format, internal, idx);
            plane_offsets.push(offset);
            plane_sizes.push(w * h);
            strides.push(w);
            offset += w * h + PLANE_PADDING;
        }
        data.resize(offset);
        Self { pixel_format, internal, visible: internal, plane_offsets, plane_sizes, strides, data }
    }

    const fn plane_dims(fmt: PixelFormat, res: Resolution, idx: usize) -> (usize, usize) {
        let (w, h) = (res.width as usize, res.height as usize);
        match fmt {
            PixelFormat::Y8 => (w, h),
            PixelFormat::I420 => {
                if idx == 0 {
                    (w, h)
                } else {
                    (w.div_ceil(2), h.div_ceil(2))
                }
            },
            PixelFormat::Nv12 => {
                if idx == 0 {
                    (w, h)
                } else {
                    (w, h.div_ceil(2))
                }
            },
            PixelFormat::Yuv422p => {
                if idx == 0 {
                    (w, h)
                } else {
                    (w.div_ceil(2), h)
                }
            },
            PixelFormat::Rgb24 => (w * 3, h),
            PixelFormat::Rgba32 => (w * 4, h),
        }
    }

    pub const fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub const fn resolution(&self) -> Resolution {
        self.visible
    }

    pub const fn internal_resolution(&self) -> Resolution {
        self.internal
    }

    /// Restrict the visible area. The internal resolution is the upper
    /// bound: a visible size exceeding it is a caller bug.
    pub fn set_visible_resolution(&mut self, res: Resolution) -> crate::error::Result<()> {
        if res.width > self.internal.width || res.height > self.internal.height {
            return Err(crate::error::CastflowError::Runtime(format!(
                "visible resolution {res} exceeds internal {}",
                self.internal
            )));
        }
        self.visible = res;
        Ok(())
    }

    pub const fn num_planes(&self) -> usize {
        self.pixel_format.num_planes()
    }

    pub fn plane(&self, idx: usize) -> &[u8] {
        &self.data.as_slice()[self.plane_offsets[idx]..][..self.plane_sizes[idx]]
    }

    pub fn plane_mut(&mut self, idx: usize) -> &mut [u8] {
        let (off, sz) = (self.plane_offsets[idx], self.plane_sizes[idx]);
        &mut self.data.as_mut_slice()[off..][..sz]
    }

    pub fn stride(&self, idx: usize) -> usize {
        self.strides[idx]
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// Raw byte payload: either pool-backed (recycled on last release) or a
/// shared immutable slice.
#[derive(Debug)]
pub enum RawBuffer {
    Pooled(PooledBuffer),
    Shared(Bytes),
}

impl RawBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled(b) => b.as_slice(),
            Self::Shared(b) => b.as_ref(),
        }
    }
}

/// Packet payload variants.
#[derive(Debug, Clone)]
pub enum Payload {
    /// No payload: declaration and control packets.
    Empty,
    Raw(Arc<RawBuffer>),
    Audio(Arc<PcmFrame>),
    Video(Arc<VideoFrame>),
}

/// The unit of data exchanged between modules. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Payload,
    metadata: Option<Arc<Metadata>>,
    attrs: Attributes,
}

impl Packet {
    /// A payload-less packet (declarations, deletes).
    pub fn empty() -> Self {
        Self { payload: Payload::Empty, metadata: None, attrs: Attributes::new() }
    }

    pub fn from_raw(buffer: PooledBuffer) -> Self {
        Self { payload: Payload::Raw(Arc::new(RawBuffer::Pooled(buffer))), metadata: None, attrs: Attributes::new() }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { payload: Payload::Raw(Arc::new(RawBuffer::Shared(bytes))), metadata: None, attrs: Attributes::new() }
    }

    pub fn from_pcm(frame: PcmFrame) -> Self {
        Self { payload: Payload::Audio(Arc::new(frame)), metadata: None, attrs: Attributes::new() }
    }

    pub fn from_video(frame: VideoFrame) -> Self {
        Self { payload: Payload::Video(Arc::new(frame)), metadata: None, attrs: Attributes::new() }
    }

    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The contiguous byte span of the payload. Empty for control packets.
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Empty => &[],
            Payload::Raw(b) => b.as_slice(),
            Payload::Audio(f) => f.bytes(),
            Payload::Video(f) => f.bytes(),
        }
    }

    pub const fn as_pcm(&self) -> Option<&Arc<PcmFrame>> {
        match &self.payload {
            Payload::Audio(f) => Some(f),
            _ => None,
        }
    }

    pub const fn as_video(&self) -> Option<&Arc<VideoFrame>> {
        match &self.payload {
            Payload::Video(f) => Some(f),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<&Arc<Metadata>> {
        self.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, meta: Arc<Metadata>) {
        self.metadata = Some(meta);
    }

    /// A declaration packet propagates metadata and nothing else: no
    /// payload, no timing.
    pub fn is_declaration(&self) -> bool {
        matches!(self.payload, Payload::Empty) && self.metadata.is_some() && self.attrs.is_empty()
    }

    pub const fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn set_attr(&mut self, attr: Attribute) {
        self.attrs.set(attr);
    }

    /// Presentation time in 180 kHz ticks; the canonical "media time".
    pub fn media_time(&self) -> Option<i64> {
        self.attrs.presentation_time()
    }

    pub fn set_media_time(&mut self, t: i64) {
        self.attrs.set(Attribute::PresentationTime(t));
    }

    pub fn decoding_time(&self) -> Option<i64> {
        self.attrs.decoding_time()
    }

    pub fn set_decoding_time(&mut self, t: i64) {
        self.attrs.set(Attribute::DecodingTime(t));
    }
}
