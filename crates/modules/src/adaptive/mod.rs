// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Adaptive-streaming core.
//!
//! Each input is one *quality* (one encoded variant of the presentation)
//! delivering pre-encoded segments: every packet carries the segment bytes
//! plus file metadata (duration, size, starts-with-RAP, EOS). The streamer
//! accounts segment durations and bitrates, re-emits segments under
//! canonical names on output 0, and hands completed ticks to a format
//! variant (DASH or HLS) which writes manifests on output 1.

pub mod dasher;
pub mod hls;
pub mod mpd;

use castflow_core::clock::{clock_to_timescale, timescale_to_clock, CLOCK_RATE};
use castflow_core::data::Packet;
use castflow_core::error::{CastflowError, Result};
use castflow_core::metadata::{FileInfo, Metadata, StreamKind};
use castflow_core::module::{Host, LogLevel, Module, PortSet};
use castflow_core::ports::{InputPort, OutputPort};
use castflow_core::async_trait;
use std::sync::Arc;

/// Manifest timescale in Hz. Milliseconds are baked into several container
/// conventions, so this is not configurable.
pub const DASH_TIMESCALE: i64 = 1000;

/// Wall-clock UTC source for publish times, injectable for tests.
pub trait UtcClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real UTC clock.
pub struct SystemUtcClock;

impl UtcClock for SystemUtcClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Frozen UTC clock, for deterministic manifests in tests.
pub struct FixedUtcClock(pub i64);

impl UtcClock for FixedUtcClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// Behavior toggles, each independently settable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveFlags {
    /// Do not manage files on disk; just re-emit metadata and bytes.
    pub segments_not_owned: bool,
    /// Post an empty next-segment packet so downstream prefetchers can
    /// request it speculatively.
    pub presignal_next_segment: bool,
    /// Accumulate actual segment durations instead of the nominal one
    /// (VBR authoring).
    pub force_real_durations: bool,
}

/// One retained past segment, for the live time-shift window.
pub struct PendingSegment {
    pub duration_in_180k: i64,
    pub filename: String,
}

/// Per-input accounting.
#[derive(Default)]
pub struct Quality {
    pub last_data: Option<Packet>,
    pub cur_seg_dur_in_180k: i64,
    pub avg_bitrate_in_bps: u64,
    /// Subdir prefix, ending with '/'.
    pub prefix: String,
    /// Newest first.
    pub timeshift_segments: Vec<PendingSegment>,
}

impl Quality {
    pub fn meta(&self) -> Option<FileInfo> {
        self.last_data.as_ref()?.metadata()?.as_file().cloned()
    }
}

/// What one call to [`AdaptiveCore::schedule`] achieved.
pub enum Progress {
    /// No input was consumed.
    Idle,
    /// Input was consumed but no segment completed.
    Worked,
    /// A segment completed on every quality: the variant must write.
    SegmentReady,
}

/// State and bookkeeping shared by every adaptive-streaming variant.
pub struct AdaptiveCore {
    pub host: Arc<dyn Host>,
    pub live: bool,
    pub start_time_ms: Option<i64>,
    pub total_duration_ms: i64,
    pub seg_duration_ms: i64,
    pub seg_duration_in_180k: i64,
    pub manifest_dir: String,
    pub flags: AdaptiveFlags,
    pub qualities: Vec<Quality>,
    pub output_segments: Arc<OutputPort>,
    pub output_manifest: Arc<OutputPort>,
    inputs: Vec<Arc<InputPort>>,
}

/// The `styp` box a CMAF chunk starts with; presignalled placeholders carry
/// exactly this header.
const MP4_STATIC_HEADER: [u8; 24] = [
    0x00, 0x00, 0x00, 0x18, b's', b't', b'y', b'p', b'm', b's', b'd', b'h', 0x00, 0x00, 0x00, 0x00, b'm',
    b's', b'd', b'h', b'm', b's', b'i', b'x',
];

impl AdaptiveCore {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// `a_<i>`, `v_<i>_<W>x<H>` or `s_<i>`, from the stream kind of the
    /// quality's file metadata.
    pub fn base_prefix(&self, idx: usize) -> String {
        let Some(meta) = self.qualities[idx].meta() else { return String::new() };
        match meta.kind {
            StreamKind::AudioPkt => format!("a_{idx}"),
            StreamKind::VideoPkt => format!("v_{idx}_{}", meta.resolution.unwrap_or_default()),
            StreamKind::SubtitlePkt => format!("s_{idx}"),
            _ => String::new(),
        }
    }

    /// Full prefix: quality subdir + base prefix.
    pub fn prefix(&self, idx: usize) -> String {
        format!("{}{}", self.qualities[idx].prefix, self.base_prefix(idx))
    }

    pub fn init_name(&self, idx: usize) -> String {
        format!("{}-init.mp4", self.prefix(idx))
    }

    pub fn segment_name(&self, idx: usize, token: &str) -> String {
        format!("{}-{token}.m4s", self.prefix(idx))
    }

    pub fn cur_seg_num(&self) -> i64 {
        if self.seg_duration_ms == 0 {
            return 0;
        }
        (self.start_time_ms.unwrap_or(0) + self.total_duration_ms) / self.seg_duration_ms
    }

    fn ensure_start_time(&mut self, pkt: &Packet) {
        if self.start_time_ms.is_none() {
            let t = pkt.media_time().unwrap_or(0);
            self.start_time_ms = Some(clock_to_timescale(t, DASH_TIMESCALE));
        }
    }

    /// File metadata for a re-emitted segment, inheriting the stream fields
    /// of the quality's current packet.
    pub fn segment_file_info(&self, idx: usize, filename: String, filesize: i64, eos: bool) -> FileInfo {
        let mut fi = FileInfo::segment();
        if let Some(meta) = self.qualities[idx].meta() {
            fi.mime_type = meta.mime_type;
            fi.codec_name = meta.codec_name;
            fi.duration_in_180k = meta.duration_in_180k;
            fi.latency_in_180k = meta.latency_in_180k;
            fi.starts_with_rap = meta.starts_with_rap;
            fi.resolution = meta.resolution;
            fi.sample_rate = meta.sample_rate;
        }
        fi.filename = filename;
        fi.filesize = filesize;
        fi.eos = eos;
        fi
    }

    async fn process_init_segment(&mut self, idx: usize) -> Result<()> {
        let meta = self.qualities[idx]
            .meta()
            .ok_or_else(|| CastflowError::Runtime(format!("unknown data received on input {idx}")))?;
        let Some(data) = self.qualities[idx].last_data.clone() else { return Ok(()) };

        let mut init_fn = meta.filename.clone();
        if init_fn.is_empty() || !self.flags.segments_not_owned {
            init_fn = format!("{}{}", self.manifest_dir, self.init_name(idx));
        }

        let mut fi = self.segment_file_info(idx, init_fn, meta.filesize, false);
        fi.duration_in_180k = 0;
        let mut out = data;
        out.set_metadata(Arc::new(Metadata::File(fi)));
        out.set_media_time(timescale_to_clock(self.total_duration_ms, DASH_TIMESCALE));
        self.output_segments.post(out).await;
        Ok(())
    }

    /// The packet to re-emit for a segment part. With pre-signalling
    /// enabled this handles the `styp` placeholder dance; otherwise it is
    /// the data itself.
    pub async fn presignalled_data(&self, size: i64, data: &Packet, eos: bool) -> Option<Packet> {
        if !self.flags.presignal_next_segment {
            return Some(data.clone());
        }
        let has_filename =
            data.metadata().and_then(|m| m.as_file().map(|f| !f.filename.is_empty())).unwrap_or(false);
        if has_filename && !eos {
            return None;
        }

        let bytes = data.bytes();
        if size == 0 && !eos {
            let mut buf = self.output_segments.alloc_buffer(MP4_STATIC_HEADER.len()).await?;
            buf.as_mut_slice().copy_from_slice(&MP4_STATIC_HEADER);
            Some(Packet::from_raw(buf))
        } else if bytes.len() >= MP4_STATIC_HEADER.len() && bytes[..MP4_STATIC_HEADER.len()] == MP4_STATIC_HEADER
        {
            let body = &bytes[MP4_STATIC_HEADER.len()..];
            let mut buf = self.output_segments.alloc_buffer(body.len()).await?;
            buf.as_mut_slice().copy_from_slice(body);
            Some(Packet::from_raw(buf))
        } else {
            Some(data.clone())
        }
    }

    /// Emit a partial-segment packet under the current segment's canonical
    /// name.
    async fn send_local_data(&mut self, idx: usize, size: i64, eos: bool) -> Result<()> {
        let Some(data) = self.qualities[idx].last_data.clone() else { return Ok(()) };
        self.ensure_start_time(&data);
        let Some(mut out) = self.presignalled_data(size, &data, eos).await else { return Ok(()) };

        let filename = self.segment_name(idx, &self.cur_seg_num().to_string());
        let fi = self.segment_file_info(idx, filename, size, eos);
        out.set_metadata(Arc::new(Metadata::File(fi)));
        out.set_media_time(
            timescale_to_clock(self.total_duration_ms, DASH_TIMESCALE)
                + self.qualities[idx].cur_seg_dur_in_180k,
        );
        self.output_segments.post(out).await;
        Ok(())
    }

    /// A quality is complete for this tick when popping more of it would
    /// run ahead of the least-advanced quality.
    fn is_complete(&self, idx: usize) -> bool {
        let mut min_incomplete = i64::MAX;
        for quality in &self.qualities {
            let dur = quality.cur_seg_dur_in_180k;
            let eos = quality.meta().is_some_and(|m| m.eos);
            if dur < min_incomplete && (dur < self.seg_duration_in_180k || !eos) {
                min_incomplete = dur;
            }
        }
        min_incomplete == i64::MAX || self.qualities[idx].cur_seg_dur_in_180k > min_incomplete
    }

    /// Every quality reached the nominal duration and completed its
    /// current packet.
    fn segment_ready(&self) -> bool {
        self.qualities.iter().all(|q| {
            q.cur_seg_dur_in_180k >= self.seg_duration_in_180k && q.meta().is_some_and(|m| m.eos)
        })
    }

    /// Pop and account one packet of quality `idx`. Returns false when the
    /// input had nothing (the tick cannot complete yet).
    async fn schedule_representation(&mut self, idx: usize, any: &mut bool) -> Result<bool> {
        if self.is_complete(idx) {
            return Ok(true);
        }
        let Some(pkt) = self.inputs[idx].try_pop() else { return Ok(false) };
        *any = true;
        self.ensure_start_time(&pkt);

        let meta = pkt
            .metadata()
            .and_then(|m| m.as_file().cloned())
            .ok_or_else(|| CastflowError::Runtime(format!("unknown data received on input {idx}")))?;
        self.qualities[idx].last_data = Some(pkt);

        if self.qualities[idx].prefix.is_empty() {
            let base = self.base_prefix(idx);
            self.qualities[idx].prefix = format!("{base}/");
        }

        let cur_dur = meta.duration_in_180k;
        if cur_dur == 0 && self.qualities[idx].cur_seg_dur_in_180k == 0 {
            self.process_init_segment(idx).await?;
            if self.flags.presignal_next_segment {
                self.send_local_data(idx, 0, false).await?;
            }
            return Ok(true);
        }

        // average bitrate: exponential moving mean weighted by segment count
        if self.seg_duration_ms != 0 && cur_dur != 0 {
            #[allow(clippy::cast_sign_loss)]
            let num_seg = (self.total_duration_ms / self.seg_duration_ms).max(0) as u64;
            #[allow(clippy::cast_sign_loss)]
            let instant = (meta.filesize.max(0) as u64 * 8 * CLOCK_RATE as u64) / cur_dur.max(1) as u64;
            let quality = &mut self.qualities[idx];
            quality.avg_bitrate_in_bps =
                (instant + quality.avg_bitrate_in_bps * num_seg) / (num_seg + 1);
        }

        // current segment duration
        {
            let quality = &mut self.qualities[idx];
            if self.flags.force_real_durations {
                quality.cur_seg_dur_in_180k += cur_dur;
            } else {
                quality.cur_seg_dur_in_180k =
                    if self.seg_duration_in_180k != 0 { self.seg_duration_in_180k } else { cur_dur };
            }
        }

        if self.qualities[idx].cur_seg_dur_in_180k < self.seg_duration_in_180k || !meta.eos {
            self.send_local_data(idx, meta.filesize, meta.eos).await?;
        }
        Ok(true)
    }

    /// One tick: pop at most one packet per quality, then check readiness.
    async fn schedule(&mut self) -> Result<Progress> {
        let mut any = false;
        for idx in 0..self.qualities.len() {
            if !self.schedule_representation(idx, &mut any).await? {
                break;
            }
        }
        if !any {
            return Ok(Progress::Idle);
        }
        if self.segment_ready() {
            for quality in &mut self.qualities {
                quality.cur_seg_dur_in_180k -= self.seg_duration_in_180k;
            }
            return Ok(Progress::SegmentReady);
        }
        Ok(Progress::Worked)
    }
}

/// Format-specific half of the streamer: invoked when segments are ready
/// and at end of stream. It posts segment and manifest packets through the
/// core's outputs.
#[async_trait]
pub trait AdaptiveVariant: Send {
    /// Called each time every quality completed one nominal segment
    /// duration; posts the completed segment packets, then the manifest.
    async fn on_new_segment(&mut self, core: &mut AdaptiveCore) -> Result<()>;

    /// Last manifest to be written, usually the VOD one.
    async fn on_end_of_stream(&mut self, core: &mut AdaptiveCore) -> Result<()>;

    /// Lets the variant size its per-quality state.
    fn on_quality_added(&mut self) {}
}

/// Generic adaptive streamer module: segment accounting here, manifest
/// format in `V`.
pub struct AdaptiveStreamer<V: AdaptiveVariant> {
    ports: PortSet,
    core: AdaptiveCore,
    variant: V,
    eos_done: bool,
}

impl<V: AdaptiveVariant> AdaptiveStreamer<V> {
    pub fn new(
        host: Arc<dyn Host>,
        live: bool,
        seg_duration_ms: i64,
        manifest_dir: String,
        flags: AdaptiveFlags,
        variant: V,
    ) -> Result<Self> {
        if flags.force_real_durations && seg_duration_ms == 0 {
            return Err(CastflowError::InvalidConfig(
                "forced real durations require a non-null segment duration".to_string(),
            ));
        }
        if !manifest_dir.is_empty() && flags.segments_not_owned {
            return Err(CastflowError::InvalidConfig(format!(
                "manifest dir ({manifest_dir}) must be empty when segments are not owned"
            )));
        }
        let mut ports = PortSet::new();
        let output_segments = ports.add_output();
        let output_manifest = ports.add_output();
        Ok(Self {
            ports,
            core: AdaptiveCore {
                host,
                live,
                start_time_ms: None,
                total_duration_ms: 0,
                seg_duration_ms,
                seg_duration_in_180k: timescale_to_clock(seg_duration_ms, DASH_TIMESCALE),
                manifest_dir,
                flags,
                qualities: Vec::new(),
                output_segments,
                output_manifest,
                inputs: Vec::new(),
            },
            variant,
            eos_done: false,
        })
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            match self.core.schedule().await? {
                Progress::Idle => break,
                Progress::Worked => {},
                Progress::SegmentReady => {
                    self.variant.on_new_segment(&mut self.core).await?;
                    self.core.total_duration_ms += self.core.seg_duration_ms;
                    #[allow(clippy::cast_precision_loss)]
                    self.core.host.log(
                        LogLevel::Info,
                        &format!(
                            "processed segment (total processed: {}s)",
                            self.core.total_duration_ms as f64 / 1000.0
                        ),
                    );
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<V: AdaptiveVariant> Module for AdaptiveStreamer<V> {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    fn dynamic_inputs(&self) -> bool {
        true
    }

    /// One quality per input.
    fn ensure_input(&mut self, idx: usize) -> Result<()> {
        while self.ports.num_inputs() <= idx {
            let input = self.ports.add_input();
            self.core.inputs.push(input);
            self.core.qualities.push(Quality::default());
            self.variant.on_quality_added();
        }
        Ok(())
    }

    async fn process(&mut self) -> Result<()> {
        self.drive().await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.eos_done {
            return Ok(());
        }
        self.eos_done = true;
        self.drive().await?;
        self.variant.on_end_of_stream(&mut self.core).await
    }
}
