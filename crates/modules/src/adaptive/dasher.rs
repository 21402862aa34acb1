// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! DASH packager: MPD assembly over the adaptive-streaming core.

use super::mpd::{serialize_mpd, AdaptationSet, Mpd, Period, Representation, TimelineEntry};
use super::{
    AdaptiveCore, AdaptiveFlags, AdaptiveStreamer, AdaptiveVariant, PendingSegment, SystemUtcClock, UtcClock,
    DASH_TIMESCALE,
};
use castflow_core::clock::{clock_to_timescale, timescale_to_clock};
use castflow_core::data::Packet;
use castflow_core::error::{CastflowError, Result};
use castflow_core::helpers::config_helpers;
use castflow_core::metadata::{FileInfo, Metadata, StreamKind};
use castflow_core::module::{Host, LogLevel, Module};
use castflow_core::{async_trait, ModuleRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const PROFILES: &str = "urn:mpeg:dash:profile:isoff-live:2011, http://dashif.org/guidelines/dash264";
// should be 0, but dash.js doesn't support MPDs with no refresh time
const MIN_UPDATE_PERIOD_FACTOR: i64 = 1;
const MIN_BUFFER_TIME_IN_MS_VOD: i64 = 3000;
const MIN_BUFFER_TIME_IN_MS_LIVE: i64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DasherConfig {
    pub live: bool,
    /// Nominal segment duration; zero selects the SegmentTimeline variant.
    pub seg_duration_ms: i64,
    /// Where manifest and segments live, ending with a separator. Must be
    /// empty when segments are not owned.
    pub mpd_dir: String,
    pub mpd_name: String,
    pub segments_not_owned: bool,
    pub presignal_next_segment: bool,
    pub force_real_durations: bool,
    /// Zero picks the live/VOD default.
    pub min_buffer_time_ms: i64,
    /// Zero derives from the segment duration.
    pub min_update_period_ms: i64,
    /// Zero means an infinite time shift (no deletion).
    pub time_shift_buffer_depth_ms: i64,
    pub initial_offset_ms: i64,
    pub base_urls: Vec<String>,
    pub id: String,
}

impl Default for DasherConfig {
    fn default() -> Self {
        Self {
            live: false,
            seg_duration_ms: 2000,
            mpd_dir: String::new(),
            mpd_name: "stream.mpd".to_string(),
            segments_not_owned: false,
            presignal_next_segment: false,
            force_real_durations: false,
            min_buffer_time_ms: 0,
            min_update_period_ms: 0,
            time_shift_buffer_depth_ms: 0,
            initial_offset_ms: 0,
            base_urls: Vec::new(),
            id: String::new(),
        }
    }
}

fn complement_config(mut cfg: DasherConfig) -> DasherConfig {
    if cfg.min_buffer_time_ms == 0 {
        cfg.min_buffer_time_ms =
            if cfg.live { MIN_BUFFER_TIME_IN_MS_LIVE } else { MIN_BUFFER_TIME_IN_MS_VOD };
    }
    if cfg.min_update_period_ms == 0 {
        cfg.min_update_period_ms = if cfg.seg_duration_ms == 0 { 1000 } else { cfg.seg_duration_ms };
    }
    cfg
}

struct DashVariant {
    cfg: DasherConfig,
    utc: Arc<dyn UtcClock>,
    use_timeline: bool,
    /// Per-quality retained `<S>` entries (timeline variant only).
    timelines: Vec<Vec<TimelineEntry>>,
}

/// DASH packager module.
pub struct Dasher;

impl Dasher {
    pub fn new(host: Arc<dyn Host>, cfg: DasherConfig, utc: Arc<dyn UtcClock>) -> Result<Box<dyn Module>> {
        let use_timeline = cfg.seg_duration_ms == 0;
        if use_timeline && (cfg.presignal_next_segment || cfg.segments_not_owned) {
            return Err(CastflowError::InvalidConfig(
                "next-segment pre-signalling and unowned segments cannot be used with a segment timeline"
                    .to_string(),
            ));
        }
        let cfg = complement_config(cfg);
        let flags = AdaptiveFlags {
            segments_not_owned: cfg.segments_not_owned,
            presignal_next_segment: cfg.presignal_next_segment,
            force_real_durations: cfg.force_real_durations,
        };
        let streamer = AdaptiveStreamer::new(
            host,
            cfg.live,
            cfg.seg_duration_ms,
            cfg.mpd_dir.clone(),
            flags,
            DashVariant { cfg, utc, use_timeline, timelines: Vec::new() },
        )?;
        Ok(Box::new(streamer))
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "dasher",
            serde_json::to_value(schemars::schema_for!(DasherConfig)).unwrap_or_default(),
            "DASH segmenter and MPD writer",
            |host, params| {
                let cfg = config_helpers::parse_config_optional(params)?;
                Self::new(host, cfg, Arc::new(SystemUtcClock))
            },
        )
    }
}

impl DashVariant {
    fn content_type(kind: StreamKind) -> &'static str {
        match kind {
            StreamKind::AudioPkt => "audio",
            StreamKind::VideoPkt => "video",
            _ => "text",
        }
    }

    /// Register one completed segment in the retained timeline, coalescing
    /// equal durations, and return its start time (the `$Time$` token).
    fn push_timeline_entry(&mut self, rep_idx: usize, start_time_ms: i64, duration_ms: i64) -> i64 {
        let timeline = &mut self.timelines[rep_idx];
        if let Some(prev) = timeline.last_mut() {
            if prev.duration == duration_ms {
                prev.repeat_count += 1;
                return prev.start_time + prev.duration * prev.repeat_count;
            }
        }
        let seg_time =
            timeline.last().map_or(start_time_ms, |p| p.start_time + p.duration * (p.repeat_count + 1));
        timeline.push(TimelineEntry { start_time: seg_time, duration: duration_ms, repeat_count: 0 });
        seg_time
    }

    async fn post_manifest(&self, core: &mut AdaptiveCore, contents: &str) {
        let Some(mut buffer) = core.output_manifest.alloc_buffer(contents.len()).await else {
            core.host.log(LogLevel::Warning, "manifest allocator exhausted, skipping manifest");
            return;
        };
        buffer.as_mut_slice().copy_from_slice(contents.as_bytes());

        let mut fi = FileInfo::playlist();
        fi.filename = format!("{}{}", core.manifest_dir, self.cfg.mpd_name);
        fi.duration_in_180k = core.seg_duration_in_180k;
        #[allow(clippy::cast_possible_wrap)]
        {
            fi.filesize = contents.len() as i64;
        }

        let mut out = Packet::from_raw(buffer);
        out.set_metadata(Arc::new(Metadata::File(fi)));
        out.set_media_time(timescale_to_clock(core.total_duration_ms, DASH_TIMESCALE));
        core.output_manifest.post(out).await;
    }

    /// Re-emit the completed segment of quality `idx` under its final
    /// name, remember it in the time-shift ring, and pre-signal the next
    /// one when configured.
    async fn post_segment(
        &self,
        core: &mut AdaptiveCore,
        idx: usize,
        seg_filename: &str,
        next_seg_filename: &str,
    ) -> Result<()> {
        let Some(meta) = core.qualities[idx].meta() else { return Ok(()) };
        let fi = core.segment_file_info(idx, seg_filename.to_string(), meta.filesize, false);

        if !seg_filename.is_empty() {
            let Some(data) = core.qualities[idx].last_data.clone() else { return Ok(()) };
            let out = core.presignalled_data(meta.filesize, &data, true).await.ok_or_else(|| {
                CastflowError::Runtime("unexpected empty data while finalizing a segment".to_string())
            })?;
            let mut out = out;
            out.set_metadata(Arc::new(Metadata::File(fi.clone())));
            out.set_media_time(timescale_to_clock(core.total_duration_ms, DASH_TIMESCALE));
            core.output_segments.post(out).await;

            if !next_seg_filename.is_empty() {
                if let Some(mut next) = core.presignalled_data(0, &data, false).await {
                    let mut next_fi = fi.clone();
                    next_fi.filename = next_seg_filename.to_string();
                    next_fi.eos = false;
                    next.set_metadata(Arc::new(Metadata::File(next_fi)));
                    next.set_media_time(timescale_to_clock(core.total_duration_ms, DASH_TIMESCALE));
                    core.output_segments.post(next).await;
                }
            }
        }

        core.qualities[idx]
            .timeshift_segments
            .insert(0, PendingSegment { duration_in_180k: fi.duration_in_180k, filename: fi.filename });
        Ok(())
    }

    /// Walk the quality's ring, newest first; segments beyond the
    /// time-shift depth get a delete control packet and drop out.
    async fn delete_old_segments(&self, core: &mut AdaptiveCore, idx: usize) {
        let depth_ms = self.cfg.time_shift_buffer_depth_ms;
        let mut total_duration_ms = 0i64;
        let mut removed = Vec::new();
        core.qualities[idx].timeshift_segments.retain(|seg| {
            total_duration_ms += clock_to_timescale(seg.duration_in_180k, DASH_TIMESCALE);
            if total_duration_ms > depth_ms {
                removed.push(seg.filename.clone());
                false
            } else {
                true
            }
        });

        for filename in removed {
            core.host.log(LogLevel::Debug, &format!("delete segment \"{filename}\""));
            let mut fi = FileInfo::segment();
            fi.filename = filename;
            fi.filesize = i64::MAX; // "DELETE"
            let mut out = Packet::empty();
            out.set_metadata(Arc::new(Metadata::File(fi)));
            core.output_segments.post(out).await;
        }
    }

    async fn create_manifest(&mut self, core: &mut AdaptiveCore, cfg: &DasherConfig) -> Result<String> {
        let mut mpd = Mpd {
            dynamic: cfg.live,
            timeline: self.use_timeline,
            id: cfg.id.clone(),
            profiles: PROFILES.to_string(),
            min_buffer_time_ms: cfg.min_buffer_time_ms,
            media_presentation_duration_ms: core.total_duration_ms + core.seg_duration_ms,
            availability_start_time_ms: core.seg_duration_ms + cfg.initial_offset_ms,
            publish_time_ms: self.utc.now_ms(),
            minimum_update_period_ms: cfg.min_update_period_ms * MIN_UPDATE_PERIOD_FACTOR,
            time_shift_buffer_depth_ms: cfg.time_shift_buffer_depth_ms,
            base_urls: cfg.base_urls.clone(),
            periods: Vec::new(),
        };

        let mut period = Period { id: "1".to_string(), adaptation_sets: Vec::new() };
        let mut adaptation_sets: BTreeMap<&'static str, AdaptationSet> = BTreeMap::new();

        for idx in 0..core.num_inputs() {
            let Some(meta) = core.qualities[idx].meta() else { continue };

            let content_type = Self::content_type(meta.kind);
            let set = adaptation_sets.entry(content_type).or_insert_with(|| AdaptationSet {
                content_type: content_type.to_string(),
                mime_type: String::new(),
                segment_alignment: true,
                bitstream_switching: true,
                start_number: 0,
                duration: core.seg_duration_ms,
                timescale: DASH_TIMESCALE,
                availability_time_offset_s: 0.0,
                entries: Vec::new(),
                representations: Vec::new(),
            });
            if set.mime_type.is_empty() {
                set.mime_type.clone_from(&meta.mime_type);
            }

            let mut rep = Representation {
                id: idx.to_string(),
                bandwidth: core.qualities[idx].avg_bitrate_in_bps,
                codecs: meta.codec_name.clone(),
                mime_type: meta.mime_type.clone(),
                start_with_sap: true,
                ..Default::default()
            };
            match meta.kind {
                StreamKind::AudioPkt => rep.audio_sampling_rate = meta.sample_rate,
                StreamKind::VideoPkt => {
                    if let Some(res) = meta.resolution {
                        rep.width = Some(res.width);
                        rep.height = Some(res.height);
                        rep.sar = Some((1, 1));
                    }
                    if !meta.starts_with_rap {
                        rep.start_with_sap = false;
                    }
                },
                _ => {},
            }
            if cfg.live && meta.latency_in_180k != 0 {
                let latency_ms = clock_to_timescale(meta.latency_in_180k, DASH_TIMESCALE);
                #[allow(clippy::cast_precision_loss)]
                {
                    set.availability_time_offset_s =
                        ((core.seg_duration_ms - latency_ms).max(0)) as f64 / 1000.0;
                }
                mpd.min_buffer_time_ms = latency_ms;
            }

            let template = if self.use_timeline { "$Time$" } else { "$Number$" };
            rep.initialization = core.init_name(idx);
            rep.media = core.segment_name(idx, template);
            if !self.use_timeline {
                set.start_number = core.cur_seg_num();
            }

            let (seg_filename, next_seg_filename) = if self.use_timeline {
                let duration_ms = clock_to_timescale(meta.duration_in_180k, DASH_TIMESCALE);
                let seg_time =
                    self.push_timeline_entry(idx, core.start_time_ms.unwrap_or(0), duration_ms);
                set.entries.clone_from(&self.timelines[idx]);
                (format!("{}{}", core.manifest_dir, core.segment_name(idx, &seg_time.to_string())), String::new())
            } else {
                let n = core.cur_seg_num();
                let seg = format!("{}{}", core.manifest_dir, core.segment_name(idx, &n.to_string()));
                let next = if cfg.presignal_next_segment {
                    format!("{}{}", core.manifest_dir, core.segment_name(idx, &(n + 1).to_string()))
                } else {
                    String::new()
                };
                (seg, next)
            };

            self.post_segment(core, idx, &seg_filename, &next_seg_filename).await?;

            if cfg.time_shift_buffer_depth_ms != 0 {
                self.delete_old_segments(core, idx).await;
            }

            set.representations.push(rep);
        }

        for (_, set) in adaptation_sets {
            period.adaptation_sets.push(set);
        }
        mpd.periods.push(period);

        Ok(serialize_mpd(&mpd))
    }
}

#[async_trait]
impl AdaptiveVariant for DashVariant {
    fn on_quality_added(&mut self) {
        self.timelines.push(Vec::new());
    }

    async fn on_new_segment(&mut self, core: &mut AdaptiveCore) -> Result<()> {
        let cfg = self.cfg.clone();
        let xml = self.create_manifest(core, &cfg).await?;
        if self.cfg.live {
            self.post_manifest(core, &xml).await;
        }
        Ok(())
    }

    async fn on_end_of_stream(&mut self, core: &mut AdaptiveCore) -> Result<()> {
        if self.cfg.time_shift_buffer_depth_ms != 0 {
            if !self.cfg.segments_not_owned {
                core.host.log(
                    LogLevel::Info,
                    "manifest not rewritten for on-demand; files are being purged",
                );
            }
            return Ok(());
        }

        core.host.log(LogLevel::Info, "manifest rewritten for on-demand, media files untouched");
        let mut cfg = self.cfg.clone();
        cfg.live = false;
        core.total_duration_ms -= core.seg_duration_ms;
        let xml = self.create_manifest(core, &cfg).await?;
        self.post_manifest(core, &xml).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adaptive::FixedUtcClock;
    use castflow_core::metadata::Resolution;
    use castflow_core::module::NullHost;
    use castflow_core::ports::{connect_ports, InputPort};
    use castflow_core::Packet;
    use bytes::Bytes;

    fn segment_packet(duration_ms: i64, filesize: i64, eos: bool, time_ms: i64) -> Packet {
        let mut fi = FileInfo::with_kind(StreamKind::VideoPkt);
        fi.mime_type = "video/mp4".to_string();
        fi.codec_name = "avc1.64001f".to_string();
        fi.duration_in_180k = timescale_to_clock(duration_ms, 1000);
        fi.filesize = filesize;
        fi.starts_with_rap = true;
        fi.eos = eos;
        fi.resolution = Some(Resolution::new(320, 180));
        let mut pkt = Packet::from_bytes(Bytes::from_static(&[0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]));
        pkt.set_metadata(Arc::new(Metadata::File(fi)));
        pkt.set_media_time(timescale_to_clock(time_ms, 1000));
        pkt
    }

    struct Fixture {
        dasher: Box<dyn Module>,
        segments: Arc<InputPort>,
        manifests: Arc<InputPort>,
    }

    impl Fixture {
        fn new(cfg: DasherConfig) -> Self {
            let host = Arc::new(NullHost::default());
            let mut dasher = Dasher::new(host, cfg, Arc::new(FixedUtcClock(1_700_000_000_000))).unwrap();
            dasher.ensure_input(0).unwrap();

            let segments = Arc::new(InputPort::new());
            let manifests = Arc::new(InputPort::new());
            connect_ports(&dasher.ports().output(0).unwrap(), &segments, Arc::new(|_| Box::pin(async {})))
                .unwrap();
            connect_ports(&dasher.ports().output(1).unwrap(), &manifests, Arc::new(|_| Box::pin(async {})))
                .unwrap();
            Self { dasher, segments, manifests }
        }

        async fn push(&mut self, pkt: Packet) {
            self.dasher.ports().input(0).unwrap().push(pkt).unwrap();
            self.dasher.process().await.unwrap();
        }

        fn drain(port: &InputPort) -> Vec<Packet> {
            let mut out = Vec::new();
            while let Some(pkt) = port.try_pop() {
                out.push(pkt);
            }
            out
        }
    }

    // 500 kbps at 3 s per segment
    const SEG_BYTES: i64 = 187_500;

    #[tokio::test]
    async fn live_fifty_segments_one_manifest() {
        let mut f = Fixture::new(DasherConfig {
            live: true,
            seg_duration_ms: 3000,
            time_shift_buffer_depth_ms: 300_000,
            ..Default::default()
        });

        // init segment first
        f.push(segment_packet(0, 100, false, 0)).await;
        // 49 open fragments, then one that completes the segment
        for k in 0..49 {
            f.push(segment_packet(3000, SEG_BYTES, false, k * 3000)).await;
        }
        f.push(segment_packet(3000, SEG_BYTES, true, 49 * 3000)).await;
        f.dasher.flush().await.unwrap();

        let segments = Fixture::drain(&f.segments);
        assert_eq!(segments.len(), 51);

        let init = segments[0].metadata().unwrap().as_file().cloned().unwrap();
        assert!(init.filename.ends_with("v_0_320x180-init.mp4"));
        assert_eq!(init.duration_in_180k, 0);
        for seg in &segments[1..] {
            let fi = seg.metadata().unwrap().as_file().cloned().unwrap();
            assert!(fi.filename.contains("v_0_320x180-"), "bad name: {}", fi.filename);
            assert!(fi.filename.ends_with(".m4s"));
        }

        let manifests = Fixture::drain(&f.manifests);
        assert_eq!(manifests.len(), 1);
        let fi = manifests[0].metadata().unwrap().as_file().cloned().unwrap();
        assert_eq!(fi.kind, StreamKind::Playlist);
        assert!(fi.filename.ends_with("stream.mpd"));

        let xml = std::str::from_utf8(manifests[0].bytes()).unwrap();
        assert!(xml.contains("type=\"dynamic\""));
        assert!(xml.contains("minimumUpdatePeriod=\"PT3S\""));
        assert!(xml.contains("bandwidth=\"500000\""));
        assert!(xml.contains("<AdaptationSet contentType=\"video\" mimeType=\"video/mp4\""));
        assert_eq!(xml.matches("<Period").count(), 1);
        assert_eq!(xml.matches("<AdaptationSet").count(), 1);
        assert_eq!(xml.matches("<Representation").count(), 1);
    }

    #[tokio::test]
    async fn vod_rewrites_a_static_manifest_at_eos() {
        let mut f = Fixture::new(DasherConfig { live: false, seg_duration_ms: 3000, ..Default::default() });

        for k in 0..5 {
            f.push(segment_packet(3000, SEG_BYTES, true, k * 3000)).await;
        }
        f.dasher.flush().await.unwrap();

        let manifests = Fixture::drain(&f.manifests);
        assert_eq!(manifests.len(), 1);
        let xml = std::str::from_utf8(manifests[0].bytes()).unwrap();
        assert!(xml.contains("type=\"static\""));
        assert!(xml.contains("mediaPresentationDuration=\"PT15S\""));
    }

    #[tokio::test]
    async fn time_shift_window_emits_delete_packets() {
        let mut f = Fixture::new(DasherConfig {
            live: true,
            seg_duration_ms: 3000,
            time_shift_buffer_depth_ms: 6000,
            ..Default::default()
        });

        for k in 0..10 {
            f.push(segment_packet(3000, SEG_BYTES, true, k * 3000)).await;
        }

        let outputs = Fixture::drain(&f.segments);
        let deletes: Vec<&Packet> = outputs
            .iter()
            .filter(|p| p.metadata().unwrap().as_file().unwrap().filesize == i64::MAX)
            .collect();
        // 10 segments, window keeps 2: the other 8 are deleted
        assert_eq!(deletes.len(), 8);
        for del in &deletes {
            assert!(del.bytes().is_empty());
        }
        // steady-state retention stays within [depth, depth + seg duration]
        assert_eq!(outputs.len(), 10 + 8);
    }

    #[tokio::test]
    async fn timeline_variant_coalesces_equal_durations() {
        let mut f = Fixture::new(DasherConfig {
            live: true,
            seg_duration_ms: 0, // SegmentTimeline
            ..Default::default()
        });

        for k in 0..4 {
            f.push(segment_packet(3000, SEG_BYTES, true, k * 3000)).await;
        }

        let manifests = Fixture::drain(&f.manifests);
        assert!(!manifests.is_empty());
        let xml = std::str::from_utf8(manifests.last().unwrap().bytes()).unwrap();
        assert!(xml.contains("$Time$"));
        assert!(xml.contains("<SegmentTimeline>"));
        assert!(xml.contains("r=\"3\""));
    }

    #[tokio::test]
    async fn presignalling_announces_the_next_segment() {
        let mut f = Fixture::new(DasherConfig {
            live: true,
            seg_duration_ms: 3000,
            presignal_next_segment: true,
            time_shift_buffer_depth_ms: 300_000,
            ..Default::default()
        });

        f.push(segment_packet(3000, SEG_BYTES, true, 0)).await;

        let segments = Fixture::drain(&f.segments);
        // the finalized segment plus the empty announcement for its successor
        assert!(segments.len() >= 2);
        let last = segments.last().unwrap().metadata().unwrap().as_file().cloned().unwrap();
        assert!(last.filename.contains("-1.m4s"), "expected next-segment name, got {}", last.filename);
        assert!(!last.eos);
    }

    #[tokio::test]
    async fn inconsistent_flag_combinations_are_rejected() {
        let host = Arc::new(NullHost::default());
        let err = Dasher::new(
            host.clone(),
            DasherConfig {
                segments_not_owned: true,
                mpd_dir: "out/".to_string(),
                ..Default::default()
            },
            Arc::new(FixedUtcClock(0)),
        )
        .unwrap_err();
        assert!(matches!(err, CastflowError::InvalidConfig(_)));

        let err = Dasher::new(
            host.clone(),
            DasherConfig { seg_duration_ms: 0, presignal_next_segment: true, ..Default::default() },
            Arc::new(FixedUtcClock(0)),
        )
        .unwrap_err();
        assert!(matches!(err, CastflowError::InvalidConfig(_)));

        let err = Dasher::new(
            host,
            DasherConfig { seg_duration_ms: 0, force_real_durations: true, ..Default::default() },
            Arc::new(FixedUtcClock(0)),
        )
        .unwrap_err();
        assert!(matches!(err, CastflowError::InvalidConfig(_)));
    }
}
