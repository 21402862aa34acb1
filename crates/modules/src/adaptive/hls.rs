// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! HLS packager: master and variant playlists over the adaptive-streaming
//! core.
//!
//! CMAF mode (fragmented MP4 segments) is detected from the segment
//! extension: `.m4s` selects playlist version 7 with an `EXT-X-MAP` init
//! reference and an audio rendition group on the master playlist; anything
//! else (TS) selects version 3.

use super::{AdaptiveCore, AdaptiveFlags, AdaptiveStreamer, AdaptiveVariant, DASH_TIMESCALE};
use castflow_core::clock::timescale_to_clock;
use castflow_core::data::Packet;
use castflow_core::error::{CastflowError, Result};
use castflow_core::helpers::config_helpers;
use castflow_core::metadata::{FileInfo, Metadata, StreamKind};
use castflow_core::module::{Host, LogLevel, Module};
use castflow_core::{async_trait, ModuleRegistry};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;

const AUDIO_GROUP_NAME: &str = "audio";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HlsConfig {
    pub live: bool,
    /// Must be a whole number of seconds.
    pub seg_duration_ms: i64,
    /// Prefix for playlist filenames in emitted metadata.
    pub m3u8_dir: String,
    pub m3u8_filename: String,
    /// Emit per-variant media playlists (master only otherwise).
    pub gen_variant_playlist: bool,
    /// Zero keeps every segment listed (EVENT playlist).
    pub time_shift_buffer_depth_ms: i64,
    pub presignal_next_segment: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            live: false,
            seg_duration_ms: 2000,
            m3u8_dir: String::new(),
            m3u8_filename: "master.m3u8".to_string(),
            gen_variant_playlist: true,
            time_shift_buffer_depth_ms: 0,
            presignal_next_segment: false,
        }
    }
}

struct HlsSegment {
    path: String,
    start_time_ms: i64,
}

struct HlsVariant {
    cfg: HlsConfig,
    /// 0 until detected from the first segment's extension.
    version: u32,
    is_cmaf: bool,
    master_written: bool,
    /// Listed segments per quality, oldest first.
    segments: Vec<Vec<HlsSegment>>,
}

/// HLS packager module.
pub struct AppleHls;

impl AppleHls {
    pub fn new(host: Arc<dyn Host>, cfg: HlsConfig) -> Result<Box<dyn Module>> {
        if cfg.seg_duration_ms % 1000 != 0 {
            return Err(CastflowError::InvalidConfig(
                "segment duration must be an integer number of seconds".to_string(),
            ));
        }
        let flags = AdaptiveFlags {
            // with generated playlists, segment files belong to the caller
            segments_not_owned: cfg.gen_variant_playlist,
            presignal_next_segment: cfg.presignal_next_segment,
            force_real_durations: false,
        };
        let streamer = AdaptiveStreamer::new(
            host,
            cfg.live,
            cfg.seg_duration_ms,
            String::new(),
            flags,
            HlsVariant { cfg, version: 0, is_cmaf: false, master_written: false, segments: Vec::new() },
        )?;
        Ok(Box::new(streamer))
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "hls",
            serde_json::to_value(schemars::schema_for!(HlsConfig)).unwrap_or_default(),
            "HLS segmenter and M3U8 playlist writer",
            |host, params| {
                let cfg = config_helpers::parse_config_optional(params)?;
                Self::new(host, cfg)
            },
        )
    }
}

/// Seconds with at most millisecond precision, no trailing zeros.
fn fmt_secs(ms: i64) -> String {
    if ms % 1000 == 0 {
        format!("{}", ms / 1000)
    } else {
        let mut frac = format!("{:03}", ms.rem_euclid(1000));
        while frac.ends_with('0') {
            frac.pop();
        }
        format!("{}.{}", ms.div_euclid(1000), frac)
    }
}

/// `<segment>-<num>.<ext>` → num.
fn parse_seg_num(path: &str) -> Option<i64> {
    let stem = path.rsplit_once('.').map_or(path, |(stem, _)| stem);
    stem.rsplit_once('-').and_then(|(_, num)| num.parse().ok())
}

impl HlsVariant {
    fn variant_playlist_name(&self, core: &AdaptiveCore, idx: usize) -> String {
        format!("{}_.m3u8", core.base_prefix(idx))
    }

    async fn post_playlist(&self, core: &mut AdaptiveCore, filename: String, contents: &str) {
        let Some(mut buffer) = core.output_manifest.alloc_buffer(contents.len()).await else {
            core.host.log(LogLevel::Warning, "playlist allocator exhausted, skipping playlist");
            return;
        };
        buffer.as_mut_slice().copy_from_slice(contents.as_bytes());

        let mut fi = FileInfo::playlist();
        fi.filename = filename;
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

    /// Re-emit the finished segments, record them in the per-quality lists,
    /// then regenerate the variant playlists.
    async fn update_manifest_variants(&mut self, core: &mut AdaptiveCore) -> Result<()> {
        if !self.cfg.gen_variant_playlist {
            return Ok(());
        }
        let start_ms = core.start_time_ms.unwrap_or(0);

        for idx in 0..core.num_inputs() {
            let Some(meta) = core.qualities[idx].meta() else { continue };

            let mut filename = meta.filename.clone();
            if filename.is_empty() {
                filename = core.segment_name(idx, &core.cur_seg_num().to_string());
            }

            if self.version == 0 {
                let ext = filename.rsplit_once('.').map(|(_, ext)| ext);
                if ext == Some("m4s") {
                    self.version = 7;
                    self.is_cmaf = true;
                } else {
                    self.version = 3;
                }
            }

            if let Some(data) = core.qualities[idx].last_data.clone() {
                let fi = core.segment_file_info(idx, filename.clone(), meta.filesize, false);
                let mut out = data;
                out.set_metadata(Arc::new(Metadata::File(fi)));
                out.set_media_time(timescale_to_clock(core.total_duration_ms, DASH_TIMESCALE));
                core.output_segments.post(out).await;
            }

            let seg_start = start_ms + core.total_duration_ms;
            if self.cfg.presignal_next_segment {
                if self.segments[idx].is_empty() {
                    self.segments[idx].push(HlsSegment { path: filename.clone(), start_time_ms: seg_start });
                }
                let last = &self.segments[idx][self.segments[idx].len() - 1];
                if last.path != filename {
                    return Err(CastflowError::Runtime(format!(
                        "pre-signalled segment names are inconsistent (\"{}\" versus \"{}\")",
                        last.path, filename
                    )));
                }
                let next = parse_seg_num(&filename).map_or_else(
                    || filename.clone(),
                    |n| {
                        let (stem, ext) = filename.rsplit_once('.').unwrap_or((filename.as_str(), "m4s"));
                        let base = stem.rsplit_once('-').map_or(stem, |(base, _)| base);
                        format!("{}-{}.{}", base, n + 1, ext)
                    },
                );
                self.segments[idx].push(HlsSegment {
                    path: next,
                    start_time_ms: seg_start + self.cfg.seg_duration_ms,
                });
            } else {
                self.segments[idx].push(HlsSegment { path: filename, start_time_ms: seg_start });
            }
        }

        self.generate_variant_playlists(core, false).await;
        Ok(())
    }

    async fn generate_variant_playlists(&mut self, core: &mut AdaptiveCore, is_last: bool) {
        if !self.cfg.gen_variant_playlist {
            return;
        }
        let start_ms = core.start_time_ms.unwrap_or(0);

        for idx in 0..core.num_inputs() {
            if core.qualities[idx].meta().is_none() {
                continue;
            }
            let mut text = String::from("#EXTM3U\n");
            let _ = writeln!(text, "#EXT-X-VERSION:{}", self.version);
            let _ = writeln!(text, "#EXT-X-TARGETDURATION:{}", (self.cfg.seg_duration_ms + 500) / 1000);
            if let Some(first) = self.segments[idx].first().and_then(|s| parse_seg_num(&s.path)) {
                let _ = writeln!(text, "#EXT-X-MEDIA-SEQUENCE:{first}");
            }
            if self.version >= 6 {
                text.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
            }
            if self.is_cmaf {
                let _ = writeln!(text, "#EXT-X-MAP:URI=\"{}\"", core.init_name(idx));
            }
            if self.cfg.time_shift_buffer_depth_ms == 0 {
                text.push_str("#EXT-X-PLAYLIST-TYPE:EVENT\n");
            }

            for seg in &self.segments[idx] {
                let _ = writeln!(text, "#EXTINF:{}", fmt_secs(self.cfg.seg_duration_ms));
                if self.cfg.live {
                    match program_date_time(seg.start_time_ms) {
                        Some(stamp) => {
                            let _ = writeln!(text, "#EXT-X-PROGRAM-DATE-TIME:{stamp}");
                        },
                        None => core.host.log(
                            LogLevel::Warning,
                            &format!(
                                "segment \"{}\": invalid UTC start time {}ms, skipping PROGRAM-DATE-TIME",
                                seg.path, seg.start_time_ms
                            ),
                        ),
                    }
                }
                let _ = writeln!(text, "{}", seg.path);
            }

            if is_last {
                text.push_str("#EXT-X-ENDLIST\n");
            }

            // time-shift: stop listing segments that fell out of the window
            let depth = self.cfg.time_shift_buffer_depth_ms;
            if depth != 0 {
                let horizon = start_ms + core.total_duration_ms;
                self.segments[idx].retain(|seg| seg.start_time_ms + depth >= horizon);
            }

            let filename =
                format!("{}{}", self.cfg.m3u8_dir, self.variant_playlist_name(core, idx));
            self.post_playlist(core, filename, &text).await;
        }
    }

    async fn generate_manifest_master(&mut self, core: &mut AdaptiveCore) -> Result<()> {
        if self.master_written {
            return Ok(());
        }

        let mut text = String::from("#EXTM3U\n");
        let _ = writeln!(text, "#EXT-X-VERSION:{}", self.version);
        if self.is_cmaf {
            text.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n\n");
        }

        if self.is_cmaf {
            let mut audio_specs: Vec<(String, u64)> = Vec::new();
            for idx in 0..core.num_inputs() {
                let Some(meta) = core.qualities[idx].meta() else { continue };
                if meta.kind == StreamKind::AudioPkt {
                    audio_specs.push((meta.codec_name.clone(), core.qualities[idx].avg_bitrate_in_bps));
                    let _ = writeln!(
                        text,
                        "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{AUDIO_GROUP_NAME}\",NAME=\"Main\",LANGUAGE=\"en\",AUTOSELECT=YES,URI=\"{}\"",
                        self.variant_playlist_name(core, idx)
                    );
                }
            }
            if audio_specs.len() > 1 {
                return Err(CastflowError::Runtime(
                    "several audio renditions detected in CMAF mode, not supported".to_string(),
                ));
            }
            if !audio_specs.is_empty() {
                text.push('\n');
            }

            for idx in 0..core.num_inputs() {
                let Some(meta) = core.qualities[idx].meta() else { continue };
                if meta.kind != StreamKind::VideoPkt {
                    continue;
                }
                let mut bandwidth = core.qualities[idx].avg_bitrate_in_bps;
                if let Some((_, audio_bw)) = audio_specs.first() {
                    bandwidth += audio_bw;
                }
                let _ = write!(
                    text,
                    "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH={bandwidth},CODECS=\"{}",
                    meta.codec_name
                );
                if let Some((codec, _)) = audio_specs.first() {
                    let _ = write!(text, ",{codec}\",AUDIO=\"{AUDIO_GROUP_NAME}\"");
                } else {
                    text.push('"');
                }
                if let Some(res) = meta.resolution {
                    let _ = write!(text, ",RESOLUTION={res}");
                }
                text.push('\n');
                let _ = writeln!(text, "{}", self.variant_playlist_name(core, idx));
            }
        } else {
            for idx in 0..core.num_inputs() {
                let Some(meta) = core.qualities[idx].meta() else { continue };
                let _ = write!(
                    text,
                    "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH={}",
                    core.qualities[idx].avg_bitrate_in_bps
                );
                if let Some(res) = meta.resolution {
                    let _ = write!(text, ",RESOLUTION={res}");
                }
                text.push('\n');
                let _ = writeln!(text, "{}", self.variant_playlist_name(core, idx));
            }
        }

        self.master_written = true;
        let filename = format!("{}{}", self.cfg.m3u8_dir, self.cfg.m3u8_filename);
        self.post_playlist(core, filename, &text).await;
        Ok(())
    }
}

/// `YYYY-MM-DDTHH:MM:SS.mmm+00:00`. Times before 1970-01-01 are invalid.
fn program_date_time(start_time_ms: i64) -> Option<String> {
    if start_time_ms < 0 {
        return None;
    }
    let dt = DateTime::<Utc>::from_timestamp_millis(start_time_ms)?;
    Some(format!("{}.{:03}+00:00", dt.format("%Y-%m-%dT%H:%M:%S"), start_time_ms.rem_euclid(1000)))
}

#[async_trait]
impl AdaptiveVariant for HlsVariant {
    fn on_quality_added(&mut self) {
        self.segments.push(Vec::new());
    }

    async fn on_new_segment(&mut self, core: &mut AdaptiveCore) -> Result<()> {
        self.update_manifest_variants(core).await?;
        self.generate_manifest_master(core).await
    }

    async fn on_end_of_stream(&mut self, core: &mut AdaptiveCore) -> Result<()> {
        self.generate_variant_playlists(core, true).await;
        Ok(())
    }
}
