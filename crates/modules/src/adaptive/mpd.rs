// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory MPD model and its XML writer.
//!
//! Covers the ISO/IEC 23009-1 subset the packager emits: static and
//! dynamic presentations, SegmentTemplate with either a fixed duration or
//! a SegmentTimeline, and the per-representation attributes players key
//! adaptation on. Attribute order is fixed so output is byte-deterministic.

use chrono::{DateTime, Utc};
use std::fmt::Write;

#[derive(Debug, Clone, Default)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub codecs: String,
    pub mime_type: String,
    pub start_with_sap: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Sample aspect ratio, video only.
    pub sar: Option<(i64, i64)>,
    pub frame_rate: Option<(i64, i64)>,
    pub audio_sampling_rate: Option<u32>,
    /// Init segment template.
    pub initialization: String,
    /// Media segment template (`$Number$` or `$Time$` based).
    pub media: String,
}

/// One `<S t d r>` timeline entry; equal durations coalesce via
/// `repeat_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub start_time: i64,
    pub duration: i64,
    pub repeat_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AdaptationSet {
    pub content_type: String,
    pub mime_type: String,
    pub segment_alignment: bool,
    pub bitstream_switching: bool,
    pub start_number: i64,
    /// Nominal segment duration, in `timescale` units. Ignored when a
    /// timeline is present.
    pub duration: i64,
    pub timescale: i64,
    pub availability_time_offset_s: f64,
    pub entries: Vec<TimelineEntry>,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, Default)]
pub struct Period {
    pub id: String,
    pub adaptation_sets: Vec<AdaptationSet>,
}

/// Root model. Durations are milliseconds, instants are epoch
/// milliseconds.
#[derive(Debug, Clone, Default)]
pub struct Mpd {
    pub dynamic: bool,
    pub timeline: bool,
    pub id: String,
    pub profiles: String,
    pub min_buffer_time_ms: i64,
    pub media_presentation_duration_ms: i64,
    pub availability_start_time_ms: i64,
    pub publish_time_ms: i64,
    pub minimum_update_period_ms: i64,
    pub time_shift_buffer_depth_ms: i64,
    pub base_urls: Vec<String>,
    pub periods: Vec<Period>,
}

/// `PT<seconds>S`, fractional seconds allowed, no trailing zeros.
pub fn iso8601_duration(ms: i64) -> String {
    if ms % 1000 == 0 {
        format!("PT{}S", ms / 1000)
    } else {
        let mut frac = format!("{:03}", ms.rem_euclid(1000));
        while frac.ends_with('0') {
            frac.pop();
        }
        format!("PT{}.{}S", ms.div_euclid(1000), frac)
    }
}

/// `YYYY-MM-DDTHH:MM:SSZ` from epoch milliseconds.
fn iso8601_datetime(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map_or_else(|| "1970-01-01T00:00:00Z".to_string(), |dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Serialize to XML. The writer is deterministic: identical models yield
/// identical bytes.
pub fn serialize_mpd(mpd: &Mpd) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    out.push_str("<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\"");
    if !mpd.id.is_empty() {
        let _ = write!(out, " id=\"{}\"", escape(&mpd.id));
    }
    let _ = write!(out, " profiles=\"{}\"", escape(&mpd.profiles));
    let _ = write!(out, " type=\"{}\"", if mpd.dynamic { "dynamic" } else { "static" });
    let _ = write!(out, " minBufferTime=\"{}\"", iso8601_duration(mpd.min_buffer_time_ms));
    if mpd.dynamic {
        let _ = write!(out, " availabilityStartTime=\"{}\"", iso8601_datetime(mpd.availability_start_time_ms));
        let _ = write!(out, " publishTime=\"{}\"", iso8601_datetime(mpd.publish_time_ms));
        let _ = write!(out, " minimumUpdatePeriod=\"{}\"", iso8601_duration(mpd.minimum_update_period_ms));
        if mpd.time_shift_buffer_depth_ms > 0 {
            let _ =
                write!(out, " timeShiftBufferDepth=\"{}\"", iso8601_duration(mpd.time_shift_buffer_depth_ms));
        }
    } else {
        let _ = write!(
            out,
            " mediaPresentationDuration=\"{}\"",
            iso8601_duration(mpd.media_presentation_duration_ms)
        );
    }
    out.push_str(">\n");

    for url in &mpd.base_urls {
        let _ = writeln!(out, "  <BaseURL>{}</BaseURL>", escape(url));
    }

    for period in &mpd.periods {
        let _ = writeln!(out, "  <Period id=\"{}\" start=\"PT0S\">", escape(&period.id));
        for set in &period.adaptation_sets {
            let _ = write!(out, "    <AdaptationSet contentType=\"{}\"", escape(&set.content_type));
            if !set.mime_type.is_empty() {
                let _ = write!(out, " mimeType=\"{}\"", escape(&set.mime_type));
            }
            let _ = write!(
                out,
                " segmentAlignment=\"{}\" bitstreamSwitching=\"{}\"",
                set.segment_alignment, set.bitstream_switching
            );
            if set.availability_time_offset_s > 0.0 {
                let _ = write!(out, " availabilityTimeOffset=\"{}\"", set.availability_time_offset_s);
            }
            out.push_str(">\n");
            for rep in &set.representations {
                write_representation(&mut out, mpd, set, rep);
            }
            out.push_str("    </AdaptationSet>\n");
        }
        out.push_str("  </Period>\n");
    }

    out.push_str("</MPD>\n");
    out
}

fn write_representation(out: &mut String, mpd: &Mpd, set: &AdaptationSet, rep: &Representation) {
    let _ = write!(
        out,
        "      <Representation id=\"{}\" bandwidth=\"{}\"",
        escape(&rep.id),
        rep.bandwidth
    );
    if !rep.codecs.is_empty() {
        let _ = write!(out, " codecs=\"{}\"", escape(&rep.codecs));
    }
    if !rep.mime_type.is_empty() {
        let _ = write!(out, " mimeType=\"{}\"", escape(&rep.mime_type));
    }
    let _ = write!(out, " startWithSAP=\"{}\"", i32::from(rep.start_with_sap));
    if let (Some(w), Some(h)) = (rep.width, rep.height) {
        let _ = write!(out, " width=\"{w}\" height=\"{h}\"");
        if let Some((num, den)) = rep.sar {
            let _ = write!(out, " sar=\"{num}:{den}\"");
        }
        if let Some((num, den)) = rep.frame_rate {
            if den == 1 {
                let _ = write!(out, " frameRate=\"{num}\"");
            } else {
                let _ = write!(out, " frameRate=\"{num}/{den}\"");
            }
        }
    }
    if let Some(rate) = rep.audio_sampling_rate {
        let _ = write!(out, " audioSamplingRate=\"{rate}\"");
    }
    out.push_str(">\n");

    let _ = write!(
        out,
        "        <SegmentTemplate initialization=\"{}\" media=\"{}\" timescale=\"{}\"",
        escape(&rep.initialization),
        escape(&rep.media),
        set.timescale
    );
    if mpd.timeline {
        out.push_str(">\n        <SegmentTimeline>\n");
        for entry in &set.entries {
            let _ = write!(out, "          <S t=\"{}\" d=\"{}\"", entry.start_time, entry.duration);
            if entry.repeat_count > 0 {
                let _ = write!(out, " r=\"{}\"", entry.repeat_count);
            }
            out.push_str("/>\n");
        }
        out.push_str("        </SegmentTimeline>\n        </SegmentTemplate>\n");
    } else {
        let _ = write!(out, " duration=\"{}\" startNumber=\"{}\"", set.duration, set.start_number);
        out.push_str("/>\n");
    }

    out.push_str("      </Representation>\n");
}
