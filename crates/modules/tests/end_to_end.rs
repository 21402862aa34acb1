// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Whole-pipeline tests: built-in modules wired through the graph runtime.

#![allow(clippy::unwrap_used)]

use castflow_core::async_trait;
use castflow_core::clock::timescale_to_clock;
use castflow_core::data::Packet;
use castflow_core::error::Result;
use castflow_core::metadata::{FileInfo, Metadata, Resolution, StreamKind};
use castflow_core::module::{Host, Module, PortSet};
use castflow_core::ModuleRegistry;
use castflow_modules::utils::Recorder;
use castflow_pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;

/// Active source posting pre-encoded segment packets.
struct SegmentSource {
    ports: PortSet,
    host: Arc<dyn Host>,
    remaining: i64,
    seg_ms: i64,
    produced: i64,
}

impl SegmentSource {
    fn new(host: Arc<dyn Host>, count: i64, seg_ms: i64) -> Box<dyn Module> {
        let mut ports = PortSet::new();
        ports.add_output();
        host.activate(true);
        Box::new(Self { ports, host, remaining: count, seg_ms, produced: 0 })
    }

    fn packet(&self) -> Packet {
        let mut fi = FileInfo::with_kind(StreamKind::VideoPkt);
        fi.mime_type = "video/mp4".to_string();
        fi.codec_name = "avc1.64001f".to_string();
        fi.duration_in_180k = timescale_to_clock(self.seg_ms, 1000);
        fi.filesize = 64;
        fi.starts_with_rap = true;
        fi.eos = true;
        fi.resolution = Some(Resolution::new(320, 180));
        let mut pkt = Packet::from_bytes(bytes::Bytes::from_static(&[0u8; 64]));
        pkt.set_metadata(Arc::new(Metadata::File(fi)));
        pkt.set_media_time(timescale_to_clock(self.produced * self.seg_ms, 1000));
        pkt
    }
}

#[async_trait]
impl Module for SegmentSource {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let output = self.ports.output(0)?;
        while self.remaining > 0 && !self.host.stop_requested() {
            let pkt = self.packet();
            self.produced += 1;
            self.remaining -= 1;
            output.post(pkt).await;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn video_generator_feeds_a_recorder() {
    let mut registry = ModuleRegistry::new();
    castflow_modules::register_modules(&mut registry).unwrap();
    let pipeline = Pipeline::with_registry(registry);

    let cfg = serde_json::json!({ "num_frames": 30 });
    let gen = pipeline.load_module("video_generator", Some(&cfg)).unwrap();

    let tap = {
        let (module, tap) = Recorder::new(Arc::new(castflow_core::NullHost::default()));
        let id = pipeline.add_module("recorder", move |_| Ok(module)).unwrap();
        pipeline.connect(gen, 0, id, 0, false).await.unwrap();
        tap
    };

    pipeline.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), pipeline.wait_for_completion()).await.unwrap().unwrap();

    let frames = tap.drain();
    assert_eq!(frames.len(), 30);
    for (k, pkt) in frames.iter().enumerate() {
        assert_eq!(pkt.media_time(), Some(k as i64 * 7200));
        assert_eq!(pkt.metadata().unwrap().kind(), StreamKind::VideoRaw);
    }
}

#[tokio::test]
async fn sound_generator_produces_contiguous_audio() {
    let mut registry = ModuleRegistry::new();
    castflow_modules::register_modules(&mut registry).unwrap();
    let pipeline = Pipeline::with_registry(registry);

    let cfg = serde_json::json!({ "num_frames": 25 });
    let gen = pipeline.load_module("sound_generator", Some(&cfg)).unwrap();

    let (module, tap) = Recorder::new(Arc::new(castflow_core::NullHost::default()));
    let rec = pipeline.add_module("recorder", move |_| Ok(module)).unwrap();
    pipeline.connect(gen, 0, rec, 0, true).await.unwrap();

    pipeline.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), pipeline.wait_for_completion()).await.unwrap().unwrap();

    let frames = tap.drain();
    assert_eq!(frames.len(), 25);
    let mut expected_time = 0i64;
    for pkt in frames {
        assert_eq!(pkt.media_time(), Some(expected_time));
        expected_time += 7200; // 40 ms
        assert_eq!(pkt.as_pcm().unwrap().sample_count(), 1764);
    }
}

/// Two-input sink recording the arrival order of stream kinds across both
/// of its inputs. Dispatch is synchronous, so arrival order is emission
/// order.
struct OrderProbe {
    ports: PortSet,
    log: Arc<std::sync::Mutex<Vec<StreamKind>>>,
}

impl OrderProbe {
    fn new(log: Arc<std::sync::Mutex<Vec<StreamKind>>>) -> Box<dyn Module> {
        let mut ports = PortSet::new();
        ports.add_input();
        ports.add_input();
        Box::new(Self { ports, log })
    }
}

#[async_trait]
impl Module for OrderProbe {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        for input in self.ports.inputs() {
            while let Some(pkt) = input.try_pop() {
                if let Some(meta) = pkt.metadata() {
                    self.log.lock().unwrap().push(meta.kind());
                }
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn dasher_emits_manifests_after_segments() {
    let pipeline = Pipeline::new();

    let src = pipeline.add_module("segment_source", |h| Ok(SegmentSource::new(h, 5, 3000))).unwrap();
    let dasher = pipeline
        .add_module("dasher", |h| {
            castflow_modules::adaptive::dasher::Dasher::new(
                h,
                castflow_modules::adaptive::dasher::DasherConfig {
                    live: true,
                    seg_duration_ms: 3000,
                    time_shift_buffer_depth_ms: 300_000,
                    ..Default::default()
                },
                Arc::new(castflow_modules::adaptive::FixedUtcClock(1_700_000_000_000)),
            )
        })
        .unwrap();

    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let probe = {
        let log = log.clone();
        pipeline.add_module("probe", move |_| Ok(OrderProbe::new(log))).unwrap()
    };

    pipeline.connect(src, 0, dasher, 0, false).await.unwrap();
    pipeline.connect(dasher, 0, probe, 0, false).await.unwrap();
    pipeline.connect(dasher, 1, probe, 1, false).await.unwrap();

    pipeline.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), pipeline.wait_for_completion()).await.unwrap().unwrap();

    let kinds = log.lock().unwrap().clone();
    let manifest_count = kinds.iter().filter(|k| **k == StreamKind::Playlist).count();
    let segment_count = kinds.iter().filter(|k| **k == StreamKind::Segment).count();
    assert_eq!(manifest_count, 5);
    assert_eq!(segment_count, 5);

    // between two manifests there is at least one segment, and each
    // manifest follows its tick's segments
    let mut since_last_manifest = 0usize;
    let mut seen_any = false;
    for kind in kinds {
        match kind {
            StreamKind::Segment => since_last_manifest += 1,
            StreamKind::Playlist => {
                assert!(since_last_manifest >= 1, "manifest emitted before its segments");
                since_last_manifest = 0;
                seen_any = true;
            },
            _ => {},
        }
    }
    assert!(seen_any);
}
