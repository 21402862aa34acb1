// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Procedural raw-video source: a moving box over a flat background, frame
//! index derivable from the picture content.

use castflow_core::clock::CLOCK_RATE;
use castflow_core::data::{Packet, VideoFrame};
use castflow_core::error::Result;
use castflow_core::helpers::config_helpers;
use castflow_core::metadata::{Metadata, PixelFormat, RawVideoInfo, Resolution};
use castflow_core::module::{Host, LogLevel, Module, PortSet};
use castflow_core::{async_trait, ModuleRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VideoGeneratorConfig {
    pub width: u32,
    pub height: u32,
    /// Framerate numerator/denominator.
    pub framerate_num: i64,
    pub framerate_den: i64,
    /// Total frames to produce before ending the stream.
    pub num_frames: u64,
}

impl Default for VideoGeneratorConfig {
    fn default() -> Self {
        Self { width: 320, height: 180, framerate_num: 25, framerate_den: 1, num_frames: 250 }
    }
}

/// Active source producing I420 pictures at an exact framerate.
pub struct VideoGenerator {
    ports: PortSet,
    host: Arc<dyn Host>,
    cfg: VideoGeneratorConfig,
    frame_index: u64,
}

impl VideoGenerator {
    pub fn new(host: Arc<dyn Host>, cfg: VideoGeneratorConfig) -> Box<dyn Module> {
        let mut ports = PortSet::new();
        let output = ports.add_output_with_capacity(super::sound::GENERATOR_POOL_CAPACITY);
        output.set_metadata(Arc::new(Metadata::RawVideo(RawVideoInfo {
            resolution: Resolution::new(cfg.width, cfg.height),
            pixel_format: PixelFormat::I420,
            framerate: (cfg.framerate_num, cfg.framerate_den),
        })));
        host.activate(true);
        Box::new(Self { ports, host, cfg, frame_index: 0 })
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "video_generator",
            serde_json::to_value(schemars::schema_for!(VideoGeneratorConfig)).unwrap_or_default(),
            "Procedural raw video source",
            |host, params| {
                let cfg = config_helpers::parse_config_optional(params)?;
                Ok(Self::new(host, cfg))
            },
        )
    }

    #[allow(clippy::cast_possible_truncation)]
    fn media_time(&self) -> i64 {
        (self.frame_index as i64 * CLOCK_RATE * self.cfg.framerate_den) / self.cfg.framerate_num
    }
}

#[async_trait]
impl Module for VideoGenerator {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let output = self.ports.output(0)?;
        let res = Resolution::new(self.cfg.width, self.cfg.height);

        while self.frame_index < self.cfg.num_frames {
            if self.host.stop_requested() {
                break;
            }
            let Some(buffer) = output.alloc_buffer(0).await else {
                self.host.log(LogLevel::Warning, "allocator exhausted, skipping frame");
                break;
            };

            let mut frame = VideoFrame::new(PixelFormat::I420, res, buffer);
            // flat background, grey chroma
            frame.plane_mut(0).fill(0x10);
            frame.plane_mut(1).fill(0x80);
            frame.plane_mut(2).fill(0x80);

            // a box whose horizontal position encodes the frame index
            let (w, h) = (res.width as usize, res.height as usize);
            let box_size = h / 8;
            #[allow(clippy::cast_possible_truncation)]
            let x0 = (self.frame_index as usize * box_size) % (w - box_size);
            let stride = frame.stride(0);
            let luma = frame.plane_mut(0);
            for y in 0..box_size {
                let row = (h / 2 + y) * stride + x0;
                luma[row..row + box_size].fill(0xF0);
            }

            let mut pkt = Packet::from_video(frame);
            pkt.set_media_time(self.media_time());
            output.post(pkt).await;
            self.frame_index += 1;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use castflow_core::module::NullHost;
    use castflow_core::ports::{connect_ports, InputPort};

    #[tokio::test]
    async fn frame_times_follow_the_framerate() {
        let host = Arc::new(NullHost::default());
        let cfg = VideoGeneratorConfig { num_frames: 5, ..Default::default() };
        let mut module = VideoGenerator::new(host, cfg);

        let sink = Arc::new(InputPort::new());
        let output = module.ports().output(0).unwrap();
        connect_ports(&output, &sink, Arc::new(|_| Box::pin(async {}))).unwrap();

        module.process().await.unwrap();

        for k in 0..5i64 {
            let pkt = sink.try_pop().unwrap();
            assert_eq!(pkt.media_time(), Some(k * 7200));
            let frame = pkt.as_video().unwrap();
            assert_eq!(frame.resolution(), Resolution::new(320, 180));
        }
        assert!(sink.try_pop().is_none());
    }
}
