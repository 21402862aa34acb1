// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Beep generator: interleaved S16 stereo, 880 Hz, one beep per second.

use castflow_core::clock::CLOCK_RATE;
use castflow_core::data::{AudioLayout, AudioStruct, Packet, PcmFormat, PcmFrame, SampleFormat};
use castflow_core::error::Result;
use castflow_core::helpers::config_helpers;
use castflow_core::metadata::Metadata;
use castflow_core::module::{Host, LogLevel, Module, PortSet};
use castflow_core::{async_trait, ModuleRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

const SINE_FREQ: f64 = 880.0;
const SAMPLES_PER_FRAME: u64 = 40 * 44_100 / 1000; // 40 ms

/// Generators feed whole pipelines; their pool bounds how far they can run
/// ahead of consumption.
pub(crate) const GENERATOR_POOL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SoundGeneratorConfig {
    /// Total frames to produce before ending the stream.
    pub num_frames: u64,
}

impl Default for SoundGeneratorConfig {
    fn default() -> Self {
        Self { num_frames: 250 }
    }
}

/// Active source producing a metronome-like sine signal with exact media
/// times.
pub struct SoundGenerator {
    ports: PortSet,
    host: Arc<dyn Host>,
    format: PcmFormat,
    num_samples: u64,
    frames_left: u64,
}

impl SoundGenerator {
    pub fn new(host: Arc<dyn Host>, cfg: SoundGeneratorConfig) -> Box<dyn Module> {
        let format = PcmFormat::new(44_100, AudioLayout::Stereo, SampleFormat::S16, AudioStruct::Interleaved);
        let mut ports = PortSet::new();
        let output = ports.add_output_with_capacity(GENERATOR_POOL_CAPACITY);
        output.set_metadata(Arc::new(Metadata::RawAudio(format)));
        host.activate(true);
        Box::new(Self { ports, host, format, num_samples: 0, frames_left: cfg.num_frames })
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "sound_generator",
            serde_json::to_value(schemars::schema_for!(SoundGeneratorConfig)).unwrap_or_default(),
            "Sine-beep raw audio source",
            |host, params| {
                let cfg = config_helpers::parse_config_optional(params)?;
                Ok(Self::new(host, cfg))
            },
        )
    }

    fn next_sample(&mut self) -> f64 {
        let beep_period = u64::from(self.format.sample_rate);
        let beep_phase = self.num_samples % beep_period;
        #[allow(clippy::cast_precision_loss)]
        let phase = self.num_samples as f64 * 2.0 * SINE_FREQ * PI / f64::from(self.format.sample_rate);
        self.num_samples += 1;
        if beep_phase < beep_period / 8 {
            phase.sin()
        } else {
            0.0
        }
    }
}

#[async_trait]
impl Module for SoundGenerator {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let output = self.ports.output(0)?;
        while self.frames_left > 0 {
            if self.host.stop_requested() {
                break;
            }

            #[allow(clippy::cast_possible_truncation)]
            let sample_count = SAMPLES_PER_FRAME as usize;
            let Some(buffer) = output.alloc_buffer(sample_count * self.format.bytes_per_sample()).await else {
                self.host.log(LogLevel::Warning, "allocator exhausted, skipping frame");
                break;
            };

            #[allow(clippy::cast_possible_truncation)]
            let media_time = (self.num_samples as i64 * CLOCK_RATE) / i64::from(self.format.sample_rate);

            let mut frame = PcmFrame::new(self.format, sample_count, buffer);
            {
                let data = frame.plane_mut(0);
                for i in 0..sample_count {
                    #[allow(clippy::cast_possible_truncation)]
                    let val = (self.next_sample() * 32767.0) as i16;
                    let bytes = val.to_le_bytes();
                    // left then right
                    data[i * 4] = bytes[0];
                    data[i * 4 + 1] = bytes[1];
                    data[i * 4 + 2] = bytes[0];
                    data[i * 4 + 3] = bytes[1];
                }
            }

            let mut pkt = Packet::from_pcm(frame);
            pkt.set_media_time(media_time);
            output.post(pkt).await;
            self.frames_left -= 1;
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
    async fn produces_exact_media_times() {
        let host = Arc::new(NullHost::default());
        let mut module = SoundGenerator::new(host, SoundGeneratorConfig { num_frames: 3 });

        let sink = Arc::new(InputPort::new());
        let output = module.ports().output(0).unwrap();
        connect_ports(&output, &sink, Arc::new(|_| Box::pin(async {}))).unwrap();

        module.process().await.unwrap();

        // 40 ms at 44100 Hz = 1764 samples = 7200 ticks
        let mut expected = 0i64;
        for _ in 0..3 {
            let pkt = sink.try_pop().unwrap();
            assert_eq!(pkt.media_time(), Some(expected));
            let frame = pkt.as_pcm().unwrap();
            assert_eq!(frame.sample_count(), 1764);
            expected += 7200;
        }
        assert!(sink.try_pop().is_none());
    }
}
