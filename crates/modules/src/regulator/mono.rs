// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Single-stream regulator: delay each packet until its decoding time.

use castflow_core::clock::{clock_to_timescale, fraction_to_clock, Clock, SystemClock};
use castflow_core::error::Result;
use castflow_core::helpers::config_helpers;
use castflow_core::module::{Host, LogLevel, Module, PortSet};
use castflow_core::{async_trait, ModuleRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const REGULATION_TOLERANCE_IN_MS: i64 = 300;
const FWD_TOLERANCE_IN_MS: i64 = 20_000;
const BWD_TOLERANCE_IN_MS: i64 = 6_000;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RegulatorMonoConfig {
    /// Re-anchor on forward/backward discontinuities instead of sleeping
    /// them out.
    pub resync_allowed: bool,
}

impl Default for RegulatorMonoConfig {
    fn default() -> Self {
        Self { resync_allowed: true }
    }
}

/// Paces a single stream to the clock: sleeps until each packet's decoding
/// time, re-anchoring on discontinuities beyond the tolerances.
pub struct RegulatorMono {
    ports: PortSet,
    host: Arc<dyn Host>,
    clock: Arc<dyn Clock>,
    resync_allowed: bool,
    last_delay_ms: i64,
    offset_ms: i64,
}

impl RegulatorMono {
    pub fn new(host: Arc<dyn Host>, cfg: RegulatorMonoConfig, clock: Arc<dyn Clock>) -> Box<dyn Module> {
        let mut ports = PortSet::new();
        ports.add_input();
        ports.add_output();
        Box::new(Self { ports, host, clock, resync_allowed: cfg.resync_allowed, last_delay_ms: 0, offset_ms: 0 })
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "regulator_mono",
            serde_json::to_value(schemars::schema_for!(RegulatorMonoConfig)).unwrap_or_default(),
            "Single-stream pacing to the clock",
            |host, params| {
                let cfg = config_helpers::parse_config_optional(params)?;
                Ok(Self::new(host, cfg, Arc::new(SystemClock::default())))
            },
        )
    }
}

#[async_trait]
impl Module for RegulatorMono {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let input = self.ports.input(0)?;
        let output = self.ports.output(0)?;

        while let Some(pkt) = input.try_pop() {
            let time_target = pkt.decoding_time().or_else(|| pkt.media_time()).unwrap_or(0);
            loop {
                let time_now = fraction_to_clock(self.clock.now());
                let delay_ms = clock_to_timescale(time_target - time_now, 1000) - self.offset_ms;
                if delay_ms > 0 {
                    if self.resync_allowed && delay_ms > FWD_TOLERANCE_IN_MS {
                        self.host
                            .log(LogLevel::Warning, &format!("forward discontinuity detected ({delay_ms} ms)"));
                        self.offset_ms += delay_ms;
                        continue;
                    }
                    if delay_ms > REGULATION_TOLERANCE_IN_MS {
                        self.host.log(LogLevel::Debug, &format!("will sleep for {delay_ms} ms"));
                    }
                    #[allow(clippy::cast_sign_loss)]
                    tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                } else if delay_ms < -REGULATION_TOLERANCE_IN_MS {
                    if self.resync_allowed && delay_ms < -BWD_TOLERANCE_IN_MS {
                        self.host
                            .log(LogLevel::Warning, &format!("backward discontinuity detected ({} ms)", -delay_ms));
                        self.offset_ms += delay_ms;
                        continue;
                    }
                    if -delay_ms > self.last_delay_ms.abs() {
                        #[allow(clippy::cast_precision_loss)]
                        self.host.log(LogLevel::Warning, &format!("late data ({:.2}s)", -delay_ms as f64 / 1000.0));
                    }
                }
                self.last_delay_ms = delay_ms;
                break;
            }
            output.post(pkt).await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use castflow_core::clock::TestClock;
    use castflow_core::data::Packet;
    use castflow_core::module::NullHost;
    use castflow_core::ports::{connect_ports, InputPort};
    use castflow_core::Fraction;

    async fn run_one(reg: &mut Box<dyn Module>, sink: &Arc<InputPort>, dts_ms: i64) -> Packet {
        let mut pkt = Packet::empty();
        pkt.set_decoding_time(castflow_core::clock::timescale_to_clock(dts_ms, 1000));
        reg.ports().input(0).unwrap().push(pkt).unwrap();
        reg.process().await.unwrap();
        sink.try_pop().unwrap()
    }

    #[tokio::test]
    async fn emits_late_data_unchanged() {
        let clock = Arc::new(TestClock::new(Fraction::new(10, 1)));
        let host = Arc::new(NullHost::default());
        let mut reg = RegulatorMono::new(host, RegulatorMonoConfig { resync_allowed: false }, clock);

        let sink = Arc::new(InputPort::new());
        let output = reg.ports().output(0).unwrap();
        connect_ports(&output, &sink, Arc::new(|_| Box::pin(async {}))).unwrap();

        // 2 s late: logged, still emitted, unchanged
        let out = run_one(&mut reg, &sink, 8000).await;
        assert_eq!(out.decoding_time(), Some(castflow_core::clock::timescale_to_clock(8000, 1000)));
    }

    #[tokio::test]
    async fn forward_discontinuity_re_anchors_without_sleeping() {
        let clock = Arc::new(TestClock::new(Fraction::new(0, 1)));
        let host = Arc::new(NullHost::default());
        let mut reg = RegulatorMono::new(host, RegulatorMonoConfig::default(), clock);

        let sink = Arc::new(InputPort::new());
        let output = reg.ports().output(0).unwrap();
        connect_ports(&output, &sink, Arc::new(|_| Box::pin(async {}))).unwrap();

        // 30 s in the future, far beyond the forward tolerance: the offset
        // absorbs it, so this returns promptly on a frozen test clock.
        let start = std::time::Instant::now();
        run_one(&mut reg, &sink, 30_000).await;
        assert!(start.elapsed() < std::time::Duration::from_secs(5));

        // a follow-up packet 100 ms later is now on-time relative to the
        // shifted anchor and needs no long sleep either
        let start = std::time::Instant::now();
        run_one(&mut reg, &sink, 30_100).await;
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn backward_discontinuity_re_anchors() {
        let clock = Arc::new(TestClock::new(Fraction::new(100, 1)));
        let host = Arc::new(NullHost::default());
        let mut reg = RegulatorMono::new(host, RegulatorMonoConfig::default(), clock);

        let sink = Arc::new(InputPort::new());
        let output = reg.ports().output(0).unwrap();
        connect_ports(&output, &sink, Arc::new(|_| Box::pin(async {}))).unwrap();

        // 100 s behind the clock: beyond the backward tolerance
        run_one(&mut reg, &sink, 0).await;
        // the next packet at the same pace passes without being declared late
        run_one(&mut reg, &sink, 40).await;
        assert!(sink.try_pop().is_none());
    }
}
