// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Multi-stream regulator.
//!
//! Delays dispatch until all data up to a media time is available, so
//! downstream modules see comparable media times across streams. Data is
//! never modified, only held back; clock times bound the holding so no
//! stream can be starved.

use castflow_core::clock::{fraction_to_clock, timescale_to_clock, Clock, SystemClock};
use castflow_core::data::Packet;
use castflow_core::error::Result;
use castflow_core::helpers::config_helpers;
use castflow_core::module::{Host, LogLevel, Module, PortSet};
use castflow_core::{async_trait, ModuleRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RegulatorMultiConfig {
    /// How far behind the most-advanced stream data may be before it is
    /// dispatched regardless.
    pub max_media_time_delay_ms: i64,
    /// How long data may sit queued in wall-clock terms.
    pub max_clock_time_delay_ms: i64,
}

impl Default for RegulatorMultiConfig {
    fn default() -> Self {
        Self { max_media_time_delay_ms: 3000, max_clock_time_delay_ms: 3000 }
    }
}

struct Rec {
    creation_time: i64,
    pkt: Packet,
}

/// N-stream aligned dispatch: one output mirrors each input.
pub struct RegulatorMulti {
    ports: PortSet,
    host: Arc<dyn Host>,
    clock: Arc<dyn Clock>,
    max_media_time_delay: i64,
    max_clock_time_delay: i64,
    streams: Vec<Vec<Rec>>,
    media_dispatch_time: i64,
}

impl RegulatorMulti {
    pub fn new(host: Arc<dyn Host>, cfg: RegulatorMultiConfig, clock: Arc<dyn Clock>) -> Box<dyn Module> {
        Box::new(Self {
            ports: PortSet::new(),
            host,
            clock,
            max_media_time_delay: timescale_to_clock(cfg.max_media_time_delay_ms, 1000),
            max_clock_time_delay: timescale_to_clock(cfg.max_clock_time_delay_ms, 1000),
            streams: Vec::new(),
            media_dispatch_time: i64::MIN,
        })
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "regulator_multi",
            serde_json::to_value(schemars::schema_for!(RegulatorMultiConfig)).unwrap_or_default(),
            "Multi-stream aligned dispatch",
            |host, params| {
                let cfg = config_helpers::parse_config_optional(params)?;
                Ok(Self::new(host, cfg, Arc::new(SystemClock::default())))
            },
        )
    }

    fn pop_any(&self) -> Option<(usize, Packet)> {
        for (idx, input) in self.ports.inputs().iter().enumerate() {
            if let Some(pkt) = input.try_pop() {
                return Some((idx, pkt));
            }
        }
        None
    }

    async fn dispatch(&mut self, predicate: impl Fn(&Rec) -> bool) -> Result<usize> {
        let mut dispatched = 0;
        for idx in 0..self.streams.len() {
            let ready: Vec<Packet> = {
                let stream = &mut self.streams[idx];
                let mut kept = Vec::new();
                let mut out = Vec::new();
                for rec in stream.drain(..) {
                    if predicate(&rec) {
                        out.push(rec.pkt);
                    } else {
                        kept.push(rec);
                    }
                }
                *stream = kept;
                out
            };
            if !ready.is_empty() {
                dispatched += ready.len();
                let output = self.ports.output(idx)?;
                for pkt in ready {
                    output.post(pkt).await;
                }
            }
        }
        Ok(dispatched)
    }
}

#[async_trait]
impl Module for RegulatorMulti {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    fn dynamic_inputs(&self) -> bool {
        true
    }

    /// One output mirrors each input.
    fn ensure_input(&mut self, idx: usize) -> Result<()> {
        while self.ports.num_inputs() <= idx {
            self.ports.add_input();
            self.ports.add_output();
            self.streams.push(Vec::new());
        }
        Ok(())
    }

    async fn process(&mut self) -> Result<()> {
        while let Some((idx, pkt)) = self.pop_any() {
            if pkt.is_declaration() {
                self.ports.output(idx)?.post(pkt).await;
                continue;
            }

            let now = fraction_to_clock(self.clock.now());
            let is_av = pkt.metadata().is_some_and(|m| m.is_audio() || m.is_video());
            let decoding_time = pkt.decoding_time().or_else(|| pkt.media_time()).unwrap_or(0);
            self.streams[idx].push(Rec { creation_time: now, pkt });

            if is_av {
                self.media_dispatch_time =
                    self.media_dispatch_time.max(decoding_time - self.max_media_time_delay);
            }

            // Stream-relative: old versus the most-advanced stream.
            let media_dispatch_time = self.media_dispatch_time;
            self.dispatch(|rec: &Rec| {
                rec.pkt.decoding_time().or_else(|| rec.pkt.media_time()).unwrap_or(0) < media_dispatch_time
            })
            .await?;

            // Absolute: queued too long, dispatch anyway.
            let max_clock_time_delay = self.max_clock_time_delay;
            let forced = self.dispatch(move |rec: &Rec| rec.creation_time < now - max_clock_time_delay).await?;
            if forced > 0 {
                self.host.log(LogLevel::Debug, &format!("{forced} packet(s) dispatched on clock-time bound"));
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        for idx in 0..self.streams.len() {
            let remaining: Vec<Packet> = self.streams[idx].drain(..).map(|r| r.pkt).collect();
            let output = self.ports.output(idx)?;
            for pkt in remaining {
                output.post(pkt).await;
            }
        }
        Ok(())
    }
}
