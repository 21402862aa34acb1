// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Minimal modules shared by the pipeline integration tests.

use async_trait::async_trait;
use castflow_core::data::Packet;
use castflow_core::error::Result;
use castflow_core::metadata::{FileInfo, Metadata};
use castflow_core::module::{Host, Module, PortSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Active source: posts `count` packets with increasing media times, then
/// returns. Stops early when asked to.
pub struct CountSource {
    ports: PortSet,
    host: Arc<dyn Host>,
    remaining: usize,
    next_time: i64,
}

impl CountSource {
    pub fn new(host: Arc<dyn Host>, count: usize) -> Box<dyn Module> {
        let mut ports = PortSet::new();
        let output = ports.add_output();
        output.set_metadata(Arc::new(Metadata::File(FileInfo::segment())));
        host.activate(true);
        Box::new(Self { ports, host, remaining: count, next_time: 0 })
    }
}

#[async_trait]
impl Module for CountSource {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let output = self.ports.output(0)?;
        while self.remaining > 0 {
            if self.host.stop_requested() {
                break;
            }
            let mut pkt = Packet::empty();
            pkt.set_media_time(self.next_time);
            self.next_time += 7200;
            self.remaining -= 1;
            output.post(pkt).await;
            // let other tasks breathe, like a real capture loop would
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Transparent single-input transform.
pub struct Passthrough {
    ports: PortSet,
}

impl Passthrough {
    #[allow(clippy::unnecessary_wraps)]
    pub fn new(_host: Arc<dyn Host>) -> Result<Box<dyn Module>> {
        let mut ports = PortSet::new();
        ports.add_input();
        ports.add_output();
        Ok(Box::new(Self { ports }))
    }
}

#[async_trait]
impl Module for Passthrough {
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
            output.post(pkt).await;
        }
        Ok(())
    }
}

/// Sink counting every received packet.
pub struct CountSink {
    ports: PortSet,
    pub received: Arc<AtomicUsize>,
    pub flushed: Arc<AtomicUsize>,
}

impl CountSink {
    pub fn new(received: Arc<AtomicUsize>, flushed: Arc<AtomicUsize>) -> Box<dyn Module> {
        let mut ports = PortSet::new();
        ports.add_input();
        Box::new(Self { ports, received, flushed })
    }
}

#[async_trait]
impl Module for CountSink {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let input = self.ports.input(0)?;
        while input.try_pop().is_some() {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
