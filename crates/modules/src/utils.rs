// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Utility sinks.

use castflow_core::data::Packet;
use castflow_core::error::Result;
use castflow_core::module::{Host, Module, PortSet};
use castflow_core::{async_trait, InputPort};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared view over everything a [`Recorder`] received.
#[derive(Clone, Default)]
pub struct RecorderTap {
    queue: Arc<Mutex<VecDeque<Packet>>>,
}

impl RecorderTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Packet> {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<Packet> {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).drain(..).collect()
    }

    fn push(&self, pkt: Packet) {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_back(pkt);
    }
}

/// Sink that records every received packet for later inspection. The
/// backbone of most module tests.
pub struct Recorder {
    ports: PortSet,
    tap: RecorderTap,
}

impl Recorder {
    pub fn new(_host: Arc<dyn Host>) -> (Box<dyn Module>, RecorderTap) {
        let mut ports = PortSet::new();
        ports.add_input();
        let tap = RecorderTap::new();
        (Box::new(Self { ports, tap: tap.clone() }), tap)
    }

    /// The recorder's single input, for direct wiring in tests.
    pub fn input(&self) -> Arc<InputPort> {
        self.ports.inputs()[0].clone()
    }
}

#[async_trait]
impl Module for Recorder {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    async fn process(&mut self) -> Result<()> {
        let input = self.ports.input(0)?;
        while let Some(pkt) = input.try_pop() {
            self.tap.push(pkt);
        }
        Ok(())
    }
}
