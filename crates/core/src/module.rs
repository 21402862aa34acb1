// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The processing-unit contract.
//!
//! A [`Module`] pulls packets from its input ports and posts packets on its
//! output ports. Ports live in an embedded [`PortSet`] the module exposes
//! through accessors; the pipeline wires them and drives `process`.
//!
//! Conventions carried by the framework rather than by sub-traits:
//! - *single-input* modules implement `process` as "pop one packet, handle
//!   it" — `process` is invoked once per arriving packet;
//! - *dynamic-input* modules return `true` from [`Module::dynamic_inputs`]
//!   and grow in [`Module::ensure_input`], so callers can plug arbitrarily
//!   many producers without prior sizing;
//! - *active* (source-like) modules declare themselves with
//!   [`Host::activate`]; their `process` is the whole work loop and must
//!   poll [`Host::stop_requested`] to honor a shutdown request.

use crate::error::{CastflowError, Result};
use crate::ports::{InputPort, OutputPort, DEFAULT_POOL_CAPACITY};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Module log levels, mapped by hosts onto `tracing` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    /// Below every displayed level: messages logged at `Quiet` are never
    /// emitted. Lets a call site be silenced without being deleted.
    Quiet,
}

/// Services the framework provides to a module.
pub trait Host: Send + Sync {
    /// Log a message. Hosts rate-limit identical consecutive messages.
    fn log(&self, level: LogLevel, msg: &str);

    /// Declare this module active (source-like: the pipeline must drive it
    /// on its own task) or passive (driven by incoming packets).
    fn activate(&self, active: bool);

    fn is_active(&self) -> bool;

    /// True once the pipeline has asked sources to stop. Active modules
    /// must poll this from their work loop and return promptly.
    fn stop_requested(&self) -> bool;
}

/// Host for standalone module use (unit tests, tools): logs straight to
/// `tracing`, never asks for a stop.
#[derive(Default)]
pub struct NullHost {
    active: AtomicBool,
}

impl Host for NullHost {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Error => tracing::error!("{msg}"),
            LogLevel::Warning => tracing::warn!("{msg}"),
            LogLevel::Info => tracing::info!("{msg}"),
            LogLevel::Debug => tracing::debug!("{msg}"),
            LogLevel::Quiet => {},
        }
    }

    fn activate(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        false
    }
}

/// The ports of one module. Modules compose by embedding.
#[derive(Default)]
pub struct PortSet {
    inputs: Vec<Arc<InputPort>>,
    outputs: Vec<Arc<OutputPort>>,
}

impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self) -> Arc<InputPort> {
        let input = Arc::new(InputPort::new());
        self.inputs.push(input.clone());
        input
    }

    pub fn add_output(&mut self) -> Arc<OutputPort> {
        self.add_output_with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Add an output with a specific allocator size. The pool capacity is
    /// fixed for the life of the output.
    pub fn add_output_with_capacity(&mut self, pool_capacity: usize) -> Arc<OutputPort> {
        let output = Arc::new(OutputPort::new(pool_capacity));
        self.outputs.push(output.clone());
        output
    }

    /// Grow the input list so that index `idx` exists.
    pub fn grow_inputs(&mut self, idx: usize) {
        while self.inputs.len() <= idx {
            self.add_input();
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, idx: usize) -> Result<Arc<InputPort>> {
        self.inputs
            .get(idx)
            .cloned()
            .ok_or_else(|| CastflowError::TopologyError(format!("no input {idx}")))
    }

    pub fn output(&self, idx: usize) -> Result<Arc<OutputPort>> {
        self.outputs
            .get(idx)
            .cloned()
            .ok_or_else(|| CastflowError::TopologyError(format!("no output {idx}")))
    }

    pub fn inputs(&self) -> &[Arc<InputPort>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<OutputPort>] {
        &self.outputs
    }
}

/// A processing unit: pull from inputs, push to outputs.
#[async_trait]
pub trait Module: Send {
    fn ports(&self) -> &PortSet;

    fn ports_mut(&mut self) -> &mut PortSet;

    /// Process pending input (passive modules) or run the work loop (active
    /// modules). Invoked by the pipeline after each packet delivery, or on
    /// a dedicated task for active modules.
    async fn process(&mut self) -> Result<()>;

    /// Drain internal state at end of stream. Must be idempotent: a second
    /// call is a no-op.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether the input count grows on demand.
    fn dynamic_inputs(&self) -> bool {
        false
    }

    /// Make input `idx` exist. The default rejects indices beyond the
    /// declared inputs; dynamic-input modules override and grow.
    fn ensure_input(&mut self, idx: usize) -> Result<()> {
        if idx < self.ports().num_inputs() {
            Ok(())
        } else {
            Err(CastflowError::TopologyError(format!("no input {idx}")))
        }
    }
}

impl std::fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Module>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_set_grows_and_indexes() {
        let mut ports = PortSet::new();
        assert!(ports.input(0).is_err());

        ports.grow_inputs(2);
        assert_eq!(ports.num_inputs(), 3);
        assert!(ports.input(2).is_ok());

        ports.add_output();
        assert_eq!(ports.num_outputs(), 1);
        assert!(ports.output(1).is_err());
    }

    #[test]
    fn null_host_activation() {
        let host = NullHost::default();
        assert!(!host.is_active());
        host.activate(true);
        assert!(host.is_active());
        assert!(!host.stop_requested());
    }
}
