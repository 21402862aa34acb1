// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-module wrapper: guarded processing and the termination protocol.
//!
//! Modules never see end of stream themselves. The wrapper counts EOS
//! arrivals per input; once every connected input is done it calls `flush`
//! exactly once, then either forwards EOS on all outputs or, for a sink,
//! notifies the pipeline's completion state.

use crate::host::ModuleHost;
use castflow_core::error::CastflowError;
use castflow_core::module::{Host, LogLevel, Module};
use castflow_core::ports::{OutputPort, PortEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};

/// Completion accounting shared by all nodes of one pipeline.
pub(crate) struct Completion {
    state: StdMutex<CompletionState>,
    pub(crate) notify: Notify,
}

struct CompletionState {
    remaining_sinks: usize,
    error: Option<CastflowError>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self { state: StdMutex::new(CompletionState { remaining_sinks: 0, error: None }), notify: Notify::new() }
    }

    pub(crate) fn set_sink_count(&self, count: usize) {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.remaining_sinks = count;
    }

    pub(crate) fn sink_done(&self) {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.remaining_sinks = st.remaining_sinks.saturating_sub(1);
        drop(st);
        self.notify.notify_waiters();
    }

    pub(crate) fn record_error(&self, err: CastflowError) {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if st.error.is_none() {
            st.error = Some(err);
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remaining_sinks
    }

    pub(crate) fn take_error(&self) -> Option<CastflowError> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).error.take()
    }
}

/// One module owned by a pipeline.
pub(crate) struct PipelineNode {
    pub(crate) name: String,
    pub(crate) module: Mutex<Box<dyn Module>>,
    pub(crate) host: Arc<ModuleHost>,
    completion: Arc<Completion>,
    /// EOS arrivals per input index.
    eos_seen: StdMutex<HashMap<usize, usize>>,
    eos_forwarded: AtomicBool,
    is_sink: AtomicBool,
}

impl PipelineNode {
    pub(crate) fn new(
        name: String,
        module: Box<dyn Module>,
        host: Arc<ModuleHost>,
        completion: Arc<Completion>,
    ) -> Self {
        Self {
            name,
            module: Mutex::new(module),
            host,
            completion,
            eos_seen: StdMutex::new(HashMap::new()),
            eos_forwarded: AtomicBool::new(false),
            is_sink: AtomicBool::new(false),
        }
    }

    /// A sink has no connected outputs. Decided at start time.
    pub(crate) async fn classify(&self) -> bool {
        let module = self.module.lock().await;
        let sink = module.ports().outputs().iter().all(|o| o.signal().num_connections() == 0);
        drop(module);
        self.is_sink.store(sink, Ordering::SeqCst);
        sink
    }

    pub(crate) fn is_sink(&self) -> bool {
        self.is_sink.load(Ordering::SeqCst)
    }

    /// Receiver-side continuation of a connection to input `input_idx`.
    pub(crate) async fn dispatch(&self, input_idx: usize, evt: PortEvent) {
        match evt {
            PortEvent::Data => self.process_guarded().await,
            PortEvent::Eos => self.on_input_eos(input_idx).await,
            PortEvent::Error(e) => {
                self.host.log(LogLevel::Error, &format!("dropping packet: {e}"));
                self.completion.record_error(e);
            },
        }
    }

    /// Run the module's `process`, catching its error at the per-module
    /// boundary.
    pub(crate) async fn process_guarded(&self) {
        let mut module = self.module.lock().await;
        if let Err(e) = module.process().await {
            drop(module);
            self.host.log(LogLevel::Error, &format!("process failed: {e}"));
            self.completion.record_error(e);
        }
    }

    /// Driving-task body for an active (source) module: run its work loop,
    /// then propagate termination.
    pub(crate) async fn run_source(&self) {
        self.process_guarded().await;
        self.terminate().await;
    }

    async fn on_input_eos(&self, input_idx: usize) {
        let done = {
            let module = self.module.lock().await;
            let mut seen = self.eos_seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *seen.entry(input_idx).or_insert(0) += 1;

            let inputs = module.ports().inputs();
            inputs.iter().enumerate().all(|(idx, input)| {
                let connections = input.num_connections();
                connections == 0 || seen.get(&idx).copied().unwrap_or(0) >= connections
            })
        };
        if done {
            self.terminate().await;
        }
    }

    /// Flush once, then forward EOS downstream or notify completion.
    async fn terminate(&self) {
        if self.eos_forwarded.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut module = self.module.lock().await;
            if let Err(e) = module.flush().await {
                drop(module);
                self.host.log(LogLevel::Error, &format!("flush failed: {e}"));
                self.completion.record_error(e);
            }
        }

        if self.is_sink() {
            tracing::debug!(module = %self.name, "sink finished");
            self.completion.sink_done();
            return;
        }

        let outputs: Vec<Arc<OutputPort>> = {
            let module = self.module.lock().await;
            module.ports().outputs().to_vec()
        };
        for output in outputs {
            output.post_eos().await;
        }
    }
}
