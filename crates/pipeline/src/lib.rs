// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Castflow Pipeline - the graph owner.
//!
//! A [`Pipeline`] holds modules as nodes and port connections as edges. It
//! wires ports (with metadata negotiation), drives active modules on their
//! own tasks, and runs the termination protocol: sources post an
//! end-of-stream marker on every output; every module is flushed when all
//! its connected inputs are done; sinks notify completion.
//!
//! Connections dispatch synchronously on the emitter's task by default. An
//! edge created with `force_async` instead posts into a bounded channel
//! drained by a task on the receiving side.

mod constants;
mod host;
mod node;

pub use host::ModuleHost;

use castflow_core::error::{CastflowError, Result};
use castflow_core::module::{Host, Module};
use castflow_core::ports::{connect_ports, disconnect_ports, Dispatcher, PortEvent, SubscriptionId};
use castflow_core::registry::ModuleRegistry;
use node::{Completion, PipelineNode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Identifies a module within its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(usize);

struct Edge {
    src: ModuleId,
    out_idx: usize,
    dst: ModuleId,
    in_idx: usize,
    sub_id: SubscriptionId,
    is_async: bool,
}

/// Owns every module and every connection of one graph.
pub struct Pipeline {
    nodes: Mutex<Vec<Option<Arc<PipelineNode>>>>,
    edges: Mutex<Vec<Edge>>,
    completion: Arc<Completion>,
    registry: ModuleRegistry,
    started: AtomicBool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_registry(ModuleRegistry::new())
    }

    /// A pipeline that can instantiate modules by name via
    /// [`Pipeline::load_module`].
    pub fn with_registry(registry: ModuleRegistry) -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
            edges: Mutex::new(Vec::new()),
            completion: Arc::new(Completion::new()),
            registry,
            started: AtomicBool::new(false),
        }
    }

    /// Add a module built by `build`, which receives the host the pipeline
    /// provides (so constructors can declare themselves active).
    pub fn add_module<F>(&self, name: impl Into<String>, build: F) -> Result<ModuleId>
    where
        F: FnOnce(Arc<dyn Host>) -> Result<Box<dyn Module>>,
    {
        let name = name.into();
        let host = Arc::new(ModuleHost::new(name.clone()));
        let module = build(host.clone())?;
        Ok(self.retain(name, module, host))
    }

    /// Instantiate a registered module kind and add it.
    pub fn load_module(&self, kind: &str, cfg: Option<&serde_json::Value>) -> Result<ModuleId> {
        let host = Arc::new(ModuleHost::new(kind.to_string()));
        let module = self.registry.instantiate(kind, host.clone(), cfg)?;
        Ok(self.retain(kind.to_string(), module, host))
    }

    fn retain(&self, name: String, module: Box<dyn Module>, host: Arc<ModuleHost>) -> ModuleId {
        let mut nodes = self.nodes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = ModuleId(nodes.len());
        nodes.push(Some(Arc::new(PipelineNode::new(name, module, host, self.completion.clone()))));
        id
    }

    fn node(&self, id: ModuleId) -> Result<Arc<PipelineNode>> {
        let nodes = self.nodes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        nodes
            .get(id.0)
            .and_then(Clone::clone)
            .ok_or_else(|| CastflowError::TopologyError(format!("no module #{}", id.0)))
    }

    /// Wire `src`'s output `out_idx` to `dst`'s input `in_idx`.
    ///
    /// With `force_async`, delivery crosses a bounded channel to a task on
    /// the receiving side instead of running on the emitter's task.
    pub async fn connect(
        &self,
        src: ModuleId,
        out_idx: usize,
        dst: ModuleId,
        in_idx: usize,
        force_async: bool,
    ) -> Result<()> {
        let src_node = self.node(src)?;
        let dst_node = self.node(dst)?;

        let output = {
            let module = src_node.module.lock().await;
            module.ports().output(out_idx)?
        };
        let input = {
            let mut module = dst_node.module.lock().await;
            module.ensure_input(in_idx)?;
            module.ports().input(in_idx)?
        };

        let dispatcher: Dispatcher = if force_async {
            let (tx, mut rx) = mpsc::channel::<PortEvent>(constants::ASYNC_EDGE_CAPACITY);
            let receiver = dst_node.clone();
            tokio::spawn(async move {
                while let Some(evt) = rx.recv().await {
                    receiver.dispatch(in_idx, evt).await;
                }
            });
            Arc::new(move |evt| {
                let tx = tx.clone();
                Box::pin(async move {
                    if tx.send(evt).await.is_err() {
                        tracing::debug!("async edge closed, dropping event");
                    }
                })
            })
        } else {
            let receiver = dst_node.clone();
            Arc::new(move |evt| {
                let receiver = receiver.clone();
                Box::pin(async move { receiver.dispatch(in_idx, evt).await })
            })
        };

        let sub_id = connect_ports(&output, &input, dispatcher)?;
        let mut edges = self.edges.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        edges.push(Edge { src, out_idx, dst, in_idx, sub_id, is_async: force_async });
        Ok(())
    }

    /// Sever one edge. Errors if the edge does not exist.
    pub async fn disconnect(&self, src: ModuleId, out_idx: usize, dst: ModuleId, in_idx: usize) -> Result<()> {
        let edge = {
            let mut edges = self.edges.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let pos = edges
                .iter()
                .position(|e| e.src == src && e.out_idx == out_idx && e.dst == dst && e.in_idx == in_idx)
                .ok_or_else(|| CastflowError::TopologyError("no such connection".to_string()))?;
            edges.remove(pos)
        };

        let src_node = self.node(src)?;
        let dst_node = self.node(dst)?;
        let output = {
            let module = src_node.module.lock().await;
            module.ports().output(edge.out_idx)?
        };
        let input = {
            let module = dst_node.module.lock().await;
            module.ports().input(edge.in_idx)?
        };
        disconnect_ports(&output, &input, edge.sub_id)
    }

    /// Drop a module. Errors while any edge still references it.
    pub fn remove_module(&self, id: ModuleId) -> Result<()> {
        {
            let edges = self.edges.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if edges.iter().any(|e| e.src == id || e.dst == id) {
                return Err(CastflowError::TopologyError(format!("module #{} still has connections", id.0)));
            }
        }
        let mut nodes = self.nodes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match nodes.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            },
            _ => Err(CastflowError::TopologyError(format!("no module #{}", id.0))),
        }
    }

    fn live_nodes(&self) -> Vec<Arc<PipelineNode>> {
        let nodes = self.nodes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        nodes.iter().flatten().cloned().collect()
    }

    /// Transition the graph from built to running: classify sinks and give
    /// every active module its driving task.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CastflowError::TopologyError("pipeline already started".to_string()));
        }

        let nodes = self.live_nodes();
        let mut sink_count = 0usize;
        for node in &nodes {
            if node.classify().await {
                sink_count += 1;
            }
        }
        if !nodes.is_empty() && sink_count == 0 {
            return Err(CastflowError::TopologyError(
                "no sink found: check the topology of your graph".to_string(),
            ));
        }
        self.completion.set_sink_count(sink_count);
        tracing::info!(sinks = sink_count, modules = nodes.len(), "pipeline started");

        for node in nodes {
            if node.host.is_active() {
                tokio::spawn(async move { node.run_source().await });
            }
        }
        Ok(())
    }

    /// Resolve when every source's end-of-stream marker has reached every
    /// sink. Returns the first error recorded by any module.
    pub async fn wait_for_completion(&self) -> Result<()> {
        loop {
            let mut wait = std::pin::pin!(self.completion.notify.notified());
            wait.as_mut().enable();
            if self.completion.remaining() == 0 {
                break;
            }
            wait.await;
        }
        match self.completion.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ask every source to stop at the next opportunity.
    pub fn exit_sync(&self) {
        tracing::warn!("pipeline: asked to exit now");
        for node in self.live_nodes() {
            node.host.request_stop();
        }
    }

    /// Graphviz description of the graph.
    pub fn dump(&self) -> String {
        let mut out = String::from("digraph {\n\trankdir = \"LR\";\n");
        {
            let nodes = self.nodes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for node in nodes.iter().flatten() {
                out.push_str(&format!("\t\"{}\";\n", node.name));
            }
            let edges = self.edges.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for edge in edges.iter() {
                let src = nodes.get(edge.src.0).and_then(|n| n.as_ref());
                let dst = nodes.get(edge.dst.0).and_then(|n| n.as_ref());
                if let (Some(src), Some(dst)) = (src, dst) {
                    let style = if edge.is_async { " [style=dashed]" } else { "" };
                    out.push_str(&format!("\t\"{}\" -> \"{}\"{style};\n", src.name, dst.name));
                }
            }
        }
        out.push_str("}\n");
        out
    }
}
