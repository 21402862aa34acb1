// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ports and signals: the connection points between modules.
//!
//! An [`OutputPort`] owns a [`Signal`] (ordered multicast to every connected
//! input) and a [`BufferPool`]. An [`InputPort`] owns a FIFO of packets and
//! the stream metadata, guarded by one mutex. Dispatch is synchronous on the
//! emitter's task: `post` returns only after every connected input has
//! queued the packet and run its dispatcher.
//!
//! End of stream travels on the same wire as `None`; it never enters an
//! input queue — the dispatcher is told instead, so the termination protocol
//! stays in the pipeline layer.

use crate::data::Packet;
use crate::error::{CastflowError, Result};
use crate::metadata::Metadata;
use crate::pool::{BufferPool, PooledBuffer};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Handle for severing one output→input subscription.
pub type SubscriptionId = u64;

/// What a connection reports to the receiving side.
pub enum PortEvent {
    /// A packet has been queued on the input; the receiver should process.
    Data,
    /// The upstream stream ended.
    Eos,
    /// Delivering a packet failed (fatal metadata change).
    Error(CastflowError),
}

/// Receiver-side continuation of a connection. Built by the pipeline (or a
/// test harness) around "run this module's `process` now".
pub type Dispatcher = Arc<dyn Fn(PortEvent) -> BoxFuture<'static, ()> + Send + Sync>;

type Subscriber = Arc<dyn Fn(Option<Packet>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Ordered multicast. Subscribers are invoked in subscription order, on the
/// emitting task, one after the other.
#[derive(Default)]
pub struct Signal {
    subs: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sub: Subscriber) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subs = self.subs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.push((id, sub));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn num_connections(&self) -> usize {
        self.subs.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Deliver `evt` to every subscriber, in order. The subscriber list is
    /// snapshotted under the read lock, then invoked without it.
    pub async fn emit(&self, evt: Option<Packet>) {
        let snapshot: Vec<Subscriber> = {
            let subs = self.subs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.iter().map(|(_, s)| s.clone()).collect()
        };
        for sub in snapshot {
            sub(evt.clone()).await;
        }
    }
}

struct InputState {
    queue: VecDeque<Packet>,
    metadata: Option<Arc<Metadata>>,
}

/// Receiving side of a connection. One FIFO plus the stream metadata, under
/// a single mutex.
pub struct InputPort {
    state: Mutex<InputState>,
    connections: AtomicUsize,
}

impl Default for InputPort {
    fn default() -> Self {
        Self::new()
    }
}

impl InputPort {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InputState { queue: VecDeque::new(), metadata: None }),
            connections: AtomicUsize::new(0),
        }
    }

    /// Queue a packet, folding any packet-carried metadata into the port.
    /// A stream-kind change is fatal.
    pub fn push(&self, pkt: Packet) -> Result<()> {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::merge_metadata(&mut st.metadata, &pkt)?;
        st.queue.push_back(pkt);
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Packet> {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.queue.len()
    }

    pub fn metadata(&self) -> Option<Arc<Metadata>> {
        let st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.metadata.clone()
    }

    pub fn set_metadata(&self, meta: Arc<Metadata>) {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.metadata = Some(meta);
    }

    /// Adopt the metadata carried by `pkt`, if any. Returns true iff the
    /// port's metadata changed by this call.
    pub fn update_metadata(&self, pkt: &Packet) -> Result<bool> {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = st.metadata.clone();
        Self::merge_metadata(&mut st.metadata, pkt)?;
        Ok(match (&before, &st.metadata) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            _ => false,
        })
    }

    fn merge_metadata(slot: &mut Option<Arc<Metadata>>, pkt: &Packet) -> Result<()> {
        let Some(carried) = pkt.metadata() else { return Ok(()) };
        match slot {
            None => *slot = Some(carried.clone()),
            Some(current) => {
                if current.kind() != carried.kind() {
                    return Err(CastflowError::IncompatibleMetadata(format!(
                        "stream kind changed at runtime: {:?} -> {:?}",
                        current.kind(),
                        carried.kind()
                    )));
                }
                if !Arc::ptr_eq(current, carried) && **current != **carried {
                    *slot = Some(carried.clone());
                }
            },
        }
        Ok(())
    }

    pub fn connect(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn disconnect(&self) -> Result<()> {
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .map(|_| ())
            .map_err(|_| CastflowError::TopologyError("disconnect on unconnected input".to_string()))
    }

    pub fn num_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Emitting side of a connection: signal + allocator + stream metadata.
pub struct OutputPort {
    signal: Signal,
    pool: BufferPool,
    metadata: Mutex<Option<Arc<Metadata>>>,
}

/// Pool capacity used when a module does not ask for a specific one.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

impl Default for OutputPort {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl OutputPort {
    pub fn new(pool_capacity: usize) -> Self {
        Self { signal: Signal::new(), pool: BufferPool::new(pool_capacity), metadata: Mutex::new(None) }
    }

    pub const fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn metadata(&self) -> Option<Arc<Metadata>> {
        self.metadata.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn set_metadata(&self, meta: Arc<Metadata>) {
        *self.metadata.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(meta);
    }

    /// Acquire a buffer from this output's pool. `None` after teardown.
    pub async fn alloc_buffer(&self, size: usize) -> Option<PooledBuffer> {
        self.pool.alloc(size).await
    }

    /// Emit a packet to every connected input, in subscription order.
    ///
    /// A packet without metadata is stamped with the output's; a packet
    /// carrying metadata refreshes the output's slot (metadata only
    /// narrows/refines over a stream's life).
    pub async fn post(&self, mut pkt: Packet) {
        {
            let mut slot = self.metadata.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match (pkt.metadata(), slot.as_ref()) {
                (None, Some(meta)) => pkt.set_metadata(meta.clone()),
                (Some(carried), _) => *slot = Some(carried.clone()),
                (None, None) => {},
            }
        }
        self.signal.emit(Some(pkt)).await;
    }

    /// Signal end of stream to every connected input.
    pub async fn post_eos(&self) {
        self.signal.emit(None).await;
    }
}

impl Drop for OutputPort {
    fn drop(&mut self) {
        // release any producer blocked on buffer acquisition
        self.pool.unblock();
    }
}

/// Wire an output to an input.
///
/// Metadata negotiation, in order:
/// 1. output has metadata, input has none → the input adopts it;
/// 2. input has metadata, output has none → back-propagated to the output;
/// 3. both present with different stream kinds → `IncompatibleMetadata`;
/// 4. both present, kinds match → both kept (data-carried metadata may
///    refine them later).
///
/// Then the input's push handler is subscribed to the output's signal; the
/// `dispatcher` runs after each delivery (or end of stream) on the
/// emitter's task.
pub fn connect_ports(output: &OutputPort, input: &Arc<InputPort>, dispatcher: Dispatcher) -> Result<SubscriptionId> {
    match (output.metadata(), input.metadata()) {
        (Some(om), None) => input.set_metadata(om),
        (None, Some(im)) => output.set_metadata(im),
        (Some(om), Some(im)) if om.kind() != im.kind() => {
            return Err(CastflowError::IncompatibleMetadata(format!(
                "cannot connect {:?} output to {:?} input",
                om.kind(),
                im.kind()
            )));
        },
        _ => {},
    }

    input.connect();

    let input = input.clone();
    let id = output.signal.subscribe(Arc::new(move |evt: Option<Packet>| {
        let input = input.clone();
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            let evt = match evt {
                Some(pkt) => match input.push(pkt) {
                    Ok(()) => PortEvent::Data,
                    Err(e) => PortEvent::Error(e),
                },
                None => PortEvent::Eos,
            };
            dispatcher(evt).await;
        })
    }));
    Ok(id)
}

/// Undo one [`connect_ports`] subscription.
pub fn disconnect_ports(output: &OutputPort, input: &InputPort, id: SubscriptionId) -> Result<()> {
    if !output.signal.unsubscribe(id) {
        return Err(CastflowError::TopologyError("no such connection".to_string()));
    }
    input.disconnect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metadata::{FileInfo, Metadata};

    fn noop_dispatcher() -> Dispatcher {
        Arc::new(|_| Box::pin(async {}))
    }

    fn segment_meta() -> Arc<Metadata> {
        Arc::new(Metadata::File(FileInfo::segment()))
    }

    fn playlist_meta() -> Arc<Metadata> {
        Arc::new(Metadata::File(FileInfo::playlist()))
    }

    #[tokio::test]
    async fn forward_metadata_on_connect() {
        let output = OutputPort::default();
        let input = Arc::new(InputPort::new());
        output.set_metadata(segment_meta());

        connect_ports(&output, &input, noop_dispatcher()).unwrap();
        assert_eq!(input.metadata().unwrap().kind(), crate::metadata::StreamKind::Segment);
        assert_eq!(input.num_connections(), 1);
    }

    #[tokio::test]
    async fn back_propagate_metadata_on_connect() {
        let output = OutputPort::default();
        let input = Arc::new(InputPort::new());
        input.set_metadata(playlist_meta());

        connect_ports(&output, &input, noop_dispatcher()).unwrap();
        assert_eq!(output.metadata().unwrap().kind(), crate::metadata::StreamKind::Playlist);
    }

    #[tokio::test]
    async fn incompatible_kinds_rejected() {
        let output = OutputPort::default();
        let input = Arc::new(InputPort::new());
        output.set_metadata(segment_meta());
        input.set_metadata(playlist_meta());

        let err = connect_ports(&output, &input, noop_dispatcher()).unwrap_err();
        assert!(matches!(err, CastflowError::IncompatibleMetadata(_)));
        assert_eq!(input.num_connections(), 0);
    }

    #[tokio::test]
    async fn both_sides_kept_when_kinds_match() {
        let output = OutputPort::default();
        let input = Arc::new(InputPort::new());
        let om = segment_meta();
        let im = segment_meta();
        output.set_metadata(om.clone());
        input.set_metadata(im.clone());

        connect_ports(&output, &input, noop_dispatcher()).unwrap();
        assert!(Arc::ptr_eq(&output.metadata().unwrap(), &om));
        assert!(Arc::ptr_eq(&input.metadata().unwrap(), &im));
    }

    #[tokio::test]
    async fn post_delivers_in_emission_order() {
        let output = OutputPort::default();
        let input = Arc::new(InputPort::new());
        connect_ports(&output, &input, noop_dispatcher()).unwrap();

        for t in [0i64, 7200, 14400] {
            let mut pkt = Packet::empty();
            pkt.set_metadata(segment_meta());
            pkt.set_media_time(t);
            output.post(pkt).await;
        }
        assert_eq!(input.queued(), 3);
        assert_eq!(input.try_pop().unwrap().media_time(), Some(0));
        assert_eq!(input.try_pop().unwrap().media_time(), Some(7200));
        assert_eq!(input.try_pop().unwrap().media_time(), Some(14400));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_input() {
        let output = OutputPort::default();
        let a = Arc::new(InputPort::new());
        let b = Arc::new(InputPort::new());
        connect_ports(&output, &a, noop_dispatcher()).unwrap();
        connect_ports(&output, &b, noop_dispatcher()).unwrap();

        output.set_metadata(segment_meta());
        output.post(Packet::empty()).await;
        assert_eq!(a.queued(), 1);
        assert_eq!(b.queued(), 1);
        // metadata was stamped on the metadata-less packet
        assert!(a.try_pop().unwrap().metadata().is_some());
    }

    #[tokio::test]
    async fn runtime_stream_kind_change_is_fatal() {
        let input = InputPort::new();
        let mut pkt = Packet::empty();
        pkt.set_metadata(segment_meta());
        input.push(pkt).unwrap();

        let mut bad = Packet::empty();
        bad.set_metadata(playlist_meta());
        assert!(input.push(bad).is_err());
    }

    #[tokio::test]
    async fn update_metadata_reports_change_once() {
        let input = InputPort::new();
        let mut pkt = Packet::empty();
        pkt.set_metadata(segment_meta());
        assert!(input.update_metadata(&pkt).unwrap());
        // same metadata value again: no change
        assert!(!input.update_metadata(&pkt).unwrap());
    }

    #[tokio::test]
    async fn disconnect_requires_existing_edge() {
        let output = OutputPort::default();
        let input = Arc::new(InputPort::new());
        let id = connect_ports(&output, &input, noop_dispatcher()).unwrap();

        disconnect_ports(&output, &input, id).unwrap();
        assert_eq!(input.num_connections(), 0);
        assert!(disconnect_ports(&output, &input, id).is_err());
    }
}
