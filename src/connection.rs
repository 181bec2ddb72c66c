//! Server side of one RPC connection
//!
//! A [`ServerConnection`] is the completion handler its cluster routes to.
//! Receive completions become [`ServerEvent`]s for the service; send
//! completions return send slots.

use crate::cluster::CompletionHandler;
use crate::group::ServerGroup;
use crate::resource::{ConnectionResources, SlotLayout};
use crate::service::{RpcMessage, RpcService, ServerEvent};
use crate::verbs::{CmId, CompletionStatus, DeviceKey, QueuePair, RegisteredMemory, WcOpcode, WorkCompletion};
use crate::{RpcError, RpcResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Cluster assigned, nothing allocated yet
    Created,
    /// Queue pair and buffers in place, receives posted
    Connected,
    /// Announced to the service
    Open,
    /// Torn down
    Closed,
}

/// Per-connection counters
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub requests: u64,
    pub responses: u64,
    pub send_completions: u64,
    pub completion_errors: u64,
}

struct AttachedBuffers {
    resources: ConnectionResources,
    free_send_slots: Vec<usize>,
}

/// One accepted connection
pub struct ServerConnection<S: RpcService> {
    cm_id: Arc<CmId>,
    cluster_id: usize,
    group: Weak<ServerGroup<S>>,
    self_ref: Weak<Self>,
    qp: RwLock<Option<Arc<QueuePair>>>,
    buffers: Mutex<Option<AttachedBuffers>>,
    state: RwLock<ConnectionState>,
    created_at: DateTime<Utc>,
    requests: AtomicU64,
    responses: AtomicU64,
    send_completions: AtomicU64,
    completion_errors: AtomicU64,
}

impl<S: RpcService> ServerConnection<S> {
    pub(crate) fn new(group: Weak<ServerGroup<S>>, cm_id: Arc<CmId>, cluster_id: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            cm_id,
            cluster_id,
            group,
            self_ref: self_ref.clone(),
            qp: RwLock::new(None),
            buffers: Mutex::new(None),
            state: RwLock::new(ConnectionState::Created),
            created_at: Utc::now(),
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            send_completions: AtomicU64::new(0),
            completion_errors: AtomicU64::new(0),
        })
    }

    /// Connection id, shared with its connection-manager id
    pub fn id(&self) -> Uuid {
        self.cm_id.id()
    }

    pub fn cluster_id(&self) -> usize {
        self.cluster_id
    }

    pub fn cm_id(&self) -> &Arc<CmId> {
        &self.cm_id
    }

    pub fn device_key(&self) -> Option<DeviceKey> {
        self.cm_id.verbs().map(|device| device.key())
    }

    pub fn qp(&self) -> Option<Arc<QueuePair>> {
        self.qp.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn has_resources(&self) -> bool {
        self.buffers.lock().is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            send_completions: self.send_completions.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Move to `Closed`, returning the previous state
    pub(crate) fn mark_closed(&self) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), ConnectionState::Closed)
    }

    pub(crate) fn set_qp(&self, qp: Arc<QueuePair>) {
        *self.qp.write() = Some(qp);
    }

    pub(crate) fn take_qp(&self) -> Option<Arc<QueuePair>> {
        self.qp.write().take()
    }

    /// Attach a slab and post every receive slot on the queue pair.
    ///
    /// On failure the slab is handed back untouched by the connection.
    pub(crate) fn attach_resources(
        &self,
        resources: ConnectionResources,
    ) -> Result<(), (RpcError, ConnectionResources)> {
        let Some(qp) = self.qp() else {
            return Err((RpcError::ConnectionClosed { connection: self.id().to_string() }, resources));
        };
        let layout = resources.layout();
        for slot in 0..layout.recv_slots {
            let posted = qp.post_recv(
                slot as u64,
                resources.memory(),
                layout.recv_offset(slot),
                layout.slot_size,
            );
            if let Err(e) = posted {
                return Err((e, resources));
            }
        }
        debug!(
            "Connection {} posted {} receive(s) on qp {}",
            self.id(),
            layout.recv_slots,
            qp.qp_num()
        );
        *self.buffers.lock() = Some(AttachedBuffers {
            free_send_slots: (0..layout.send_slots).rev().collect(),
            resources,
        });
        Ok(())
    }

    pub(crate) fn detach_resources(&self) -> Option<ConnectionResources> {
        self.buffers.lock().take().map(|buffers| buffers.resources)
    }

    fn memory(&self) -> RpcResult<(Arc<RegisteredMemory>, SlotLayout)> {
        self.buffers
            .lock()
            .as_ref()
            .map(|b| (Arc::clone(b.resources.memory()), b.resources.layout()))
            .ok_or_else(|| RpcError::ConnectionClosed {
                connection: self.id().to_string(),
            })
    }

    fn take_send_slot(&self) -> RpcResult<usize> {
        let mut buffers = self.buffers.lock();
        let buffers = buffers.as_mut().ok_or_else(|| RpcError::ConnectionClosed {
            connection: self.id().to_string(),
        })?;
        buffers.free_send_slots.pop().ok_or_else(|| {
            RpcError::resource_exhausted(format!("send slots of connection {}", self.id()))
        })
    }

    fn free_send_slot(&self, slot: usize) {
        if let Some(buffers) = self.buffers.lock().as_mut() {
            if slot < buffers.resources.layout().send_slots && !buffers.free_send_slots.contains(&slot) {
                buffers.free_send_slots.push(slot);
            }
        }
    }

    /// Serialize `response` into a free send slot and post it with `ticket`
    /// as immediate data.
    pub fn send_response(&self, ticket: u32, response: &S::Response) -> RpcResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(RpcError::ConnectionClosed {
                connection: self.id().to_string(),
            });
        }
        let qp = self.qp().ok_or_else(|| RpcError::ConnectionClosed {
            connection: self.id().to_string(),
        })?;
        let (memory, layout) = self.memory()?;
        let slot = self.take_send_slot()?;

        let posted = self.post_response(&qp, &memory, layout, slot, ticket, response);
        if posted.is_err() {
            self.free_send_slot(slot);
        } else {
            self.responses.fetch_add(1, Ordering::Relaxed);
        }
        posted
    }

    fn post_response(
        &self,
        qp: &QueuePair,
        memory: &RegisteredMemory,
        layout: SlotLayout,
        slot: usize,
        ticket: u32,
        response: &S::Response,
    ) -> RpcResult<()> {
        if response.size() > layout.slot_size {
            return Err(RpcError::message(format!(
                "response of {} bytes exceeds {} byte buffer",
                response.size(),
                layout.slot_size
            )));
        }
        let offset = layout.send_offset(slot);
        let len = memory.with_window(offset, layout.slot_size, |buf| response.write(buf))?;
        qp.post_send(slot as u64, memory, offset, len, Some(ticket))
    }

    fn handle_request(&self, wc: &WorkCompletion) -> RpcResult<()> {
        let group = self.group.upgrade().ok_or(RpcError::GroupClosed)?;
        let connection = self.self_ref.upgrade().ok_or_else(|| RpcError::ConnectionClosed {
            connection: self.id().to_string(),
        })?;
        let (memory, layout) = self.memory()?;

        let slot = wc.wr_id as usize;
        let offset = layout.recv_offset(slot);
        let payload = memory.read(offset, wc.byte_len as usize)?;
        self.repost_recv(&memory, layout, slot);

        let mut request = group.create_request();
        request.update(&payload)?;
        let response = group.create_response();
        self.requests.fetch_add(1, Ordering::Relaxed);

        let ticket = wc.imm_data.unwrap_or_default();
        group.dispatch_event(ServerEvent::new(connection, ticket, request, response))
    }

    fn repost_recv(&self, memory: &Arc<RegisteredMemory>, layout: SlotLayout, slot: usize) {
        let Some(qp) = self.qp() else {
            return;
        };
        if let Err(e) = qp.post_recv(slot as u64, memory, layout.recv_offset(slot), layout.slot_size) {
            debug!("Connection {} could not repost slot {}: {}", self.id(), slot, e);
        }
    }
}

impl<S: RpcService> CompletionHandler for ServerConnection<S> {
    fn handle_completion(&self, wc: &WorkCompletion) {
        match (wc.status, wc.opcode) {
            (CompletionStatus::Success, WcOpcode::Recv) => {
                if let Err(e) = self.handle_request(wc) {
                    self.completion_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Connection {} failed to process request: {}", self.id(), e);
                }
            }
            (CompletionStatus::Success, WcOpcode::Send) => {
                self.send_completions.fetch_add(1, Ordering::Relaxed);
                self.free_send_slot(wc.wr_id as usize);
            }
            (CompletionStatus::Success, opcode) => {
                debug!("Connection {} ignoring {:?} completion", self.id(), opcode);
            }
            (CompletionStatus::WrFlushError, opcode) => {
                debug!(
                    "Connection {} flushed {:?} wr {} on qp {}",
                    self.id(),
                    opcode,
                    wc.wr_id,
                    wc.qp_num
                );
            }
            (status, opcode) => {
                self.completion_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection {} got {:?} for {:?} wr {} on qp {}",
                    self.id(),
                    status,
                    opcode,
                    wc.wr_id,
                    wc.qp_num
                );
                match opcode {
                    WcOpcode::Send => self.free_send_slot(wc.wr_id as usize),
                    WcOpcode::Recv => {
                        if let Ok((memory, layout)) = self.memory() {
                            self.repost_recv(&memory, layout, wc.wr_id as usize);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

impl<S: RpcService> std::fmt::Debug for ServerConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id())
            .field("cluster_id", &self.cluster_id)
            .field("qp", &self.qp().map(|qp| qp.qp_num()))
            .field("state", &self.state())
            .field("created_at", &self.created_at.to_rfc3339())
            .finish()
    }
}
