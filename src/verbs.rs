//! Verbs transport capability
//!
//! Device contexts, protection domains, completion queues, queue pairs,
//! registered memory and connection-manager ids. The only backend today is
//! the in-process software device, which behaves like a loopback NIC: sends
//! complete locally and a peer's traffic is injected with
//! [`QueuePair::simulate_receive`].

use crate::{RpcError, RpcResult};
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies a physical device context (its command file descriptor).
pub type DeviceKey = i32;

static NEXT_CMD_FD: AtomicI32 = AtomicI32::new(100);
static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

fn next_handle() -> u32 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Work completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The message did not fit the posted receive buffer
    LocalLengthError,
    /// The work request was flushed when its queue pair went away
    WrFlushError,
}

/// Work completion opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

/// A completion queue entry
#[derive(Debug, Clone)]
pub struct WorkCompletion {
    /// Work request ID
    pub wr_id: u64,
    /// Queue pair the work request was posted on
    pub qp_num: u32,
    /// Completion status
    pub status: CompletionStatus,
    /// Operation type
    pub opcode: WcOpcode,
    /// Number of bytes transferred
    pub byte_len: u32,
    /// Immediate data (if any)
    pub imm_data: Option<u32>,
}

/// Registered memory region keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Local virtual address
    pub addr: u64,
    /// Local key for local operations
    pub lkey: u32,
    /// Remote key for RDMA operations
    pub rkey: u32,
    /// Size of the memory region
    pub size: usize,
    /// Device the region is registered with
    pub device_key: DeviceKey,
}

/// Device attributes
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// Largest completion queue the device supports
    pub max_cqe: usize,
}

#[derive(Debug)]
enum DeviceImpl {
    Soft(SoftDevice),
}

/// Software device state
#[derive(Debug)]
struct SoftDevice {
    info: DeviceInfo,
    regions: RwLock<Vec<MemoryRegion>>,
    next_qp_num: AtomicU32,
    next_key: AtomicU32,
    live_cqs: AtomicUsize,
    registration_latency: RwLock<Duration>,
    fail_registration: AtomicBool,
}

/// Handle to an opened device
#[derive(Debug)]
pub struct DeviceContext {
    cmd_fd: DeviceKey,
    pd: OnceLock<Arc<ProtectionDomain>>,
    inner: DeviceImpl,
}

impl DeviceContext {
    /// Open a device by name
    pub fn open(name: &str) -> RpcResult<Arc<Self>> {
        let cmd_fd = NEXT_CMD_FD.fetch_add(1, Ordering::Relaxed);
        warn!("Using software verbs device {} (cmd_fd={})", name, cmd_fd);

        let info = DeviceInfo {
            name: name.to_string(),
            max_cqe: 4_194_303,
        };

        Ok(Arc::new(Self {
            cmd_fd,
            pd: OnceLock::new(),
            inner: DeviceImpl::Soft(SoftDevice {
                info,
                regions: RwLock::new(Vec::new()),
                next_qp_num: AtomicU32::new(0x100),
                next_key: AtomicU32::new(0x1000),
                live_cqs: AtomicUsize::new(0),
                registration_latency: RwLock::new(Duration::ZERO),
                fail_registration: AtomicBool::new(false),
            }),
        }))
    }

    /// Key identifying this physical device
    pub fn key(&self) -> DeviceKey {
        self.cmd_fd
    }

    pub fn info(&self) -> &DeviceInfo {
        match &self.inner {
            DeviceImpl::Soft(dev) => &dev.info,
        }
    }

    /// The device's protection domain, allocated on first use.
    ///
    /// All connections on a device share it, so registered memory can move
    /// between them.
    pub fn pd(self: &Arc<Self>) -> Arc<ProtectionDomain> {
        let pd = self.pd.get_or_init(|| {
            Arc::new(ProtectionDomain {
                handle: next_handle(),
                device_key: self.cmd_fd,
                device: Arc::downgrade(self),
            })
        });
        Arc::clone(pd)
    }

    /// Create a completion queue, optionally with a completion channel for
    /// blocking waits
    pub fn create_cq(&self, capacity: usize, with_channel: bool) -> RpcResult<Arc<CompletionQueue>> {
        let max_cqe = self.info().max_cqe;
        if capacity == 0 || capacity > max_cqe {
            return Err(RpcError::resource_exhausted(format!(
                "cq capacity {capacity} outside 1..={max_cqe}"
            )));
        }
        let cq = CompletionQueue {
            handle: next_handle(),
            device_key: self.cmd_fd,
            capacity,
            with_channel,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            attached_qps: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        };
        match &self.inner {
            DeviceImpl::Soft(dev) => {
                dev.live_cqs.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(
            "Created cq {} on device {} capacity={} channel={}",
            cq.handle, self.cmd_fd, capacity, with_channel
        );
        Ok(Arc::new(cq))
    }

    /// Destroy a completion queue. Fails while queue pairs still use it.
    pub fn destroy_cq(&self, cq: &CompletionQueue) -> RpcResult<()> {
        let attached = cq.attached_qps.load(Ordering::Acquire);
        if attached > 0 {
            return Err(RpcError::ResourceBusy {
                reason: format!("cq {} still referenced by {} queue pair(s)", cq.handle, attached),
            });
        }
        if cq.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        cq.entries.lock().clear();
        cq.ready.notify_all();
        match &self.inner {
            DeviceImpl::Soft(dev) => {
                dev.live_cqs.fetch_sub(1, Ordering::Relaxed);
            }
        }
        debug!("Destroyed cq {} on device {}", cq.handle, self.cmd_fd);
        Ok(())
    }

    /// Number of completion queues created and not yet destroyed
    pub fn live_cq_count(&self) -> usize {
        match &self.inner {
            DeviceImpl::Soft(dev) => dev.live_cqs.load(Ordering::Relaxed),
        }
    }

    /// Number of registered memory regions
    pub fn registered_region_count(&self) -> usize {
        match &self.inner {
            DeviceImpl::Soft(dev) => dev.regions.read().len(),
        }
    }

    /// Delay applied to every memory registration on the software device
    pub fn set_registration_latency(&self, latency: Duration) {
        match &self.inner {
            DeviceImpl::Soft(dev) => *dev.registration_latency.write() = latency,
        }
    }

    /// Make memory registration fail on the software device
    pub fn set_registration_failure(&self, fail: bool) {
        match &self.inner {
            DeviceImpl::Soft(dev) => dev.fail_registration.store(fail, Ordering::Relaxed),
        }
    }

    fn next_qp_num(&self) -> u32 {
        match &self.inner {
            DeviceImpl::Soft(dev) => dev.next_qp_num.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn register(&self, len: usize) -> RpcResult<RegisteredMemory> {
        match &self.inner {
            DeviceImpl::Soft(dev) => {
                let latency = *dev.registration_latency.read();
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                if dev.fail_registration.load(Ordering::Relaxed) {
                    return Err(RpcError::memory_reg_failed(format!(
                        "device {} refused registration of {} bytes",
                        self.cmd_fd, len
                    )));
                }
                let map = MmapMut::map_anon(len)
                    .map_err(|e| RpcError::memory_reg_failed(format!("mmap failed: {}", e)))?;
                let key = dev.next_key.fetch_add(1, Ordering::Relaxed);
                let mr = MemoryRegion {
                    addr: map.as_ptr() as u64,
                    lkey: key,
                    rkey: key | 0x8000_0000,
                    size: len,
                    device_key: self.cmd_fd,
                };
                dev.regions.write().push(mr.clone());
                debug!("Registered memory addr=0x{:x} size={} lkey=0x{:x}", mr.addr, len, mr.lkey);
                Ok(RegisteredMemory {
                    mr,
                    map: Mutex::new(map),
                })
            }
        }
    }

    fn deregister(&self, mr: &MemoryRegion) {
        match &self.inner {
            DeviceImpl::Soft(dev) => {
                dev.regions.write().retain(|r| r.lkey != mr.lkey);
                debug!("Deregistered memory lkey=0x{:x}", mr.lkey);
            }
        }
    }
}

/// Completion queue with an optional completion channel
#[derive(Debug)]
pub struct CompletionQueue {
    handle: u32,
    device_key: DeviceKey,
    capacity: usize,
    with_channel: bool,
    entries: Mutex<VecDeque<WorkCompletion>>,
    ready: Condvar,
    attached_qps: AtomicUsize,
    destroyed: AtomicBool,
}

impl CompletionQueue {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device_key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Queue pairs created against this queue and not yet destroyed
    pub fn attached_qps(&self) -> usize {
        self.attached_qps.load(Ordering::Acquire)
    }

    /// Append a completion; fails when the queue is full or destroyed.
    pub fn push(&self, wc: WorkCompletion) -> RpcResult<()> {
        if self.is_destroyed() {
            return Err(RpcError::internal(format!("cq {} destroyed", self.handle)));
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(RpcError::CqOverrun {
                cq_handle: self.handle,
                capacity: self.capacity,
            });
        }
        entries.push_back(wc);
        drop(entries);
        self.ready.notify_one();
        Ok(())
    }

    /// Remove up to `max` completions in arrival order
    pub fn poll(&self, max: usize) -> Vec<WorkCompletion> {
        let mut entries = self.entries.lock();
        let available = entries.len().min(max);
        entries.drain(..available).collect()
    }

    /// Wait on the completion channel until an entry is available or the
    /// timeout elapses. Returns whether entries are available.
    ///
    /// Without a channel this only reports the current state.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut entries = self.entries.lock();
        if entries.is_empty() && self.with_channel && !self.is_destroyed() {
            let _ = self.ready.wait_for(&mut entries, timeout);
        }
        !entries.is_empty()
    }

    /// Wake every waiter on the completion channel
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    fn attach(&self) {
        self.attached_qps.fetch_add(1, Ordering::AcqRel);
    }

    fn detach(&self) {
        self.attached_qps.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Protection domain
#[derive(Debug)]
pub struct ProtectionDomain {
    handle: u32,
    device_key: DeviceKey,
    device: Weak<DeviceContext>,
}

impl ProtectionDomain {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device_key
    }

    /// Allocate and register `len` bytes of page-aligned memory
    pub fn register_memory(&self, len: usize) -> RpcResult<Arc<RegisteredMemory>> {
        let device = self.device.upgrade().ok_or_else(|| {
            RpcError::memory_reg_failed(format!("device {} closed", self.device_key))
        })?;
        device.register(len).map(Arc::new)
    }

    /// Deregister a memory region; the mapping is released with the last reference
    pub fn deregister_memory(&self, memory: &RegisteredMemory) {
        if let Some(device) = self.device.upgrade() {
            device.deregister(&memory.mr);
        }
    }
}

/// Registered memory backed by an anonymous mapping
#[derive(Debug)]
pub struct RegisteredMemory {
    mr: MemoryRegion,
    map: Mutex<MmapMut>,
}

impl RegisteredMemory {
    pub fn mr(&self) -> &MemoryRegion {
        &self.mr
    }

    pub fn len(&self) -> usize {
        self.mr.size
    }

    pub fn is_empty(&self) -> bool {
        self.mr.size == 0
    }

    fn check_range(&self, offset: usize, len: usize) -> RpcResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mr.size => Ok(()),
            _ => Err(RpcError::internal(format!(
                "range {}+{} outside region of {} bytes",
                offset, len, self.mr.size
            ))),
        }
    }

    /// Copy `data` into the region at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> RpcResult<()> {
        self.check_range(offset, data.len())?;
        self.map.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the region at `offset`
    pub fn read(&self, offset: usize, len: usize) -> RpcResult<Vec<u8>> {
        self.check_range(offset, len)?;
        Ok(self.map.lock()[offset..offset + len].to_vec())
    }

    /// Run `f` over a mutable window of the region
    pub fn with_window<T>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> RpcResult<T>,
    ) -> RpcResult<T> {
        self.check_range(offset, len)?;
        let mut map = self.map.lock();
        f(&mut map[offset..offset + len])
    }

    /// Zero the whole region
    pub fn clear(&self) {
        self.map.lock().fill(0);
    }
}

/// Queue pair creation attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_inline_data: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

#[derive(Debug)]
struct RecvWr {
    wr_id: u64,
    memory: Arc<RegisteredMemory>,
    offset: usize,
    len: usize,
}

/// Reliable-connected queue pair
#[derive(Debug)]
pub struct QueuePair {
    qp_num: u32,
    cq: Arc<CompletionQueue>,
    attr: QpInitAttr,
    posted_recvs: Mutex<VecDeque<RecvWr>>,
    sent: Mutex<Vec<(Option<u32>, Vec<u8>)>>,
    inline_sends: AtomicUsize,
    destroyed: AtomicBool,
}

impl QueuePair {
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    pub fn attr(&self) -> &QpInitAttr {
        &self.attr
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn posted_recv_count(&self) -> usize {
        self.posted_recvs.lock().len()
    }

    /// Sends posted inline so far
    pub fn inline_send_count(&self) -> usize {
        self.inline_sends.load(Ordering::Relaxed)
    }

    fn post_failed(&self, reason: impl Into<String>) -> RpcError {
        RpcError::PostFailed {
            qp_num: self.qp_num,
            reason: reason.into(),
        }
    }

    /// Post a receive buffer
    pub fn post_recv(
        &self,
        wr_id: u64,
        memory: &Arc<RegisteredMemory>,
        offset: usize,
        len: usize,
    ) -> RpcResult<()> {
        if self.is_destroyed() {
            return Err(self.post_failed("queue pair destroyed"));
        }
        memory.check_range(offset, len)?;
        let mut posted = self.posted_recvs.lock();
        if posted.len() >= self.attr.max_recv_wr as usize {
            return Err(self.post_failed("receive queue full"));
        }
        posted.push_back(RecvWr {
            wr_id,
            memory: Arc::clone(memory),
            offset,
            len,
        });
        Ok(())
    }

    /// Post a send of `len` bytes at `offset`, completing locally
    pub fn post_send(
        &self,
        wr_id: u64,
        memory: &RegisteredMemory,
        offset: usize,
        len: usize,
        imm_data: Option<u32>,
    ) -> RpcResult<()> {
        if self.is_destroyed() {
            return Err(self.post_failed("queue pair destroyed"));
        }
        let payload = memory.read(offset, len)?;
        if len <= self.attr.max_inline_data as usize {
            self.inline_sends.fetch_add(1, Ordering::Relaxed);
        }
        self.sent.lock().push((imm_data, payload));
        self.cq.push(WorkCompletion {
            wr_id,
            qp_num: self.qp_num,
            status: CompletionStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: len as u32,
            imm_data,
        })
    }

    /// Deliver a peer message into the next posted receive
    pub fn simulate_receive(&self, payload: &[u8], imm_data: Option<u32>) -> RpcResult<()> {
        if self.is_destroyed() {
            return Err(self.post_failed("queue pair destroyed"));
        }
        let wr = self
            .posted_recvs
            .lock()
            .pop_front()
            .ok_or_else(|| self.post_failed("receiver not ready"))?;
        if payload.len() > wr.len {
            let status = CompletionStatus::LocalLengthError;
            return self.cq.push(WorkCompletion {
                wr_id: wr.wr_id,
                qp_num: self.qp_num,
                status,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                imm_data,
            });
        }
        wr.memory.write(wr.offset, payload)?;
        self.cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            qp_num: self.qp_num,
            status: CompletionStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: payload.len() as u32,
            imm_data,
        })
    }

    /// Payloads sent so far, with their immediate data
    pub fn take_sent(&self) -> Vec<(Option<u32>, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Move the queue pair to the error state and release it.
    ///
    /// Posted receives are flushed onto the completion queue.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let flushed: Vec<RecvWr> = self.posted_recvs.lock().drain(..).collect();
        for wr in flushed {
            let flush = WorkCompletion {
                wr_id: wr.wr_id,
                qp_num: self.qp_num,
                status: CompletionStatus::WrFlushError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                imm_data: None,
            };
            if let Err(e) = self.cq.push(flush) {
                debug!("Dropped flush completion for qp {}: {}", self.qp_num, e);
            }
        }
        self.cq.detach();
        self.cq.wake();
        debug!("Destroyed qp {}", self.qp_num);
    }
}

/// Connection-manager id for one incoming connection
#[derive(Debug)]
pub struct CmId {
    id: Uuid,
    verbs: RwLock<Option<Arc<DeviceContext>>>,
    pd: RwLock<Option<Arc<ProtectionDomain>>>,
    rejected: AtomicBool,
}

impl CmId {
    /// Create an id not yet bound to a device
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            verbs: RwLock::new(None),
            pd: RwLock::new(None),
            rejected: AtomicBool::new(false),
        })
    }

    /// Create an id already bound to `device`
    pub fn bound_to(device: &Arc<DeviceContext>) -> Arc<Self> {
        let cm_id = Self::new();
        cm_id.bind(device);
        cm_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bind the id to the device the connection arrived on
    pub fn bind(&self, device: &Arc<DeviceContext>) {
        *self.pd.write() = Some(device.pd());
        *self.verbs.write() = Some(Arc::clone(device));
    }

    /// Device context, if the connection manager bound one
    pub fn verbs(&self) -> Option<Arc<DeviceContext>> {
        self.verbs.read().clone()
    }

    pub fn pd(&self) -> Option<Arc<ProtectionDomain>> {
        self.pd.read().clone()
    }

    /// Create a queue pair on this id's device using `cq` for both directions
    pub fn create_qp(&self, cq: &Arc<CompletionQueue>, attr: QpInitAttr) -> RpcResult<Arc<QueuePair>> {
        let device = self.verbs().ok_or_else(|| RpcError::QpCreationFailed {
            reason: format!("cm id {} has no device context", self.id),
        })?;
        if self.pd().is_none() {
            return Err(RpcError::QpCreationFailed {
                reason: format!("cm id {} has no protection domain", self.id),
            });
        }
        if cq.device_key() != device.key() {
            return Err(RpcError::QpCreationFailed {
                reason: format!(
                    "cq {} belongs to device {}, not {}",
                    cq.handle(),
                    cq.device_key(),
                    device.key()
                ),
            });
        }
        if cq.is_destroyed() {
            return Err(RpcError::QpCreationFailed {
                reason: format!("cq {} destroyed", cq.handle()),
            });
        }
        cq.attach();
        let qp = QueuePair {
            qp_num: device.next_qp_num(),
            cq: Arc::clone(cq),
            attr,
            posted_recvs: Mutex::new(VecDeque::with_capacity(attr.max_recv_wr as usize)),
            sent: Mutex::new(Vec::new()),
            inline_sends: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        };
        debug!("Created qp {} on cq {}", qp.qp_num, cq.handle());
        Ok(Arc::new(qp))
    }

    /// Reject the connection request
    pub fn reject(&self) {
        if !self.rejected.swap(true, Ordering::AcqRel) {
            info!("Rejected connection request {}", self.id);
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
pub(crate) fn test_qp_attr() -> QpInitAttr {
    QpInitAttr {
        max_send_wr: 4,
        max_recv_wr: 4,
        max_inline_data: 16,
        max_send_sge: 1,
        max_recv_sge: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devices_have_distinct_keys() {
        let a = DeviceContext::open("mlx5_0").unwrap();
        let b = DeviceContext::open("mlx5_1").unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(a.info().name, "mlx5_0");
    }

    #[test]
    fn test_cq_overrun_and_order() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let cq = dev.create_cq(2, false).unwrap();
        for wr_id in 0..2 {
            cq.push(WorkCompletion {
                wr_id,
                qp_num: 1,
                status: CompletionStatus::Success,
                opcode: WcOpcode::Send,
                byte_len: 0,
                imm_data: None,
            })
            .unwrap();
        }
        let overflow = cq.push(WorkCompletion {
            wr_id: 2,
            qp_num: 1,
            status: CompletionStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            imm_data: None,
        });
        assert!(matches!(overflow, Err(RpcError::CqOverrun { .. })));

        let polled: Vec<u64> = cq.poll(8).into_iter().map(|wc| wc.wr_id).collect();
        assert_eq!(polled, vec![0, 1]);
    }

    #[test]
    fn test_cq_destroy_requires_detached_qps() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let cq = dev.create_cq(16, true).unwrap();
        let cm_id = CmId::bound_to(&dev);
        let qp = cm_id.create_qp(&cq, test_qp_attr()).unwrap();

        assert!(matches!(dev.destroy_cq(&cq), Err(RpcError::ResourceBusy { .. })));
        qp.destroy();
        dev.destroy_cq(&cq).unwrap();
        assert_eq!(dev.live_cq_count(), 0);
    }

    #[test]
    fn test_receive_send_and_flush() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let cq = dev.create_cq(16, false).unwrap();
        let cm_id = CmId::bound_to(&dev);
        let qp = cm_id.create_qp(&cq, test_qp_attr()).unwrap();
        let memory = cm_id.pd().unwrap().register_memory(128).unwrap();

        qp.post_recv(7, &memory, 0, 64).unwrap();
        qp.post_recv(8, &memory, 64, 64).unwrap();
        qp.simulate_receive(b"hello", Some(42)).unwrap();

        let wc = cq.poll(1).remove(0);
        assert_eq!(wc.wr_id, 7);
        assert_eq!(wc.opcode, WcOpcode::Recv);
        assert_eq!(wc.imm_data, Some(42));
        assert_eq!(memory.read(0, 5).unwrap(), b"hello");

        qp.post_send(9, &memory, 0, 5, Some(42)).unwrap();
        assert_eq!(qp.inline_send_count(), 1);
        assert_eq!(qp.take_sent(), vec![(Some(42), b"hello".to_vec())]);

        qp.destroy();
        let rest = cq.poll(8);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].opcode, WcOpcode::Send);
        assert_eq!(rest[1].status, CompletionStatus::WrFlushError);
        assert_eq!(rest[1].wr_id, 8);
    }

    #[test]
    fn test_oversized_receive_reports_length_error() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let cq = dev.create_cq(4, false).unwrap();
        let cm_id = CmId::bound_to(&dev);
        let qp = cm_id.create_qp(&cq, test_qp_attr()).unwrap();
        let memory = cm_id.pd().unwrap().register_memory(64).unwrap();

        qp.post_recv(3, &memory, 0, 4).unwrap();
        qp.simulate_receive(b"too long", None).unwrap();

        let wc = cq.poll(1).remove(0);
        assert_eq!(wc.wr_id, 3);
        assert_eq!(wc.status, CompletionStatus::LocalLengthError);
        assert_eq!(wc.byte_len, 0);
    }

    #[test]
    fn test_cq_capacity_bounded_by_device() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let max_cqe = dev.info().max_cqe;
        assert!(dev.create_cq(0, false).is_err());
        assert!(dev.create_cq(max_cqe + 1, false).is_err());
        assert_eq!(dev.live_cq_count(), 0);
    }

    #[test]
    fn test_qp_requires_bound_context() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let cq = dev.create_cq(4, false).unwrap();
        let unbound = CmId::new();
        assert!(matches!(
            unbound.create_qp(&cq, test_qp_attr()),
            Err(RpcError::QpCreationFailed { .. })
        ));

        let other = DeviceContext::open("mlx5_1").unwrap();
        let foreign = CmId::bound_to(&other);
        assert!(foreign.create_qp(&cq, test_qp_attr()).is_err());
    }

    #[test]
    fn test_registration_failure_injection() {
        let dev = DeviceContext::open("mlx5_0").unwrap();
        let pd = dev.pd();
        assert_eq!(pd.handle(), dev.pd().handle());
        dev.set_registration_failure(true);
        assert!(matches!(
            pd.register_memory(4096),
            Err(RpcError::MemoryRegFailed { .. })
        ));
        dev.set_registration_failure(false);
        let memory = pd.register_memory(4096).unwrap();
        assert_eq!(dev.registered_region_count(), 1);
        pd.deregister_memory(&memory);
        assert_eq!(dev.registered_region_count(), 0);
    }
}
