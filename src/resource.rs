//! Registered buffer management for connections
//!
//! The [`ResourceManager`] owns one pool per affinity value. Each pool runs an
//! allocator worker pinned to its core, so memory is registered (and first
//! touched) on the core whose cluster will process the connection's traffic.
//! Callers hand a connection to the manager and await the worker's reply for
//! at most the configured timeout.
//!
//! Released slabs are cached per `(device, length)` and reused by the next
//! connection on the same device.

use crate::affinity::{affinity_for, pin_current_thread};
use crate::connection::ServerConnection;
use crate::config::ServerGroupConfig;
use crate::service::RpcService;
use crate::verbs::{DeviceKey, ProtectionDomain, RegisteredMemory};
use crate::{RpcError, RpcResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cached slabs kept per `(device, length)` key
const MAX_CACHED_PER_KEY: usize = 16;

/// Placement of receive and send slots inside a connection's slab.
///
/// Receive slots come first, then send slots, each `slot_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub recv_slots: usize,
    pub send_slots: usize,
    pub slot_size: usize,
}

impl SlotLayout {
    pub fn from_config(config: &ServerGroupConfig) -> Self {
        Self {
            recv_slots: config.recv_queue as usize,
            send_slots: config.send_queue as usize,
            slot_size: config.buffer_size,
        }
    }

    /// Bytes needed for every slot
    pub fn slab_len(&self) -> usize {
        (self.recv_slots + self.send_slots) * self.slot_size
    }

    pub fn recv_offset(&self, slot: usize) -> usize {
        slot * self.slot_size
    }

    pub fn send_offset(&self, slot: usize) -> usize {
        (self.recv_slots + slot) * self.slot_size
    }
}

/// Registered memory owned by one connection
#[derive(Debug)]
pub struct ConnectionResources {
    memory: Arc<RegisteredMemory>,
    pd: Arc<ProtectionDomain>,
    layout: SlotLayout,
    pool: usize,
}

impl ConnectionResources {
    pub fn memory(&self) -> &Arc<RegisteredMemory> {
        &self.memory
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    /// Index of the pool the slab was allocated from
    pub fn pool_index(&self) -> usize {
        self.pool
    }

    pub fn device_key(&self) -> DeviceKey {
        self.pd.device_key()
    }
}

/// Statistics for one resource pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Core the pool's worker is pinned to
    pub affinity: usize,
    /// Allocations requested
    pub total_allocations: u64,
    /// Slabs handed back
    pub total_releases: u64,
    /// Allocations served from the cache
    pub cache_hits: u64,
    /// Allocations that registered new memory
    pub cache_misses: u64,
    /// Allocations refused by budget or registration
    pub failures: u64,
    /// Slabs returned because the requester stopped waiting
    pub discarded_after_timeout: u64,
    /// Slabs currently owned by connections
    pub outstanding: usize,
    /// Bytes owned by connections
    pub bytes_in_use: usize,
    /// Bytes registered but idle in the cache
    pub bytes_cached: usize,
    /// Highest `bytes_in_use + bytes_cached` observed
    pub peak_bytes: usize,
}

struct CachedSlab {
    pd: Arc<ProtectionDomain>,
    memory: Arc<RegisteredMemory>,
}

struct PoolInner {
    cache: HashMap<(DeviceKey, usize), Vec<CachedSlab>>,
    stats: PoolStats,
}

/// Allocation state of one pool, shared between its worker and releasers
struct PoolState {
    index: usize,
    memory_limit: usize,
    inner: Mutex<PoolInner>,
}

impl PoolState {
    fn new(index: usize, affinity: usize, memory_limit: usize) -> Self {
        Self {
            index,
            memory_limit,
            inner: Mutex::new(PoolInner {
                cache: HashMap::new(),
                stats: PoolStats {
                    affinity,
                    ..Default::default()
                },
            }),
        }
    }

    fn allocate(&self, pd: &Arc<ProtectionDomain>, layout: SlotLayout) -> RpcResult<ConnectionResources> {
        let len = layout.slab_len();
        let key = (pd.device_key(), len);

        let evicted = {
            let mut inner = self.inner.lock();
            inner.stats.total_allocations += 1;

            if let Some(slab) = inner.cache.get_mut(&key).and_then(Vec::pop) {
                let stats = &mut inner.stats;
                stats.cache_hits += 1;
                stats.outstanding += 1;
                stats.bytes_cached -= len;
                stats.bytes_in_use += len;
                debug!("Reused {} byte slab for device {}", len, key.0);
                return Ok(ConnectionResources {
                    memory: slab.memory,
                    pd: slab.pd,
                    layout,
                    pool: self.index,
                });
            }

            // Idle slabs of other shapes make room before we give up.
            let mut evicted = Vec::new();
            while inner.stats.bytes_in_use + inner.stats.bytes_cached + len > self.memory_limit {
                let victim = inner
                    .cache
                    .iter_mut()
                    .find_map(|(k, slabs)| slabs.pop().map(|slab| (k.1, slab)));
                match victim {
                    Some((victim_len, slab)) => {
                        inner.stats.bytes_cached -= victim_len;
                        evicted.push(slab);
                    }
                    None => break,
                }
            }
            inner.cache.retain(|_, slabs| !slabs.is_empty());

            if inner.stats.bytes_in_use + inner.stats.bytes_cached + len > self.memory_limit {
                inner.stats.failures += 1;
                let in_use = inner.stats.bytes_in_use;
                drop(inner);
                deregister_all(evicted);
                return Err(RpcError::resource_exhausted(format!(
                    "pool {} budget: {} of {} bytes in use, {} requested",
                    self.index, in_use, self.memory_limit, len
                )));
            }
            // Reserve the bytes so concurrent releases see the commitment.
            inner.stats.bytes_in_use += len;
            evicted
        };
        deregister_all(evicted);

        match pd.register_memory(len) {
            Ok(memory) => {
                let mut inner = self.inner.lock();
                let stats = &mut inner.stats;
                stats.cache_misses += 1;
                stats.outstanding += 1;
                stats.peak_bytes = stats.peak_bytes.max(stats.bytes_in_use + stats.bytes_cached);
                debug!(
                    "Registered {} byte slab for device {} on pool {}",
                    len, key.0, self.index
                );
                Ok(ConnectionResources {
                    memory,
                    pd: Arc::clone(pd),
                    layout,
                    pool: self.index,
                })
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.stats.bytes_in_use -= len;
                inner.stats.failures += 1;
                Err(RpcError::resource_exhausted(format!(
                    "registration of {} bytes on device {}: {}",
                    len, key.0, e
                )))
            }
        }
    }

    fn release(&self, resources: ConnectionResources) {
        let len = resources.memory.len();
        resources.memory.clear();
        let key = (resources.pd.device_key(), len);

        let mut inner = self.inner.lock();
        inner.stats.total_releases += 1;
        inner.stats.outstanding = inner.stats.outstanding.saturating_sub(1);
        inner.stats.bytes_in_use = inner.stats.bytes_in_use.saturating_sub(len);

        let slabs = inner.cache.entry(key).or_default();
        if slabs.len() < MAX_CACHED_PER_KEY {
            slabs.push(CachedSlab {
                pd: resources.pd,
                memory: resources.memory,
            });
            inner.stats.bytes_cached += len;
        } else {
            drop(inner);
            resources.pd.deregister_memory(&resources.memory);
        }
    }

    /// Deregister every cached slab and report slabs still owned by connections.
    fn close(&self) -> RpcResult<()> {
        let (cached, stats) = {
            let mut inner = self.inner.lock();
            let cached: Vec<CachedSlab> = inner.cache.drain().flat_map(|(_, slabs)| slabs).collect();
            inner.stats.bytes_cached = 0;
            (cached, inner.stats.clone())
        };
        debug!("Pool {} deregistering {} cached slab(s)", self.index, cached.len());
        deregister_all(cached);

        if stats.outstanding > 0 {
            return Err(RpcError::ResourceLeak {
                affinity: stats.affinity,
                outstanding: stats.outstanding,
            });
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }
}

fn deregister_all(slabs: Vec<CachedSlab>) {
    for slab in slabs {
        slab.pd.deregister_memory(&slab.memory);
    }
}

struct AllocationJob {
    connection: Uuid,
    pd: Arc<ProtectionDomain>,
    reply: oneshot::Sender<RpcResult<ConnectionResources>>,
}

struct ResourcePool {
    state: Arc<PoolState>,
    jobs: Mutex<Option<mpsc::UnboundedSender<AllocationJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn run_pool(state: Arc<PoolState>, affinity: usize, layout: SlotLayout, mut jobs: mpsc::UnboundedReceiver<AllocationJob>) {
    pin_current_thread(affinity);
    while let Some(job) = jobs.blocking_recv() {
        let result = state.allocate(&job.pd, layout);
        if let Err(Ok(resources)) = job.reply.send(result) {
            debug!(
                "Connection {} stopped waiting, returning slab to pool {}",
                job.connection, state.index
            );
            state.inner.lock().stats.discarded_after_timeout += 1;
            state.release(resources);
        }
    }
    debug!("Resource pool {} worker exiting", state.index);
}

/// Per-affinity registered memory pools with pinned allocator workers
pub struct ResourceManager {
    pools: Vec<ResourcePool>,
    layout: SlotLayout,
    timeout: Duration,
    closed: AtomicBool,
}

impl ResourceManager {
    /// Start one pool worker per affinity value
    pub fn new(
        affinities: &[usize],
        timeout: Duration,
        layout: SlotLayout,
        pool_memory_limit: usize,
    ) -> RpcResult<Self> {
        if affinities.is_empty() {
            return Err(RpcError::invalid_config("affinity list is empty"));
        }

        let mut pools = Vec::with_capacity(affinities.len());
        for index in 0..affinities.len() {
            let affinity = affinity_for(affinities, index);
            let state = Arc::new(PoolState::new(index, affinity, pool_memory_limit));
            let (tx, rx) = mpsc::unbounded_channel();
            let worker_state = Arc::clone(&state);
            let worker = std::thread::Builder::new()
                .name(format!("resource-pool-{index}"))
                .spawn(move || run_pool(worker_state, affinity, layout, rx))?;
            pools.push(ResourcePool {
                state,
                jobs: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            });
        }

        info!(
            "🧠 Resource manager started: {} pool(s), {} bytes per connection, {} byte budget per pool",
            pools.len(),
            layout.slab_len(),
            pool_memory_limit
        );
        Ok(Self {
            pools,
            layout,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocate and attach registered buffers to `connection`.
    ///
    /// The work runs on the pool matching the connection's cluster. If the
    /// pool has not answered within the timeout this fails with
    /// [`RpcError::AllocationTimeout`] and nothing stays attached; a slab that
    /// is produced later goes back to the pool.
    pub async fn allocate_resources<S: RpcService>(&self, connection: &ServerConnection<S>) -> RpcResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ResourceManagerClosed);
        }
        let pd = connection
            .cm_id()
            .pd()
            .ok_or_else(|| RpcError::no_device_context(connection.id()))?;
        let pool = &self.pools[connection.cluster_id() % self.pools.len()];

        let (reply, mut response) = oneshot::channel();
        let job = AllocationJob {
            connection: connection.id(),
            pd,
            reply,
        };
        match pool.jobs.lock().as_ref() {
            Some(jobs) => jobs.send(job).map_err(|_| RpcError::ResourceManagerClosed)?,
            None => return Err(RpcError::ResourceManagerClosed),
        }

        let resources = match tokio::time::timeout(self.timeout, &mut response).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(RpcError::ResourceManagerClosed),
            Err(_) => {
                // Close the channel so a late slab either lands here or is
                // released by the worker, never both.
                response.close();
                if let Ok(Ok(resources)) = response.try_recv() {
                    self.release_resources(resources);
                }
                warn!(
                    "Resource allocation for connection {} timed out after {:?}",
                    connection.id(),
                    self.timeout
                );
                return Err(RpcError::AllocationTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if let Err((e, resources)) = connection.attach_resources(resources) {
            self.release_resources(resources);
            return Err(e);
        }
        Ok(())
    }

    /// Return a connection's slab to its pool
    pub fn release_resources(&self, resources: ConnectionResources) {
        match self.pools.get(resources.pool) {
            Some(pool) => pool.state.release(resources),
            None => warn!("Slab from unknown pool {} dropped", resources.pool),
        }
    }

    /// Stop every worker and release cached memory.
    ///
    /// Slabs still owned by connections are reported as
    /// [`RpcError::ResourceLeak`], one per pool.
    pub fn close(&self) -> RpcResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for pool in &self.pools {
            pool.jobs.lock().take();
        }
        for pool in &self.pools {
            if let Some(worker) = pool.worker.lock().take() {
                if worker.join().is_err() {
                    warn!("Resource pool {} worker panicked", pool.state.index);
                }
            }
        }

        let failures: Vec<RpcError> = self
            .pools
            .iter()
            .filter_map(|pool| pool.state.close().err())
            .collect();
        if failures.is_empty() {
            info!("Resource manager closed");
        }
        RpcError::aggregate("closing resource manager", failures)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|pool| pool.state.stats()).collect()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("pools", &self.pools.len())
            .field("layout", &self.layout)
            .field("timeout", &self.timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::DeviceContext;

    fn layout() -> SlotLayout {
        SlotLayout {
            recv_slots: 2,
            send_slots: 2,
            slot_size: 128,
        }
    }

    #[test]
    fn test_slot_layout() {
        let layout = layout();
        assert_eq!(layout.slab_len(), 512);
        assert_eq!(layout.recv_offset(1), 128);
        assert_eq!(layout.send_offset(0), 256);
        assert_eq!(layout.send_offset(1), 384);
    }

    #[test]
    fn test_pool_reuses_released_slabs() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let pool = PoolState::new(0, 0, 4096);
        let pd = device.pd();

        let first = pool.allocate(&pd, layout()).unwrap();
        first.memory().write(0, b"stale").unwrap();
        let lkey = first.memory().mr().lkey;
        pool.release(first);

        let second = pool.allocate(&pd, layout()).unwrap();
        assert_eq!(second.memory().mr().lkey, lkey);
        assert_eq!(second.memory().read(0, 5).unwrap(), vec![0; 5]);

        let stats = pool.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.outstanding, 1);
        pool.release(second);
    }

    #[test]
    fn test_pool_budget() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let pool = PoolState::new(0, 0, 1024);
        let pd = device.pd();

        let a = pool.allocate(&pd, layout()).unwrap();
        let b = pool.allocate(&pd, layout()).unwrap();
        assert!(matches!(
            pool.allocate(&pd, layout()),
            Err(RpcError::ResourceExhausted { .. })
        ));
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().bytes_cached, 1024);
        assert_eq!(pool.stats().failures, 1);
    }

    #[test]
    fn test_pool_evicts_idle_slabs_of_other_shapes() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let pool = PoolState::new(0, 0, 1024);
        let pd = device.pd();

        let small = pool.allocate(&pd, layout()).unwrap();
        pool.release(small);
        let big = SlotLayout {
            recv_slots: 4,
            send_slots: 4,
            slot_size: 128,
        };
        let resources = pool.allocate(&pd, big).unwrap();
        assert_eq!(resources.memory().len(), 1024);
        assert_eq!(pool.stats().bytes_cached, 0);
        assert_eq!(device.registered_region_count(), 1);
        pool.release(resources);
    }

    #[test]
    fn test_registration_failure_is_exhaustion() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        device.set_registration_failure(true);
        let pool = PoolState::new(0, 0, 4096);
        assert!(matches!(
            pool.allocate(&device.pd(), layout()),
            Err(RpcError::ResourceExhausted { .. })
        ));
        assert_eq!(pool.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_close_reports_leaks() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let pool = PoolState::new(0, 3, 4096);
        let pd = device.pd();
        let held = pool.allocate(&pd, layout()).unwrap();
        let returned = pool.allocate(&pd, layout()).unwrap();
        pool.release(returned);

        assert!(matches!(
            pool.close(),
            Err(RpcError::ResourceLeak {
                affinity: 3,
                outstanding: 1
            })
        ));
        // Only the held slab remains registered.
        assert_eq!(device.registered_region_count(), 1);
        drop(held);
    }

    #[test]
    fn test_manager_close_joins_workers() {
        let manager = ResourceManager::new(&[0, 1], Duration::from_millis(100), layout(), 4096).unwrap();
        assert_eq!(manager.pool_count(), 2);
        manager.close().unwrap();
        assert!(manager.close().is_ok());
        assert!(manager.pools.iter().all(|p| p.worker.lock().is_none()));
    }
}
