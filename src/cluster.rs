//! Completion-processing clusters
//!
//! A cluster owns one completion queue shared by up to `cluster_size` queue
//! pairs, a CPU affinity, and the registry that maps queue pair numbers to
//! the connections using them. Its processing thread drains the queue in
//! batches and hands every completion to the registered handler.

use crate::affinity::pin_current_thread;
use crate::verbs::{CompletionQueue, DeviceContext, DeviceKey, WorkCompletion};
use crate::{RpcError, RpcResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives the completions routed to one queue pair.
pub trait CompletionHandler: Send + Sync {
    fn handle_completion(&self, wc: &WorkCompletion);
}

/// Processing parameters shared by all clusters of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterParams {
    /// Maximum completions drained per pass
    pub poll_size: usize,
    /// Completion-channel wait in blocking mode
    pub timeout: Duration,
    /// Busy-poll instead of waiting on the completion channel
    pub polling: bool,
}

/// Snapshot of a cluster's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub cluster_id: usize,
    pub affinity: usize,
    /// Queue pairs currently registered
    pub registered: usize,
    /// Non-empty processing passes
    pub batches: u64,
    /// Completions handed to a handler
    pub delivered: u64,
    /// Completions dropped because their queue pair was not registered
    pub unroutable: u64,
}

/// One completion-processing shard
pub struct Cluster {
    id: usize,
    affinity: usize,
    params: ClusterParams,
    device: Arc<DeviceContext>,
    cq: Arc<CompletionQueue>,
    registry: DashMap<u32, Arc<dyn CompletionHandler>>,
    closed: AtomicBool,
    stopping: AtomicBool,
    processing: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    batches: AtomicU64,
    delivered: AtomicU64,
    unroutable: AtomicU64,
}

impl Cluster {
    /// Create a cluster with its own completion queue of `cq_capacity` entries
    pub fn new(
        id: usize,
        device: &Arc<DeviceContext>,
        cq_capacity: usize,
        affinity: usize,
        params: ClusterParams,
    ) -> RpcResult<Self> {
        let cq = device.create_cq(cq_capacity, !params.polling)?;
        Ok(Self {
            id,
            affinity,
            params,
            device: Arc::clone(device),
            cq,
            registry: DashMap::new(),
            closed: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            processing: Mutex::new(()),
            worker: Mutex::new(None),
            batches: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn affinity(&self) -> usize {
        self.affinity
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device.key()
    }

    /// Completion queue to create queue pairs against
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Route completions of `qp_num` to `handler`.
    ///
    /// An existing registration is never replaced.
    pub fn register_qp(&self, qp_num: u32, handler: Arc<dyn CompletionHandler>) -> RpcResult<()> {
        if self.is_closed() {
            return Err(RpcError::ClusterClosed { cluster_id: self.id });
        }
        match self.registry.entry(qp_num) {
            Entry::Occupied(_) => Err(RpcError::DuplicateRegistration {
                qp_num,
                cluster_id: self.id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                debug!("Cluster {} registered qp {}", self.id, qp_num);
                Ok(())
            }
        }
    }

    /// Stop routing completions of `qp_num`. Returns whether it was registered.
    pub fn unregister_qp(&self, qp_num: u32) -> bool {
        let removed = self.registry.remove(&qp_num).is_some();
        if removed {
            debug!("Cluster {} unregistered qp {}", self.id, qp_num);
        }
        removed
    }

    pub fn is_registered(&self, qp_num: u32) -> bool {
        self.registry.contains_key(&qp_num)
    }

    /// Drain up to `poll_size` completions and dispatch them in queue order.
    ///
    /// Returns the number of completions taken off the queue, routed or not.
    pub fn process_completions(&self) -> usize {
        let _pass = self.processing.lock();
        self.drain_batch()
    }

    fn drain_batch(&self) -> usize {
        let batch = self.cq.poll(self.params.poll_size);
        if batch.is_empty() {
            return 0;
        }
        self.batches.fetch_add(1, Ordering::Relaxed);

        for wc in &batch {
            // Clone out of the map so a handler may unregister itself.
            let handler = self.registry.get(&wc.qp_num).map(|h| Arc::clone(h.value()));
            match handler {
                Some(handler) => {
                    handler.handle_completion(wc);
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    self.unroutable.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Cluster {} dropped completion wr_id={} for unregistered qp {} ({:?})",
                        self.id, wc.wr_id, wc.qp_num, wc.status
                    );
                }
            }
        }
        batch.len()
    }

    /// Spawn the pinned processing thread. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> RpcResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.is_closed() {
            return Ok(());
        }
        let cluster = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("cluster-{}-{}", self.device.key(), self.id))
            .spawn(move || cluster.run())?;
        *worker = Some(handle);
        Ok(())
    }

    fn run(&self) {
        pin_current_thread(self.affinity);
        info!(
            "Cluster {} on device {} processing (core={}, polling={}, poll_size={})",
            self.id,
            self.device.key(),
            self.affinity,
            self.params.polling,
            self.params.poll_size
        );

        while !self.stopping.load(Ordering::Acquire) {
            if self.params.polling {
                if self.process_completions() == 0 {
                    std::hint::spin_loop();
                }
            } else if self.cq.wait(self.params.timeout) {
                self.process_completions();
            }
        }
        debug!("Cluster {} processing thread exiting", self.id);
    }

    /// Stop processing and release the completion queue.
    ///
    /// New registrations are refused from the first call on. The in-flight
    /// batch finishes and completions already queued are dispatched before
    /// the queue is destroyed. Fails while queue pairs still reference the
    /// queue; a later call retries the release.
    pub fn close(&self) -> RpcResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stopping.store(true, Ordering::Release);
            self.cq.wake();

            let worker = self.worker.lock().take();
            let own_thread = worker
                .as_ref()
                .is_some_and(|handle| handle.thread().id() == std::thread::current().id());
            if let Some(handle) = worker {
                if own_thread {
                    warn!("Cluster {} closed from its own processing thread", self.id);
                } else if handle.join().is_err() {
                    warn!("Cluster {} processing thread panicked", self.id);
                }
            }

            if own_thread {
                // This thread holds the processing lock; its current batch
                // finishes after close returns and the loop then exits.
                debug!(
                    "Cluster {} leaving {} queued completion(s) undelivered",
                    self.id,
                    self.cq.len()
                );
            } else {
                let _pass = self.processing.lock();
                let mut pending = self.cq.len();
                while pending > 0 {
                    let drained = self.drain_batch();
                    if drained == 0 {
                        break;
                    }
                    pending = pending.saturating_sub(drained);
                }
            }
        }

        self.device
            .destroy_cq(&self.cq)
            .map_err(|e| RpcError::ClusterCloseError {
                device_key: self.device.key(),
                cluster_id: self.id,
                reason: e.to_string(),
            })?;
        info!(
            "Cluster {} on device {} closed: delivered={} unroutable={}",
            self.id,
            self.device.key(),
            self.delivered.load(Ordering::Relaxed),
            self.unroutable.load(Ordering::Relaxed)
        );
        Ok(())
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            cluster_id: self.id,
            affinity: self.affinity,
            registered: self.registry.len(),
            batches: self.batches.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("device_key", &self.device.key())
            .field("affinity", &self.affinity)
            .field("cq", &self.cq.handle())
            .field("registered", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{test_qp_attr, CmId, CompletionStatus, WcOpcode};
    use std::sync::{OnceLock, Weak};
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    impl CompletionHandler for Recorder {
        fn handle_completion(&self, wc: &WorkCompletion) {
            self.seen.lock().push(wc.wr_id);
        }
    }

    fn params(poll_size: usize) -> ClusterParams {
        ClusterParams {
            poll_size,
            timeout: Duration::from_millis(20),
            polling: false,
        }
    }

    fn completion(qp_num: u32, wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            qp_num,
            status: CompletionStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: 0,
            imm_data: None,
        }
    }

    fn cluster(poll_size: usize) -> Cluster {
        let device = DeviceContext::open("mlx5_0").unwrap();
        Cluster::new(0, &device, 64, 0, params(poll_size)).unwrap()
    }

    #[test]
    fn test_registered_completion_delivered_once() {
        let cluster = cluster(16);
        let recorder = Arc::new(Recorder::default());
        cluster.register_qp(11, recorder.clone()).unwrap();

        cluster.cq().push(completion(11, 1)).unwrap();
        assert_eq!(cluster.process_completions(), 1);
        assert_eq!(cluster.process_completions(), 0);

        assert_eq!(*recorder.seen.lock(), vec![1]);
        assert_eq!(cluster.stats().delivered, 1);
    }

    #[test]
    fn test_unregistered_completion_counted_as_anomaly() {
        let cluster = cluster(16);
        let recorder = Arc::new(Recorder::default());
        cluster.register_qp(11, recorder.clone()).unwrap();
        assert!(cluster.unregister_qp(11));
        assert!(!cluster.unregister_qp(11));

        cluster.cq().push(completion(11, 1)).unwrap();
        cluster.cq().push(completion(99, 2)).unwrap();
        assert_eq!(cluster.process_completions(), 2);

        assert!(recorder.seen.lock().is_empty());
        let stats = cluster.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.unroutable, 2);
    }

    #[test]
    fn test_duplicate_registration_keeps_existing_mapping() {
        let cluster = cluster(16);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        cluster.register_qp(5, first.clone()).unwrap();

        let err = cluster.register_qp(5, second.clone()).unwrap_err();
        assert!(matches!(
            err,
            RpcError::DuplicateRegistration { qp_num: 5, cluster_id: 0 }
        ));

        cluster.cq().push(completion(5, 3)).unwrap();
        cluster.process_completions();
        assert_eq!(*first.seen.lock(), vec![3]);
        assert!(second.seen.lock().is_empty());
    }

    #[test]
    fn test_batches_bounded_and_ordered() {
        let cluster = cluster(4);
        let recorder = Arc::new(Recorder::default());
        cluster.register_qp(1, recorder.clone()).unwrap();
        for wr_id in 0..10 {
            cluster.cq().push(completion(1, wr_id)).unwrap();
        }

        assert_eq!(cluster.process_completions(), 4);
        assert_eq!(cluster.process_completions(), 4);
        assert_eq!(cluster.process_completions(), 2);
        assert_eq!(*recorder.seen.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(cluster.stats().batches, 3);
    }

    #[test]
    fn test_close_refuses_registrations_and_drains() {
        let cluster = cluster(2);
        let recorder = Arc::new(Recorder::default());
        cluster.register_qp(1, recorder.clone()).unwrap();
        for wr_id in 0..5 {
            cluster.cq().push(completion(1, wr_id)).unwrap();
        }

        cluster.close().unwrap();
        assert_eq!(recorder.seen.lock().len(), 5);
        assert!(cluster.cq().is_destroyed());
        assert!(matches!(
            cluster.register_qp(2, recorder),
            Err(RpcError::ClusterClosed { .. })
        ));
        cluster.close().unwrap();
    }

    #[test]
    fn test_close_fails_while_queue_pair_attached() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let cluster = Cluster::new(3, &device, 16, 0, params(8)).unwrap();
        let cm_id = CmId::bound_to(&device);
        let qp = cm_id.create_qp(cluster.cq(), test_qp_attr()).unwrap();

        let err = cluster.close().unwrap_err();
        assert!(matches!(err, RpcError::ClusterCloseError { cluster_id: 3, .. }));

        qp.destroy();
        cluster.close().unwrap();
        assert_eq!(device.live_cq_count(), 0);
    }

    #[test]
    fn test_processing_thread_delivers_in_blocking_mode() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let cluster = Arc::new(Cluster::new(0, &device, 64, 0, params(8)).unwrap());
        let recorder = Arc::new(Recorder::default());
        cluster.register_qp(7, recorder.clone()).unwrap();
        cluster.start().unwrap();

        for wr_id in 0..20 {
            cluster.cq().push(completion(7, wr_id)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.seen.lock().len() < 20 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*recorder.seen.lock(), (0..20).collect::<Vec<_>>());

        cluster.close().unwrap();
    }

    #[test]
    fn test_processing_thread_in_polling_mode() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let polling = ClusterParams {
            polling: true,
            ..params(8)
        };
        let cluster = Arc::new(Cluster::new(1, &device, 64, 0, polling).unwrap());
        let recorder = Arc::new(Recorder::default());
        cluster.register_qp(9, recorder.clone()).unwrap();
        cluster.start().unwrap();

        cluster.cq().push(completion(9, 42)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.seen.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        cluster.close().unwrap();
        assert_eq!(*recorder.seen.lock(), vec![42]);
    }

    struct SlowRecorder {
        started: AtomicBool,
        seen: Mutex<Vec<u64>>,
    }

    impl CompletionHandler for SlowRecorder {
        fn handle_completion(&self, wc: &WorkCompletion) {
            self.started.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_millis(50));
            self.seen.lock().push(wc.wr_id);
        }
    }

    #[test]
    fn test_close_waits_for_in_flight_batch() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let cluster = Arc::new(Cluster::new(0, &device, 64, 0, params(2)).unwrap());
        let recorder = Arc::new(SlowRecorder {
            started: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        });
        cluster.register_qp(4, recorder.clone()).unwrap();
        for wr_id in 0..6 {
            cluster.cq().push(completion(4, wr_id)).unwrap();
        }
        cluster.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.started.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        cluster.close().unwrap();

        // Every completion delivered exactly once, in order.
        assert_eq!(*recorder.seen.lock(), (0..6).collect::<Vec<_>>());
        assert!(cluster.cq().is_destroyed());
        assert_eq!(device.live_cq_count(), 0);
    }

    struct CloseOnCompletion {
        cluster: OnceLock<Weak<Cluster>>,
        result: Mutex<Option<RpcResult<()>>>,
    }

    impl CompletionHandler for CloseOnCompletion {
        fn handle_completion(&self, _wc: &WorkCompletion) {
            if let Some(cluster) = self.cluster.get().and_then(Weak::upgrade) {
                *self.result.lock() = Some(cluster.close());
            }
        }
    }

    #[test]
    fn test_close_from_processing_thread() {
        let device = DeviceContext::open("mlx5_0").unwrap();
        let cluster = Arc::new(Cluster::new(0, &device, 64, 0, params(8)).unwrap());
        let handler = Arc::new(CloseOnCompletion {
            cluster: OnceLock::new(),
            result: Mutex::new(None),
        });
        let _ = handler.cluster.set(Arc::downgrade(&cluster));
        cluster.register_qp(2, handler.clone()).unwrap();
        cluster.start().unwrap();
        cluster.cq().push(completion(2, 1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while handler.result.lock().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(*handler.result.lock(), Some(Ok(()))));
        assert!(cluster.is_closed());
        assert_eq!(device.live_cq_count(), 0);
    }
}
