//! Server group orchestration
//!
//! The [`ServerGroup`] owns one [`DeviceInstance`] per physical device, the
//! [`ResourceManager`] and the table of live connections. Connections are
//! spread round-robin over the cluster ids; a connection's cluster id picks
//! the same cluster on whichever device it arrives on.

use crate::cluster::{Cluster, ClusterParams, ClusterStats, CompletionHandler};
use crate::config::ServerGroupConfig;
use crate::connection::{ConnectionState, ServerConnection};
use crate::instance::DeviceInstance;
use crate::resource::{PoolStats, ResourceManager, SlotLayout};
use crate::service::{RpcService, ServerEvent};
use crate::verbs::{CmId, CompletionQueue, DeviceContext, DeviceKey, QpInitAttr, QueuePair};
use crate::{RpcError, RpcResult};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Multi-device, multi-core RPC server group
pub struct ServerGroup<S: RpcService> {
    config: ServerGroupConfig,
    service: Arc<S>,
    instances: RwLock<HashMap<DeviceKey, Arc<DeviceInstance>>>,
    current_cluster: AtomicUsize,
    nbr_of_clusters: usize,
    resource_manager: ResourceManager,
    connections: RwLock<HashMap<Uuid, Arc<ServerConnection<S>>>>,
    accepting: AtomicBool,
    /// Accepts past the `accepting` check and not yet finished
    setups: Mutex<usize>,
    setups_done: Condvar,
    shut_down: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Counts one in-flight accept; dropping it, also on cancellation, lets a
/// waiting shutdown proceed.
struct SetupGuard<'a> {
    setups: &'a Mutex<usize>,
    setups_done: &'a Condvar,
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        let mut setups = self.setups.lock();
        *setups -= 1;
        if *setups == 0 {
            self.setups_done.notify_all();
        }
    }
}

impl<S: RpcService> ServerGroup<S> {
    /// Create a group serving `service`
    pub fn new(config: ServerGroupConfig, service: S) -> RpcResult<Arc<Self>> {
        Self::with_service(config, |_| service)
    }

    /// Create a group whose service keeps a handle back to it
    pub fn with_service(
        config: ServerGroupConfig,
        make_service: impl FnOnce(Weak<Self>) -> S,
    ) -> RpcResult<Arc<Self>> {
        config.validate()?;
        let resource_manager = ResourceManager::new(
            &config.affinities,
            config.timeout(),
            SlotLayout::from_config(&config),
            config.pool_memory_limit,
        )?;
        let (closed_tx, _) = watch::channel(false);

        info!(
            "🚀 Server group created: {} cluster(s) per device, affinities {:?}, polling={}, timeout={}ms",
            config.nbr_of_clusters(),
            config.affinities,
            config.polling,
            config.timeout_ms
        );

        Ok(Arc::new_cyclic(|weak| Self {
            service: Arc::new(make_service(weak.clone())),
            instances: RwLock::new(HashMap::new()),
            current_cluster: AtomicUsize::new(0),
            nbr_of_clusters: config.nbr_of_clusters(),
            resource_manager,
            connections: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            setups: Mutex::new(0),
            setups_done: Condvar::new(),
            shut_down: AtomicBool::new(false),
            closed_tx,
            config,
        }))
    }

    pub fn config(&self) -> &ServerGroupConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Watch that flips to `true` once the group stops accepting
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn begin_setup(&self) -> Option<SetupGuard<'_>> {
        let mut setups = self.setups.lock();
        if !self.is_accepting() {
            return None;
        }
        *setups += 1;
        Some(SetupGuard {
            setups: &self.setups,
            setups_done: &self.setups_done,
        })
    }

    fn stop_accepting(&self) {
        let mut setups = self.setups.lock();
        self.accepting.store(false, Ordering::Release);
        self.closed_tx.send_replace(true);
        if *setups > 0 {
            debug!("Waiting for {} in-flight accept(s)", *setups);
        }
        while *setups > 0 {
            self.setups_done.wait(&mut setups);
        }
    }

    fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            poll_size: self.config.poll_size,
            timeout: self.config.timeout(),
            polling: self.config.polling,
        }
    }

    fn qp_init_attr(&self) -> QpInitAttr {
        QpInitAttr {
            max_send_wr: self.config.send_queue,
            max_recv_wr: self.config.recv_queue,
            max_inline_data: self.config.max_inline,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }

    /// Next cluster id, round-robin over the clusters of a device
    pub fn assign_cluster_id(&self) -> usize {
        let n = self.nbr_of_clusters;
        match self
            .current_cluster
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % n))
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    fn device_of(&self, conn: &ServerConnection<S>) -> RpcResult<Arc<DeviceContext>> {
        conn.cm_id()
            .verbs()
            .ok_or_else(|| RpcError::no_device_context(conn.id()))
    }

    fn get_or_create_instance(&self, device: &Arc<DeviceContext>) -> RpcResult<Arc<DeviceInstance>> {
        let key = device.key();
        if let Some(instance) = self.instances.read().get(&key) {
            return Ok(Arc::clone(instance));
        }

        let candidate = DeviceInstance::create(
            device,
            self.config.cq_capacity(),
            &self.config.affinities,
            self.cluster_params(),
        )?;

        let mut instances = self.instances.write();
        if let Some(existing) = instances.get(&key) {
            let existing = Arc::clone(existing);
            drop(instances);
            candidate.discard();
            return Ok(existing);
        }
        if self.shut_down.load(Ordering::Acquire) {
            drop(instances);
            candidate.discard();
            return Err(RpcError::GroupClosed);
        }
        if let Err(e) = candidate.start() {
            drop(instances);
            if let Err(close_err) = candidate.close() {
                warn!("Failed to release device {} after start failure: {}", key, close_err);
            }
            return Err(e);
        }
        let instance = Arc::new(candidate);
        instances.insert(key, Arc::clone(&instance));
        info!(
            "Device instance created for {} (key {})",
            device.info().name,
            key
        );
        Ok(instance)
    }

    /// Completion queue of the connection's cluster, creating the device
    /// instance on first use of its device
    pub fn resolve_completion_queue(&self, conn: &ServerConnection<S>) -> RpcResult<Arc<CompletionQueue>> {
        debug!("setting up cq processor (multicore) for connection {}", conn.id());
        let device = self.device_of(conn)?;
        let instance = self.get_or_create_instance(&device)?;
        let cluster = instance.cluster(conn.cluster_id())?;
        debug!(
            "Connection {} uses cluster {} on device {} (core {})",
            conn.id(),
            cluster.id(),
            device.key(),
            cluster.affinity()
        );
        Ok(Arc::clone(cluster.cq()))
    }

    /// The connection's cluster, without creating anything
    pub fn lookup_cluster(&self, conn: &ServerConnection<S>) -> RpcResult<Arc<Cluster>> {
        let device = self.device_of(conn)?;
        let instance = self
            .instances
            .read()
            .get(&device.key())
            .cloned()
            .ok_or_else(|| RpcError::ClusterNotFound {
                connection: conn.id().to_string(),
                device_key: device.key(),
                cluster_id: conn.cluster_id(),
            })?;
        instance.cluster(conn.cluster_id()).cloned()
    }

    /// Create the connection's queue pair on its cluster's completion queue
    /// and route the queue pair's completions to the connection.
    pub fn create_queue_pair(&self, conn: &Arc<ServerConnection<S>>) -> RpcResult<Arc<QueuePair>> {
        debug!("setting up QP for connection {}", conn.id());
        let cluster = self.lookup_cluster(conn)?;
        let qp = conn.cm_id().create_qp(cluster.cq(), self.qp_init_attr())?;

        let handler: Arc<dyn CompletionHandler> = Arc::clone(conn) as Arc<dyn CompletionHandler>;
        if let Err(e) = cluster.register_qp(qp.qp_num(), handler) {
            qp.destroy();
            return Err(e);
        }
        conn.set_qp(Arc::clone(&qp));
        debug!(
            "Connection {} has qp {} on cluster {}",
            conn.id(),
            qp.qp_num(),
            cluster.id()
        );
        Ok(qp)
    }

    pub async fn allocate_resources(&self, conn: &ServerConnection<S>) -> RpcResult<()> {
        self.resource_manager.allocate_resources(conn).await
    }

    pub fn notify_open(&self, conn: &Arc<ServerConnection<S>>) {
        self.service.open(conn);
    }

    pub fn notify_close(&self, conn: &Arc<ServerConnection<S>>) {
        self.service.close(conn);
    }

    pub fn dispatch_event(&self, event: ServerEvent<S>) -> RpcResult<()> {
        self.service.process_server_event(event)
    }

    pub fn create_request(&self) -> S::Request {
        self.service.create_request()
    }

    pub fn create_response(&self) -> S::Response {
        self.service.create_response()
    }

    /// Set up a connection for `cm_id` and announce it to the service.
    ///
    /// On failure everything already set up for the connection is released.
    pub async fn accept(self: &Arc<Self>, cm_id: Arc<CmId>) -> RpcResult<Arc<ServerConnection<S>>> {
        let Some(_setup) = self.begin_setup() else {
            return Err(RpcError::GroupClosed);
        };
        let cluster_id = self.assign_cluster_id();
        let conn = ServerConnection::new(Arc::downgrade(self), cm_id, cluster_id);

        if let Err(e) = self.establish(&conn).await {
            error!("Failed to set up connection {}: {}", conn.id(), e);
            conn.mark_closed();
            self.release_connection(&conn);
            return Err(e);
        }

        conn.set_state(ConnectionState::Open);
        self.notify_open(&conn);
        self.connections.write().insert(conn.id(), Arc::clone(&conn));

        // Shutdown started while this connection was being set up.
        if !self.is_accepting() {
            self.close_connection(&conn)?;
            return Err(RpcError::GroupClosed);
        }
        info!(
            "Connection {} accepted on cluster {} (device {:?})",
            conn.id(),
            conn.cluster_id(),
            conn.device_key()
        );
        Ok(conn)
    }

    async fn establish(&self, conn: &Arc<ServerConnection<S>>) -> RpcResult<()> {
        self.resolve_completion_queue(conn)?;
        self.create_queue_pair(conn)?;
        self.allocate_resources(conn).await?;
        conn.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn release_connection(&self, conn: &ServerConnection<S>) {
        if let Some(qp) = conn.take_qp() {
            match self.lookup_cluster(conn) {
                Ok(cluster) => {
                    cluster.unregister_qp(qp.qp_num());
                }
                Err(e) => warn!("Connection {} lost its cluster: {}", conn.id(), e),
            }
            qp.destroy();
        }
        if let Some(resources) = conn.detach_resources() {
            self.resource_manager.release_resources(resources);
        }
    }

    /// Tear a connection down. Closing twice is a no-op.
    pub fn close_connection(&self, conn: &Arc<ServerConnection<S>>) -> RpcResult<()> {
        let previous = conn.mark_closed();
        if previous == ConnectionState::Closed {
            return Ok(());
        }
        if previous == ConnectionState::Open {
            self.notify_close(conn);
        }
        self.connections.write().remove(&conn.id());
        self.release_connection(conn);
        debug!("Connection {} closed", conn.id());
        Ok(())
    }

    pub fn connection(&self, id: Uuid) -> Option<Arc<ServerConnection<S>>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn device_instance(&self, key: DeviceKey) -> Option<Arc<DeviceInstance>> {
        self.instances.read().get(&key).cloned()
    }

    pub fn device_instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Cluster counters of every device instance
    pub fn cluster_stats(&self) -> Vec<(DeviceKey, ClusterStats)> {
        self.instances
            .read()
            .iter()
            .flat_map(|(key, instance)| instance.stats().into_iter().map(move |s| (*key, s)))
            .collect()
    }

    pub fn resource_stats(&self) -> Vec<PoolStats> {
        self.resource_manager.stats()
    }

    /// Stop accepting, close every connection, every device instance and
    /// the resource manager.
    ///
    /// Accepts already in flight finish or roll back before any connection
    /// is closed.
    ///
    /// Every step runs even when an earlier one failed; failures come back
    /// as one aggregated error. Calling it again is a no-op.
    pub fn shutdown(&self) -> RpcResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down server group");
        let mut failures = Vec::new();

        self.stop_accepting();
        let live: Vec<_> = self.connections.read().values().cloned().collect();
        for conn in &live {
            if let Err(e) = self.close_connection(conn) {
                failures.push(e);
            }
        }
        debug!("Closed {} live connection(s)", live.len());

        let instances: Vec<_> = self.instances.write().drain().map(|(_, i)| i).collect();
        for instance in instances {
            if let Err(e) = instance.close() {
                failures.push(e);
            }
        }

        if let Err(e) = self.resource_manager.close() {
            failures.push(e);
        }

        let result = RpcError::aggregate("server group shutdown", failures);
        match &result {
            Ok(()) => info!("🏁 rpc group down"),
            Err(e) => error!("rpc group down with failures: {}", e),
        }
        result
    }
}

impl<S: RpcService> Drop for ServerGroup<S> {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            if let Err(e) = self.shutdown() {
                warn!("Server group dropped without clean shutdown: {}", e);
            }
        }
    }
}

impl<S: RpcService> std::fmt::Debug for ServerGroup<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerGroup")
            .field("nbr_of_clusters", &self.nbr_of_clusters)
            .field("devices", &self.device_instance_count())
            .field("connections", &self.connection_count())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
