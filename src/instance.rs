//! Per-device processing instances
//!
//! A [`DeviceInstance`] holds the clusters of one physical device. Every
//! connection arriving on that device shares them.

use crate::affinity::affinity_for;
use crate::cluster::{Cluster, ClusterParams, ClusterStats};
use crate::verbs::{DeviceContext, DeviceKey};
use crate::{RpcError, RpcResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The fixed set of clusters for one device
#[derive(Debug)]
pub struct DeviceInstance {
    device: Arc<DeviceContext>,
    clusters: Vec<Arc<Cluster>>,
}

impl DeviceInstance {
    /// Build one cluster per affinity value, each with a completion queue of
    /// `cq_capacity` entries. Processing threads are not started.
    ///
    /// If a cluster cannot be built, the ones already built are released.
    pub fn create(
        device: &Arc<DeviceContext>,
        cq_capacity: usize,
        affinities: &[usize],
        params: ClusterParams,
    ) -> RpcResult<Self> {
        if affinities.is_empty() {
            return Err(RpcError::invalid_config("affinity list is empty"));
        }
        let mut clusters = Vec::with_capacity(affinities.len());
        for cluster_id in 0..affinities.len() {
            let affinity = affinity_for(affinities, cluster_id);
            match Cluster::new(cluster_id, device, cq_capacity, affinity, params) {
                Ok(cluster) => clusters.push(Arc::new(cluster)),
                Err(e) => {
                    for built in &clusters {
                        let _ = built.close();
                    }
                    return Err(e);
                }
            }
        }
        debug!(
            "Built {} cluster(s) for device {} (cq capacity {})",
            clusters.len(),
            device.key(),
            cq_capacity
        );
        Ok(Self {
            device: Arc::clone(device),
            clusters,
        })
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device.key()
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Start every cluster's processing thread
    pub fn start(&self) -> RpcResult<()> {
        for cluster in &self.clusters {
            cluster.start()?;
        }
        info!(
            "Device instance {} ({}) started with {} cluster(s)",
            self.device.key(),
            self.device.info().name,
            self.clusters.len()
        );
        Ok(())
    }

    pub fn cluster(&self, cluster_id: usize) -> RpcResult<&Arc<Cluster>> {
        self.clusters
            .get(cluster_id)
            .ok_or(RpcError::ClusterIndexOutOfRange {
                cluster_id,
                cluster_count: self.clusters.len(),
            })
    }

    /// Release a candidate instance that lost the creation race.
    pub fn discard(self) {
        debug!("Discarding duplicate instance for device {}", self.device.key());
        for cluster in &self.clusters {
            if let Err(e) = cluster.close() {
                warn!("Failed to release discarded cluster: {}", e);
            }
        }
    }

    /// Close every cluster, collecting all failures.
    pub fn close(&self) -> RpcResult<()> {
        let failures: Vec<RpcError> = self
            .clusters
            .iter()
            .filter_map(|cluster| cluster.close().err())
            .collect();
        for failure in &failures {
            warn!("{}", failure);
        }
        if failures.is_empty() {
            info!("Device instance {} closed", self.device.key());
        }
        RpcError::aggregate(format!("closing device {}", self.device.key()), failures)
    }

    pub fn stats(&self) -> Vec<ClusterStats> {
        self.clusters.iter().map(|c| c.stats()).collect()
    }
}
