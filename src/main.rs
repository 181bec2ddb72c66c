//! RPC Server
//!
//! Runs a server group with an echo service on software verbs devices,
//! connects a few simulated clients and serves until SIGINT or SIGTERM.
//!
//! Usage:
//! ```bash
//! rpc-server --affinities 0,1,2,3 --devices 2 --connections 8
//! rpc-server --config server.toml
//! ```

use anyhow::Context;
use clap::Parser;
use rdma_rpc_engine::echo::EchoService;
use rdma_rpc_engine::verbs::{CmId, DeviceContext};
use rdma_rpc_engine::{Listener, ServerGroup, ServerGroupConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::layer, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "rpc-server",
    about = "Multi-core RDMA RPC server group",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// CPU cores for clusters and resource pools, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0")]
    affinities: Vec<usize>,

    /// Completion wait and resource allocation timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Largest send posted inline
    #[arg(long, default_value_t = 64)]
    max_inline: u32,

    /// Busy-poll completion queues
    #[arg(long)]
    polling: bool,

    /// Receive queue depth per connection
    #[arg(long, default_value_t = 16)]
    recv_queue: u32,

    /// Send queue depth per connection
    #[arg(long, default_value_t = 16)]
    send_queue: u32,

    /// Completions drained per processing pass
    #[arg(long, default_value_t = 32)]
    poll_size: usize,

    /// Connections sharing one completion queue
    #[arg(long, default_value_t = 16)]
    cluster_size: u32,

    /// Slot size in bytes
    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,

    /// Registered memory budget per pool in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pool_memory_limit: usize,

    /// Software devices to open
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Simulated client connections
    #[arg(long, default_value_t = 4)]
    connections: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Configuration file path, replaces the group options above
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn group_config(&self) -> anyhow::Result<ServerGroupConfig> {
        if let Some(path) = &self.config {
            info!("Loading configuration from: {}", path.display());
            return ServerGroupConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()));
        }
        let config = ServerGroupConfig {
            affinities: self.affinities.clone(),
            timeout_ms: self.timeout_ms,
            max_inline: self.max_inline,
            polling: self.polling,
            recv_queue: self.recv_queue,
            send_queue: self.send_queue,
            poll_size: self.poll_size,
            cluster_size: self.cluster_size,
            buffer_size: self.buffer_size,
            pool_memory_limit: self.pool_memory_limit,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    tracing_subscriber::registry()
        .with(layer().with_target(false))
        .with(filter)
        .init();

    info!("🚀 Starting RPC server");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   Devices: {}", args.devices);
    info!("   Simulated connections: {}", args.connections);

    let config = args.group_config()?;
    info!("   Affinities: {:?}", config.affinities);
    info!("   Polling: {}", config.polling);

    let group = match ServerGroup::new(config, EchoService::new()) {
        Ok(group) => {
            info!("✅ Server group initialized");
            group
        }
        Err(e) => {
            error!("❌ Failed to initialize server group: {}", e);
            return Err(e.into());
        }
    };

    let (listener, events) = Listener::new(Arc::clone(&group));
    let listener_handle = tokio::spawn(listener.run());

    let devices = (0..args.devices.max(1))
        .map(|i| DeviceContext::open(&format!("soft_{i}")))
        .collect::<Result<Vec<_>, _>>()?;

    for i in 0..args.connections {
        let device = &devices[i % devices.len()];
        let conn = events.connect(CmId::bound_to(device)).await?;
        let Some(qp) = conn.qp() else {
            warn!("Connection {} has no queue pair", conn.id());
            continue;
        };
        qp.simulate_receive(format!("hello from client {i}").as_bytes(), Some(i as u32))?;
    }

    // Give the clusters a moment to answer before reporting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        "Served {} request(s) on {} connection(s) over {} device(s)",
        group.service().served(),
        group.connection_count(),
        group.device_instance_count()
    );
    for (device, stats) in group.cluster_stats() {
        info!(
            "   device {} cluster {} (core {}): delivered={} unroutable={}",
            device, stats.cluster_id, stats.affinity, stats.delivered, stats.unroutable
        );
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    info!("🎯 Server group is running");
    info!("   Send SIGTERM or SIGINT to shutdown gracefully");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("📡 Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("📡 Received SIGINT (Ctrl+C), shutting down gracefully");
        }
    }

    let closing = Arc::clone(&group);
    let shutdown = tokio::task::spawn_blocking(move || closing.shutdown()).await?;
    match listener_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Listener failed: {}", e),
        Err(e) => warn!("Listener task panicked: {}", e),
    }
    if let Err(e) = shutdown {
        error!("❌ Shutdown finished with failures: {}", e);
        return Err(e.into());
    }

    info!("🛑 RPC server shut down complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from([
            "rpc-server",
            "--affinities",
            "2,3",
            "--polling",
            "--devices",
            "2",
            "--debug",
        ])
        .unwrap();

        assert_eq!(args.affinities, vec![2, 3]);
        assert!(args.polling);
        assert_eq!(args.devices, 2);
        assert!(args.debug);

        let config = args.group_config().unwrap();
        assert_eq!(config.nbr_of_clusters(), 2);
        assert_eq!(config.cq_capacity(), 32 * 16);
    }

    #[test]
    fn test_args_reject_invalid_group() {
        let args = Args::try_parse_from(["rpc-server", "--poll-size", "0"]).unwrap();
        assert!(args.group_config().is_err());
    }
}
