//! Multi-core RDMA RPC server group
//!
//! This crate provides the server side of an RDMA RPC system: connections
//! arriving on any number of devices are spread over a fixed set of
//! completion-processing clusters per device, each pinned to its own core.
//! Completions are routed from a cluster's shared completion queue to the
//! connection that owns the queue pair, and turned into requests for an
//! application [`RpcService`].
//!
//! # Architecture
//!
//! ```text
//!                ┌───────────────────────────────────────────┐
//!  CmEvent ────► │ Listener ──► ServerGroup::accept          │
//!                │              │                            │
//!                │   ┌──────────┴───────────┐                │
//!                │   ▼                      ▼                │
//!                │ DeviceInstance (key)   ResourceManager    │
//!                │  ├─ Cluster 0 (core a)  ├─ pool 0 (core a)│
//!                │  ├─ Cluster 1 (core b)  ├─ pool 1 (core b)│
//!                │  └─ ...                 └─ ...            │
//!                │        │ qp_num → ServerConnection        │
//!                │        ▼                                  │
//!                │   RpcService::process_server_event        │
//!                └───────────────────────────────────────────┘
//! ```
//!
//! The verbs layer in [`verbs`] is a software device: it behaves like a
//! loopback NIC so the whole stack runs without RDMA hardware.

pub mod affinity;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod echo;
pub mod error;
pub mod group;
pub mod instance;
pub mod listener;
pub mod resource;
pub mod service;
pub mod verbs;

pub use cluster::{Cluster, ClusterParams, ClusterStats, CompletionHandler};
pub use config::ServerGroupConfig;
pub use connection::{ConnectionState, ConnectionStats, ServerConnection};
pub use error::{RpcError, RpcResult};
pub use group::ServerGroup;
pub use instance::DeviceInstance;
pub use listener::{CmEvent, CmEventSender, Listener};
pub use resource::{ConnectionResources, PoolStats, ResourceManager, SlotLayout};
pub use service::{RpcMessage, RpcService, ServerEvent};
pub use verbs::DeviceKey;
