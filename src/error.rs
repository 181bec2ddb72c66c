//! Error types and handling for the RPC server group

use thiserror::Error;

/// Result type alias for server group operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Error taxonomy for connection setup, completion processing and teardown
#[derive(Error, Debug)]
pub enum RpcError {
    /// The connection manager has not bound a device context yet
    #[error("No device context bound to connection {connection}")]
    NoDeviceContext { connection: String },

    /// No device instance exists for the connection's device
    #[error("No cluster found for connection {connection} (device {device_key}, cluster {cluster_id})")]
    ClusterNotFound {
        connection: String,
        device_key: i32,
        cluster_id: usize,
    },

    /// Cluster id outside of the device instance's cluster range
    #[error("Cluster index {cluster_id} out of range, device has {cluster_count} clusters")]
    ClusterIndexOutOfRange {
        cluster_id: usize,
        cluster_count: usize,
    },

    /// Queue pair id already present in a cluster registry
    #[error("Queue pair {qp_num} already registered on cluster {cluster_id}")]
    DuplicateRegistration { qp_num: u32, cluster_id: usize },

    /// Cluster no longer accepts registrations
    #[error("Cluster {cluster_id} is closed")]
    ClusterClosed { cluster_id: usize },

    /// Resource pool cannot satisfy an allocation
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// Resource allocation exceeded the configured timeout
    #[error("Resource allocation timed out after {timeout_ms}ms")]
    AllocationTimeout { timeout_ms: u64 },

    /// Allocation requested after the resource manager was closed
    #[error("Resource manager is closed")]
    ResourceManagerClosed,

    /// Allocations that were never released before the resource manager closed
    #[error("{outstanding} allocation(s) still outstanding on pool with affinity {affinity}")]
    ResourceLeak { affinity: usize, outstanding: usize },

    /// A cluster could not release its completion queue
    #[error("Cluster {cluster_id} on device {device_key} failed to close: {reason}")]
    ClusterCloseError {
        device_key: i32,
        cluster_id: usize,
        reason: String,
    },

    /// Completion queue is full
    #[error("Completion queue {cq_handle} overrun (capacity {capacity})")]
    CqOverrun { cq_handle: u32, capacity: usize },

    /// Verbs object still referenced by dependent objects
    #[error("Resource busy: {reason}")]
    ResourceBusy { reason: String },

    /// Failed to create queue pair
    #[error("Failed to create queue pair: {reason}")]
    QpCreationFailed { reason: String },

    /// Memory registration failed
    #[error("Memory registration failed: {reason}")]
    MemoryRegFailed { reason: String },

    /// Failed to post a work request
    #[error("Failed to post work request on qp {qp_num}: {reason}")]
    PostFailed { qp_num: u32, reason: String },

    /// Server group no longer accepts connections
    #[error("Server group is closed")]
    GroupClosed,

    /// Operation on a connection that was already closed
    #[error("Connection {connection} is closed")]
    ConnectionClosed { connection: String },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Message (de)serialization failed in a service message type
    #[error("Message error: {reason}")]
    Message { reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    /// Several independent failures collected while tearing down
    #[error("{context}: {} failure(s): {}", .errors.len(), join_errors(.errors))]
    Aggregate {
        context: String,
        errors: Vec<RpcError>,
    },
}

fn join_errors(errors: &[RpcError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RpcError {
    /// Create a new NoDeviceContext error
    pub fn no_device_context(connection: impl ToString) -> Self {
        Self::NoDeviceContext {
            connection: connection.to_string(),
        }
    }

    /// Create a new ResourceExhausted error
    pub fn resource_exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a new MemoryRegFailed error
    pub fn memory_reg_failed(reason: impl Into<String>) -> Self {
        Self::MemoryRegFailed {
            reason: reason.into(),
        }
    }

    /// Create a new InvalidConfig error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new Message error
    pub fn message(reason: impl Into<String>) -> Self {
        Self::Message {
            reason: reason.into(),
        }
    }

    /// Create a new Internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Collapse a list of failures into a single result.
    ///
    /// Nested aggregates are flattened so callers see one level of causes.
    pub fn aggregate(context: impl Into<String>, errors: Vec<RpcError>) -> RpcResult<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                Self::Aggregate { errors, .. } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        Err(Self::Aggregate {
            context: context.into(),
            errors: flat,
        })
    }

    /// Check if this error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AllocationTimeout { .. } | Self::CqOverrun { .. } | Self::ResourceBusy { .. } => {
                true
            }

            // Pool pressure may ease once other connections close
            Self::ResourceExhausted { .. } => true,

            // Sequencing and invariant violations need a code fix
            Self::NoDeviceContext { .. }
            | Self::ClusterNotFound { .. }
            | Self::ClusterIndexOutOfRange { .. }
            | Self::DuplicateRegistration { .. } => false,

            Self::ClusterClosed { .. }
            | Self::ResourceManagerClosed
            | Self::GroupClosed
            | Self::ConnectionClosed { .. } => false,

            Self::ResourceLeak { .. } | Self::ClusterCloseError { .. } | Self::Aggregate { .. } => {
                false
            }

            Self::QpCreationFailed { .. } | Self::MemoryRegFailed { .. } => false,
            Self::PostFailed { .. } => true,

            Self::InvalidConfig { .. } | Self::Message { .. } => false,

            Self::Io(_) => true,

            Self::Internal { .. } => false,
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoDeviceContext { .. } => "transport",

            Self::ClusterNotFound { .. }
            | Self::ClusterIndexOutOfRange { .. }
            | Self::DuplicateRegistration { .. }
            | Self::ClusterClosed { .. } => "cluster",

            Self::ResourceExhausted { .. }
            | Self::AllocationTimeout { .. }
            | Self::ResourceManagerClosed
            | Self::ResourceLeak { .. } => "resource",

            Self::CqOverrun { .. }
            | Self::ResourceBusy { .. }
            | Self::QpCreationFailed { .. }
            | Self::MemoryRegFailed { .. }
            | Self::PostFailed { .. } => "verbs",

            Self::ClusterCloseError { .. } | Self::Aggregate { .. } => "shutdown",

            Self::GroupClosed | Self::ConnectionClosed { .. } => "lifecycle",

            Self::InvalidConfig { .. } => "config",

            Self::Message { .. } => "message",

            Self::Io(_) => "io",

            Self::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RpcError::no_device_context("conn-1");
        assert!(matches!(err, RpcError::NoDeviceContext { .. }));
        assert_eq!(err.category(), "transport");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(RpcError::AllocationTimeout { timeout_ms: 10 }.is_recoverable());
        assert!(!RpcError::DuplicateRegistration {
            qp_num: 7,
            cluster_id: 0
        }
        .is_recoverable());
        assert!(RpcError::resource_exhausted("memory").is_recoverable());
    }

    #[test]
    fn test_aggregate_flattens_nested_failures() {
        let inner = RpcError::aggregate(
            "device 3",
            vec![RpcError::ClusterCloseError {
                device_key: 3,
                cluster_id: 1,
                reason: "busy".to_string(),
            }],
        )
        .unwrap_err();

        let outer = RpcError::aggregate("shutdown", vec![inner, RpcError::ResourceManagerClosed])
            .unwrap_err();
        match outer {
            RpcError::Aggregate { context, errors } => {
                assert_eq!(context, "shutdown");
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[0], RpcError::ClusterCloseError { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_aggregate_is_ok() {
        assert!(RpcError::aggregate("nothing", Vec::new()).is_ok());
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::ClusterIndexOutOfRange {
            cluster_id: 5,
            cluster_count: 4,
        };
        assert!(err.to_string().contains("out of range"));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_os_failures_surface_as_io() {
        let err: RpcError = std::io::Error::from(std::io::ErrorKind::OutOfMemory).into();
        assert!(matches!(err, RpcError::Io(_)));
        assert_eq!(err.category(), "io");
        assert!(err.is_recoverable());
    }
}
