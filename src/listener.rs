//! Connection acceptance
//!
//! The [`Listener`] consumes connection-manager events and drives the
//! group: connect requests are accepted on their own task, disconnects close
//! the matching connection. It stops once the group stops accepting or every
//! [`CmEventSender`] is gone.

use crate::connection::ServerConnection;
use crate::group::ServerGroup;
use crate::service::RpcService;
use crate::verbs::CmId;
use crate::{RpcError, RpcResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type AcceptReply<S> = oneshot::Sender<RpcResult<Arc<ServerConnection<S>>>>;

/// Connection-manager event
pub enum CmEvent<S: RpcService> {
    /// A client wants to connect on the device `cm_id` is bound to
    ConnectRequest {
        cm_id: Arc<CmId>,
        reply: Option<AcceptReply<S>>,
    },
    /// The peer of a connection went away
    Disconnected(Uuid),
}

impl<S: RpcService> std::fmt::Debug for CmEvent<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequest { cm_id, .. } => f.debug_tuple("ConnectRequest").field(&cm_id.id()).finish(),
            Self::Disconnected(id) => f.debug_tuple("Disconnected").field(id).finish(),
        }
    }
}

/// Feeds connection-manager events to a [`Listener`]
pub struct CmEventSender<S: RpcService> {
    tx: mpsc::UnboundedSender<CmEvent<S>>,
}

impl<S: RpcService> Clone for CmEventSender<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: RpcService> CmEventSender<S> {
    fn send(&self, event: CmEvent<S>) -> RpcResult<()> {
        self.tx.send(event).map_err(|_| RpcError::GroupClosed)
    }

    /// Request a connection and wait for the accept result
    pub async fn connect(&self, cm_id: Arc<CmId>) -> RpcResult<Arc<ServerConnection<S>>> {
        let (reply, result) = oneshot::channel();
        self.send(CmEvent::ConnectRequest {
            cm_id,
            reply: Some(reply),
        })?;
        result.await.map_err(|_| RpcError::GroupClosed)?
    }

    /// Request a connection without waiting for it
    pub fn notify_connect(&self, cm_id: Arc<CmId>) -> RpcResult<()> {
        self.send(CmEvent::ConnectRequest { cm_id, reply: None })
    }

    pub fn disconnect(&self, id: Uuid) -> RpcResult<()> {
        self.send(CmEvent::Disconnected(id))
    }
}

/// Acceptance loop for one server group
pub struct Listener<S: RpcService> {
    group: Arc<ServerGroup<S>>,
    events: mpsc::UnboundedReceiver<CmEvent<S>>,
}

impl<S: RpcService> Listener<S> {
    pub fn new(group: Arc<ServerGroup<S>>) -> (Self, CmEventSender<S>) {
        let (tx, events) = mpsc::unbounded_channel();
        (Self { group, events }, CmEventSender { tx })
    }

    /// Run until the group stops accepting or every sender is dropped
    pub async fn run(mut self) -> RpcResult<()> {
        let mut closed = self.group.subscribe_closed();
        info!("🎯 Listener accepting connections");

        while self.group.is_accepting() {
            tokio::select! {
                _ = closed.changed() => break,
                event = self.events.recv() => match event {
                    Some(CmEvent::ConnectRequest { cm_id, reply }) => self.spawn_accept(cm_id, reply),
                    Some(CmEvent::Disconnected(id)) => self.disconnect(id),
                    None => {
                        debug!("All event senders dropped");
                        break;
                    }
                },
            }
        }

        info!("Listener stopped");
        Ok(())
    }

    fn spawn_accept(&self, cm_id: Arc<CmId>, reply: Option<AcceptReply<S>>) {
        let group = Arc::clone(&self.group);
        tokio::spawn(async move {
            let result = group.accept(Arc::clone(&cm_id)).await;
            if let Err(e) = &result {
                warn!("Rejecting connection request {}: {}", cm_id.id(), e);
                cm_id.reject();
            }
            if let Some(reply) = reply {
                if let Err(Ok(conn)) = reply.send(result) {
                    debug!("Requester of {} went away", conn.id());
                }
            }
        });
    }

    fn disconnect(&self, id: Uuid) {
        match self.group.connection(id) {
            Some(conn) => {
                if let Err(e) = self.group.close_connection(&conn) {
                    warn!("Failed to close connection {}: {}", id, e);
                }
            }
            None => debug!("Disconnect for unknown connection {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::echo::EchoService;
    use crate::verbs::DeviceContext;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_and_disconnect() {
        let group = ServerGroup::new(test_config(vec![0, 1]), EchoService::new()).unwrap();
        let (listener, sender) = Listener::new(Arc::clone(&group));
        let task = tokio::spawn(listener.run());

        let device = DeviceContext::open("mlx5_0").unwrap();
        let conn = sender.connect(CmId::bound_to(&device)).await.unwrap();
        assert_eq!(group.connection_count(), 1);

        sender.disconnect(conn.id()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while group.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(group.service().closed(), 1);

        group.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_accept_rejects_request() {
        let group = ServerGroup::new(test_config(vec![0]), EchoService::new()).unwrap();
        let (listener, sender) = Listener::new(Arc::clone(&group));
        let task = tokio::spawn(listener.run());

        let unbound = CmId::new();
        let result = sender.connect(Arc::clone(&unbound)).await;
        assert!(matches!(result, Err(RpcError::NoDeviceContext { .. })));
        assert!(unbound.is_rejected());

        drop(sender);
        task.await.unwrap().unwrap();
        group.shutdown().unwrap();
    }
}
