//! Byte-message echo service used by the `rpc-server` binary and tests

use crate::connection::ServerConnection;
use crate::service::{RpcMessage, RpcService, ServerEvent};
use crate::{RpcError, RpcResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque byte payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesMessage {
    pub data: Vec<u8>,
}

impl RpcMessage for BytesMessage {
    fn write(&self, buf: &mut [u8]) -> RpcResult<usize> {
        let buf_len = buf.len();
        let dst = buf.get_mut(..self.data.len()).ok_or_else(|| {
            RpcError::message(format!(
                "{} byte message does not fit {} byte buffer",
                self.data.len(),
                buf_len
            ))
        })?;
        dst.copy_from_slice(&self.data);
        Ok(self.data.len())
    }

    fn update(&mut self, buf: &[u8]) -> RpcResult<()> {
        self.data.clear();
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Answers every request with its own payload
#[derive(Debug, Default)]
pub struct EchoService {
    opened: AtomicU64,
    closed: AtomicU64,
    served: AtomicU64,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl RpcService for EchoService {
    type Request = BytesMessage;
    type Response = BytesMessage;

    fn create_request(&self) -> BytesMessage {
        BytesMessage::default()
    }

    fn create_response(&self) -> BytesMessage {
        BytesMessage::default()
    }

    fn open(&self, connection: &Arc<ServerConnection<Self>>) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        info!(
            "Echo connection {} open on cluster {}",
            connection.id(),
            connection.cluster_id()
        );
    }

    fn close(&self, connection: &Arc<ServerConnection<Self>>) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        info!("Echo connection {} closed", connection.id());
    }

    fn process_server_event(&self, mut event: ServerEvent<Self>) -> RpcResult<()> {
        let payload = event.request().data.clone();
        debug!("Echoing {} bytes for ticket {}", payload.len(), event.ticket());
        event.response_mut().data = payload;
        event.trigger_response()?;
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_message_bounds() {
        let msg = BytesMessage {
            data: b"ping".to_vec(),
        };
        let mut buf = [0u8; 8];
        assert_eq!(msg.write(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        let mut small = [0u8; 2];
        assert!(msg.write(&mut small).is_err());

        let mut other = BytesMessage::default();
        other.update(b"pong!").unwrap();
        assert_eq!(other.size(), 5);
    }
}
