//! Application-facing RPC service contract

use crate::connection::ServerConnection;
use crate::RpcResult;
use std::sync::Arc;

/// A message that can be carried in one receive or send slot
pub trait RpcMessage: Send + 'static {
    /// Serialize into `buf`, returning the number of bytes written
    fn write(&self, buf: &mut [u8]) -> RpcResult<usize>;

    /// Replace the message's contents with the bytes in `buf`
    fn update(&mut self, buf: &[u8]) -> RpcResult<()>;

    /// Serialized size in bytes
    fn size(&self) -> usize;
}

/// The application behind a [`ServerGroup`](crate::ServerGroup).
///
/// Every callback runs on the processing thread of the cluster that owns the
/// connection, so implementations should hand long work to another executor
/// and answer later through [`ServerEvent::trigger_response`].
pub trait RpcService: Send + Sync + Sized + 'static {
    type Request: RpcMessage;
    type Response: RpcMessage;

    /// A fresh request, filled from each received message
    fn create_request(&self) -> Self::Request;

    /// A fresh response paired with each request
    fn create_response(&self) -> Self::Response;

    /// A connection became usable
    fn open(&self, _connection: &Arc<ServerConnection<Self>>) {}

    /// A connection is going away
    fn close(&self, _connection: &Arc<ServerConnection<Self>>) {}

    /// Handle one decoded request
    fn process_server_event(&self, event: ServerEvent<Self>) -> RpcResult<()>;
}

/// One request received on a connection, with the response to fill in
pub struct ServerEvent<S: RpcService> {
    connection: Arc<ServerConnection<S>>,
    ticket: u32,
    request: S::Request,
    response: S::Response,
}

impl<S: RpcService> ServerEvent<S> {
    pub(crate) fn new(
        connection: Arc<ServerConnection<S>>,
        ticket: u32,
        request: S::Request,
        response: S::Response,
    ) -> Self {
        Self {
            connection,
            ticket,
            request,
            response,
        }
    }

    pub fn connection(&self) -> &Arc<ServerConnection<S>> {
        &self.connection
    }

    /// Correlation id the client attached to the request
    pub fn ticket(&self) -> u32 {
        self.ticket
    }

    pub fn request(&self) -> &S::Request {
        &self.request
    }

    pub fn response(&self) -> &S::Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut S::Response {
        &mut self.response
    }

    /// Send the response back under the request's ticket
    pub fn trigger_response(self) -> RpcResult<()> {
        self.connection.send_response(self.ticket, &self.response)
    }
}

impl<S: RpcService> std::fmt::Debug for ServerEvent<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEvent")
            .field("connection", &self.connection.id())
            .field("ticket", &self.ticket)
            .field("request_size", &self.request.size())
            .finish()
    }
}
