//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::log::RemoteChangeLog;
use std::sync::Arc;
use vaultsync_protocol::{
    AppendRequest, AppendResponse, ListSinceRequest, ListSinceResponse, SyncMessage,
    APPEND_ENDPOINT, LIST_ENDPOINT,
};

/// The sync server.
///
/// Wraps a [`RemoteChangeLog`] behind the append and list-since endpoints.
///
/// # Example
///
/// ```
/// use vaultsync_protocol::{AppendRequest, ChangeRecord, OwnerId};
/// use vaultsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let request = AppendRequest::new(OwnerId::new("alice"), vec![ChangeRecord::new("c1", "x")]);
///
/// let body = server.handle_post("/sync/append", &request.encode().unwrap()).unwrap();
/// assert!(!body.is_empty());
/// assert_eq!(server.record_count(), 1);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server with an empty log.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_log(config, Arc::new(RemoteChangeLog::new()))
    }

    /// Creates a sync server over an existing log.
    pub fn with_log(config: ServerConfig, log: Arc<RemoteChangeLog>) -> Self {
        let context = Arc::new(HandlerContext::new(config, log));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles an append request.
    ///
    /// # Errors
    ///
    /// See [`RequestHandler::handle_append`].
    pub fn handle_append(&self, request: AppendRequest) -> ServerResult<AppendResponse> {
        self.handler.handle_append(request)
    }

    /// Handles a list-since request.
    ///
    /// # Errors
    ///
    /// See [`RequestHandler::handle_list_since`].
    pub fn handle_list_since(&self, request: ListSinceRequest) -> ServerResult<ListSinceResponse> {
        self.handler.handle_list_since(request)
    }

    /// Handles a sync message (dispatches to appropriate handler).
    ///
    /// # Errors
    ///
    /// Fails on response messages and on handler errors.
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::AppendRequest(req) => {
                self.handle_append(req).map(SyncMessage::AppendResponse)
            }
            SyncMessage::ListSinceRequest(req) => self
                .handle_list_since(req)
                .map(SyncMessage::ListSinceResponse),
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// Handles a POST body for one of the sync endpoints.
    ///
    /// Bodies are CBOR in both directions.
    ///
    /// # Errors
    ///
    /// Fails on an unknown path, an undecodable body, or a handler error.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let encoded = match path {
            APPEND_ENDPOINT => self.handle_append(AppendRequest::decode(body)?)?.encode(),
            LIST_ENDPOINT => self
                .handle_list_since(ListSinceRequest::decode(body)?)?
                .encode(),
            other => {
                tracing::debug!(path = other, "request for unknown endpoint");
                return Err(ServerError::UnknownEndpoint(other.to_string()));
            }
        };
        encoded.map_err(|e| ServerError::Internal(e.to_string()))
    }

    /// Returns the shared change log.
    pub fn log(&self) -> &Arc<RemoteChangeLog> {
        &self.context.log
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the number of records across all owners.
    pub fn record_count(&self) -> usize {
        self.context.log.total_len()
    }
}
