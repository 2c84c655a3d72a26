//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::log::RemoteChangeLog;
use std::sync::Arc;
use vaultsync_protocol::{AppendRequest, AppendResponse, ListSinceRequest, ListSinceResponse, OwnerId};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Change log (shared across all handlers).
    pub log: Arc<RemoteChangeLog>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, log: Arc<RemoteChangeLog>) -> Self {
        Self { config, log }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles an append request.
    ///
    /// # Errors
    ///
    /// Fails without touching the log if the batch is over the configured
    /// limit, the owner is empty, or any record is malformed.
    pub fn handle_append(&self, request: AppendRequest) -> ServerResult<AppendResponse> {
        let max = self.context.config.max_append_batch;
        if request.changes.len() > max as usize {
            return Err(ServerError::BatchTooLarge {
                size: request.changes.len(),
                max,
            });
        }
        validate_owner(&request.owner_id)?;
        for record in &request.changes {
            record.validate()?;
        }

        let outcome = self
            .context
            .log
            .append(&request.owner_id, &request.changes);
        Ok(outcome.into())
    }

    /// Handles a list-since request.
    ///
    /// The limit is clamped to the configured page size; zero asks for a
    /// full page.
    ///
    /// # Errors
    ///
    /// Fails if the owner is empty.
    pub fn handle_list_since(&self, request: ListSinceRequest) -> ServerResult<ListSinceResponse> {
        validate_owner(&request.owner_id)?;

        let max = self.context.config.max_list_batch;
        let limit = match request.limit {
            0 => max,
            n => n.min(max),
        };

        let page = self
            .context
            .log
            .list_since(&request.owner_id, request.cursor, limit);
        Ok(page.into())
    }
}

fn validate_owner(owner: &OwnerId) -> ServerResult<()> {
    if owner.as_str().is_empty() {
        return Err(ServerError::InvalidRequest("empty owner id".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::{ChangeRecord, Cursor};

    fn create_handler(config: ServerConfig) -> (RequestHandler, Arc<RemoteChangeLog>) {
        let log = Arc::new(RemoteChangeLog::new());
        let context = Arc::new(HandlerContext::new(config, Arc::clone(&log)));
        (RequestHandler::new(context), log)
    }

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    fn batch(n: usize) -> Vec<ChangeRecord> {
        (0..n).map(|i| ChangeRecord::new(format!("r{i}"), "d")).collect()
    }

    #[test]
    fn append_and_list() {
        let (handler, _) = create_handler(ServerConfig::default());

        let response = handler
            .handle_append(AppendRequest::new(owner(), batch(2)))
            .unwrap();
        assert_eq!(response.accepted.len(), 2);
        assert!(response.is_clean());

        let page = handler
            .handle_list_since(ListSinceRequest::new(owner(), Cursor::BEGINNING, 10))
            .unwrap();
        assert_eq!(page.changes, batch(2));
        assert_eq!(page.cursor, Cursor::new(2));
    }

    #[test]
    fn oversized_batch_is_refused() {
        let (handler, log) = create_handler(ServerConfig::default().with_max_append_batch(3));

        let err = handler
            .handle_append(AppendRequest::new(owner(), batch(4)))
            .unwrap_err();
        assert!(matches!(err, ServerError::BatchTooLarge { size: 4, max: 3 }));
        assert!(log.is_empty());
    }

    #[test]
    fn invalid_record_refuses_whole_batch() {
        let (handler, log) = create_handler(ServerConfig::default());
        let mut changes = batch(1);
        changes.push(ChangeRecord::new("", "d"));

        let err = handler
            .handle_append(AppendRequest::new(owner(), changes))
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
        assert!(log.is_empty());
    }

    #[test]
    fn empty_owner_is_refused() {
        let (handler, _) = create_handler(ServerConfig::default());
        let request = ListSinceRequest::new(OwnerId::new(""), Cursor::BEGINNING, 10);
        assert!(handler.handle_list_since(request).unwrap_err().is_client_error());
    }

    #[test]
    fn list_limit_is_clamped() {
        let (handler, _) = create_handler(ServerConfig::default().with_max_list_batch(2));
        handler
            .handle_append(AppendRequest::new(owner(), batch(5)))
            .unwrap();

        let page = handler
            .handle_list_since(ListSinceRequest::new(owner(), Cursor::BEGINNING, 100))
            .unwrap();
        assert_eq!(page.changes.len(), 2);
        assert!(page.has_more);

        let page = handler
            .handle_list_since(ListSinceRequest::new(owner(), page.cursor, 0))
            .unwrap();
        assert_eq!(page.changes.len(), 2);
    }
}
