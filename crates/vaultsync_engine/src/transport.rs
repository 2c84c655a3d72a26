//! The seam between sync sessions and the remote change log.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use vaultsync_protocol::{AppendRequest, AppendResponse, ListSinceRequest, ListSinceResponse};

/// Carries append and list-since requests to a remote change log.
///
/// Implementations decide what the wire is: HTTP, an in-process server,
/// or the scripted [`MockTransport`]. Once issued, a call finishes or fails
/// by itself; sessions never interrupt one.
pub trait SyncTransport: Send + Sync {
    /// Uploads one batch for `request.owner_id`.
    fn append(&self, request: &AppendRequest) -> SyncResult<AppendResponse>;

    /// Fetches the page of records after `request.cursor`.
    fn list_since(&self, request: &ListSinceRequest) -> SyncResult<ListSinceResponse>;

    /// False once closed or when the link is known to be down.
    fn is_connected(&self) -> bool;

    /// Refuses further calls.
    fn close(&self) -> SyncResult<()>;
}

/// Script for one endpoint of the mock.
#[derive(Debug)]
struct Script<Req, Res> {
    replies: VecDeque<Res>,
    failures: u32,
    seen: Vec<Req>,
}

impl<Req, Res> Default for Script<Req, Res> {
    fn default() -> Self {
        Self {
            replies: VecDeque::new(),
            failures: 0,
            seen: Vec::new(),
        }
    }
}

impl<Req: Clone, Res: Clone> Script<Req, Res> {
    /// Records the call, then plays an injected failure or the next reply.
    /// The final queued reply sticks.
    fn play(&mut self, request: &Req, endpoint: &str) -> SyncResult<Res> {
        self.seen.push(request.clone());
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SyncError::transport_retryable(format!(
                "injected {endpoint} failure"
            )));
        }
        let reply = if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        };
        reply.ok_or_else(|| SyncError::Protocol(format!("no scripted {endpoint} reply")))
    }
}

/// Scripted in-memory transport for session tests.
///
/// Each endpoint answers from its own queue, repeating the last reply once
/// the queue is down to one, and can be told to fail the next few calls.
/// Every request that got past the connectivity check is kept for
/// assertions.
#[derive(Debug)]
pub struct MockTransport {
    online: AtomicBool,
    append: Mutex<Script<AppendRequest, AppendResponse>>,
    list: Mutex<Script<ListSinceRequest, ListSinceResponse>>,
}

impl MockTransport {
    /// Connected, with nothing scripted.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            append: Mutex::default(),
            list: Mutex::default(),
        }
    }

    /// Adds a reply to the append queue.
    pub fn push_append_response(&self, response: AppendResponse) {
        self.append.lock().replies.push_back(response);
    }

    /// Adds a reply to the list-since queue.
    pub fn push_list_response(&self, response: ListSinceResponse) {
        self.list.lock().replies.push_back(response);
    }

    /// The next `n` appends fail with a retryable transport error.
    pub fn fail_next_appends(&self, n: u32) {
        self.append.lock().failures = n;
    }

    /// The next `n` list-since calls fail with a retryable transport error.
    pub fn fail_next_lists(&self, n: u32) {
        self.list.lock().failures = n;
    }

    /// Flips connectivity without closing.
    pub fn set_connected(&self, connected: bool) {
        self.online.store(connected, Ordering::SeqCst);
    }

    /// Appends seen so far, oldest first.
    pub fn append_requests(&self) -> Vec<AppendRequest> {
        self.append.lock().seen.clone()
    }

    /// List-since calls seen so far, oldest first.
    pub fn list_requests(&self) -> Vec<ListSinceRequest> {
        self.list.lock().seen.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn append(&self, request: &AppendRequest) -> SyncResult<AppendResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.append.lock().play(request, "append")
    }

    fn list_since(&self, request: &ListSinceRequest) -> SyncResult<ListSinceResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.list.lock().play(request, "list-since")
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.set_connected(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::{Cursor, OwnerId};

    fn list_request() -> ListSinceRequest {
        ListSinceRequest::new(OwnerId::new("alice"), Cursor::BEGINNING, 10)
    }

    #[test]
    fn disconnected_mock_refuses_calls() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.list_since(&list_request()),
            Err(SyncError::NotConnected)
        ));

        transport.set_connected(true);
        transport.close().unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn last_scripted_reply_repeats() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::new(vec![], Cursor::new(1), true));
        transport.push_list_response(ListSinceResponse::new(vec![], Cursor::new(2), false));

        assert_eq!(transport.list_since(&list_request()).unwrap().cursor, Cursor::new(1));
        assert_eq!(transport.list_since(&list_request()).unwrap().cursor, Cursor::new(2));
        assert_eq!(transport.list_since(&list_request()).unwrap().cursor, Cursor::new(2));
        assert_eq!(transport.list_requests().len(), 3);
    }

    #[test]
    fn injected_failure_is_retryable_and_recorded() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::default());
        transport.fail_next_lists(1);

        let err = transport.list_since(&list_request()).unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.list_since(&list_request()).is_ok());
        assert_eq!(transport.list_requests().len(), 2);
    }

    #[test]
    fn unscripted_endpoint_is_protocol_error() {
        let transport = MockTransport::new();
        let request = AppendRequest::new(OwnerId::new("alice"), vec![]);
        assert!(matches!(
            transport.append(&request),
            Err(SyncError::Protocol(_))
        ));
    }
}
