//! Sync transport over HTTP POST with CBOR bodies.
//!
//! No HTTP stack is linked here. Callers plug one in through
//! [`HttpClient`]; tests and embedded servers use [`LoopbackClient`].

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use vaultsync_protocol::{
    decode_cbor, encode_cbor, AppendRequest, AppendResponse, ListSinceRequest, ListSinceResponse,
    APPEND_ENDPOINT, LIST_ENDPOINT,
};

/// Why a POST produced no usable reply body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// No response arrived: DNS, connect, reset or read timeout.
    #[error("network failure: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// Response status code.
        status: u16,
        /// Body or reason phrase, for logs.
        message: String,
    },
}

impl HttpError {
    /// Shorthand for a status failure.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// A 4xx the server will repeat for the same request. 408 and 429
    /// are excluded since they only ask the caller to come back later.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Status { status, .. }
            if (400..500).contains(status) && *status != 408 && *status != 429)
    }
}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        if err.is_rejection() {
            Self::transport_fatal(err.to_string())
        } else {
            Self::transport_retryable(err.to_string())
        }
    }
}

/// The one HTTP capability the engine needs: POST bytes, get bytes back.
pub trait HttpClient: Send + Sync {
    /// POSTs `body` to `url`. Only a 2xx reply is `Ok`.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError>;

    /// Cheap local check of whether the network is usable right now.
    fn is_reachable(&self) -> bool;
}

#[derive(Debug, Default)]
struct LinkState {
    closed: bool,
    last_error: Option<HttpError>,
}

/// [`SyncTransport`] that talks to a remote change log at `base_url`.
///
/// Every call goes to the network unless the transport was closed or the
/// client reports the network unreachable. A failed POST is remembered in
/// [`last_error`](Self::last_error) but does not stop the next attempt.
/// Rejected requests (4xx) come back as fatal transport errors; network
/// failures and 5xx are retryable.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    link: Mutex<LinkState>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// A trailing `/` on `base_url` is dropped.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client,
            link: Mutex::new(LinkState::default()),
        }
    }

    /// Server root, without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Why the most recent POST failed, cleared by the next success.
    pub fn last_error(&self) -> Option<HttpError> {
        self.link.lock().last_error.clone()
    }

    /// Reopens a closed transport.
    pub fn reconnect(&self) {
        self.link.lock().closed = false;
    }

    fn call<Req: Serialize, Res: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> SyncResult<Res> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = encode_cbor(request)
            .map_err(|e| SyncError::Protocol(format!("cannot encode {endpoint} request: {e}")))?;
        let url = format!("{}{endpoint}", self.base_url);

        let reply = match self.client.post(&url, body) {
            Ok(reply) => {
                self.link.lock().last_error = None;
                reply
            }
            Err(err) => {
                if err.is_rejection() {
                    tracing::warn!(%url, error = %err, "remote change log rejected request");
                } else {
                    tracing::warn!(%url, error = %err, "remote change log unreachable");
                }
                self.link.lock().last_error = Some(err.clone());
                return Err(err.into());
            }
        };

        decode_cbor(&reply)
            .map_err(|e| SyncError::Protocol(format!("malformed {endpoint} reply: {e}")))
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn append(&self, request: &AppendRequest) -> SyncResult<AppendResponse> {
        self.call(APPEND_ENDPOINT, request)
    }

    fn list_since(&self, request: &ListSinceRequest) -> SyncResult<ListSinceResponse> {
        self.call(LIST_ENDPOINT, request)
    }

    fn is_connected(&self) -> bool {
        !self.link.lock().closed && self.client.is_reachable()
    }

    fn close(&self) -> SyncResult<()> {
        self.link.lock().closed = true;
        Ok(())
    }
}

/// Something that answers a POST by path, in-process.
///
/// Any `Fn(&str, &[u8]) -> Result<Vec<u8>, HttpError>` qualifies, so
/// wrapping a server's handler in a closure is enough.
pub trait LoopbackServer {
    /// Answers a POST to `path`.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError>;
}

impl<F> LoopbackServer for F
where
    F: Fn(&str, &[u8]) -> Result<Vec<u8>, HttpError>,
{
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError> {
        self(path, body)
    }
}

/// [`HttpClient`] that skips the network and calls a [`LoopbackServer`]
/// directly with the path part of the URL.
pub struct LoopbackClient<S> {
    server: S,
    reachable: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Starts out reachable.
    pub fn new(server: S) -> Self {
        Self {
            server,
            reachable: AtomicBool::new(true),
        }
    }

    /// Pulls the cable, or plugs it back in.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
        if !self.is_reachable() {
            return Err(HttpError::Network(format!("unreachable: {url}")));
        }
        let path = url.find("/sync/").map_or(url, |at| &url[at..]);
        self.server.handle_post(path, &body)
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::{ChangeRecord, Cursor, OwnerId};

    /// Replays one canned reply and remembers where it was sent. With no
    /// reply set, fails with `failure` or a connection reset.
    #[derive(Default)]
    struct CannedClient {
        reply: Mutex<Option<Vec<u8>>>,
        failure: Mutex<Option<HttpError>>,
        hits: Mutex<Vec<String>>,
        offline: AtomicBool,
    }

    impl HttpClient for CannedClient {
        fn post(&self, url: &str, _body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
            self.hits.lock().push(url.to_owned());
            match self.reply.lock().clone() {
                Some(reply) => Ok(reply),
                None => Err(self
                    .failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| HttpError::Network("connection reset".into()))),
            }
        }

        fn is_reachable(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    fn list_req() -> ListSinceRequest {
        ListSinceRequest::new(OwnerId::new("alice"), Cursor::BEGINNING, 10)
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let transport = HttpTransport::new("https://vault.example.org//", CannedClient::default());
        assert_eq!(transport.base_url(), "https://vault.example.org");
        assert!(transport.is_connected());
    }

    #[test]
    fn closed_link_refuses_without_posting() {
        let transport = HttpTransport::new("https://vault.example.org", CannedClient::default());
        transport.close().unwrap();

        assert!(matches!(transport.list_since(&list_req()), Err(SyncError::NotConnected)));
        assert!(transport.client.hits.lock().is_empty());
    }

    #[test]
    fn offline_client_reports_disconnected() {
        let client = CannedClient::default();
        client.offline.store(true, Ordering::SeqCst);
        assert!(!HttpTransport::new("https://vault.example.org", client).is_connected());
    }

    #[test]
    fn append_goes_to_append_endpoint() {
        let client = CannedClient::default();
        *client.reply.lock() = Some(AppendResponse::all_accepted(vec!["c1".into()]).encode().unwrap());

        let transport = HttpTransport::new("https://vault.example.org", client);
        let request = AppendRequest::new(OwnerId::new("alice"), vec![ChangeRecord::new("c1", "x")]);
        let response = transport.append(&request).unwrap();

        assert_eq!(response.accepted, ["c1"]);
        assert_eq!(
            transport.client.hits.lock().as_slice(),
            ["https://vault.example.org/sync/append"]
        );
    }

    #[test]
    fn failed_post_does_not_block_the_next_one() {
        let transport = HttpTransport::new("https://vault.example.org", CannedClient::default());

        let err = transport.list_since(&list_req()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            transport.last_error(),
            Some(HttpError::Network("connection reset".into()))
        );
        assert!(transport.is_connected());

        *transport.client.reply.lock() =
            Some(ListSinceResponse::new(vec![], Cursor::new(1), false).encode().unwrap());
        assert_eq!(transport.list_since(&list_req()).unwrap().cursor, Cursor::new(1));
        assert_eq!(transport.client.hits.lock().len(), 2);
        assert!(transport.last_error().is_none());
    }

    #[test]
    fn closed_transport_reopens_on_reconnect() {
        let transport = HttpTransport::new("https://vault.example.org", CannedClient::default());
        transport.close().unwrap();
        assert!(!transport.is_connected());

        transport.reconnect();
        assert!(transport.is_connected());
    }

    #[test]
    fn client_errors_are_fatal_and_server_errors_retryable() {
        let cases = [
            (HttpError::status(400, "bad request"), false),
            (HttpError::status(413, "batch too large"), false),
            (HttpError::status(408, "request timeout"), true),
            (HttpError::status(429, "slow down"), true),
            (HttpError::status(503, "unavailable"), true),
            (HttpError::Network("reset".into()), true),
        ];
        for (failure, retryable) in cases {
            let client = CannedClient::default();
            *client.failure.lock() = Some(failure.clone());
            let transport = HttpTransport::new("https://vault.example.org", client);

            let err = transport.list_since(&list_req()).unwrap_err();
            assert_eq!(err.is_retryable(), retryable, "{failure}");
            assert_eq!(transport.last_error(), Some(failure));
        }
    }

    #[test]
    fn garbage_reply_is_a_protocol_error() {
        let client = CannedClient::default();
        *client.reply.lock() = Some(b"\xff\xfe".to_vec());
        let transport = HttpTransport::new("https://vault.example.org", client);

        assert!(matches!(transport.list_since(&list_req()), Err(SyncError::Protocol(_))));
        assert!(transport.is_connected());
    }

    #[test]
    fn loopback_strips_host_from_url() {
        let server = |path: &str, _body: &[u8]| -> Result<Vec<u8>, HttpError> {
            assert_eq!(path, LIST_ENDPOINT);
            ListSinceResponse::new(vec![], Cursor::new(3), false)
                .encode()
                .map_err(|e| HttpError::status(500, e.to_string()))
        };
        let transport = HttpTransport::new("http://localhost:8080", LoopbackClient::new(server));
        let response = transport.list_since(&list_req()).unwrap();
        assert_eq!(response.cursor, Cursor::new(3));
    }
}
