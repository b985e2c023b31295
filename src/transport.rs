//! Transport abstraction for the secondary user session
//!
//! The coordinator never speaks a concrete wire protocol; it drives a
//! [`UserTransport`] that knows how to authenticate, open a source media
//! stream, and open an upload sink. The shipped implementation,
//! [`HttpRelayTransport`], relays over plain HTTP: sources are fetched with
//! a streaming GET and destinations receive a streaming PUT, both through
//! the per-session proxied client.

use crate::error::{SessionError, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use regex::Regex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// A chunked byte stream of source media
pub type MediaStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Opaque reference to a live authenticated connection.
///
/// Exclusively owned by its Session; deliberately not `Clone`, so a handle
/// can only be moved into [`UserTransport::disconnect`] or borrowed by the
/// single worker that holds the session lock.
#[derive(Debug)]
pub struct CredentialHandle {
    conn_id: u64,
}

impl CredentialHandle {
    /// Mint a handle for a transport-internal connection ID
    #[must_use]
    pub const fn new(conn_id: u64) -> Self {
        Self { conn_id }
    }

    /// The transport-internal connection ID
    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

/// A login attempt that is waiting for a second-factor code
#[derive(Debug, Clone)]
pub struct PendingLogin {
    /// Phone number the login was started with
    pub phone_number: String,
}

/// Outcome of a successful first login step
#[derive(Debug)]
pub enum LoginOutcome {
    /// The provider accepted the credentials outright
    Connected(CredentialHandle),
    /// The provider requires a second factor before the session goes live
    SecondFactorRequired(PendingLogin),
}

/// Write half of a relay transfer
#[async_trait]
pub trait MediaSink: Send {
    /// Push one chunk to the destination
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransferError>;
    /// Flush and close the upload, surfacing any deferred error
    async fn finish(self: Box<Self>) -> Result<(), TransferError>;
}

/// Interface to the secondary-session provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserTransport: Send + Sync {
    /// Begin authentication for a phone number, honoring the proxy if set.
    ///
    /// The proxy is read here, at connection-establishment time, and never
    /// again for the lifetime of the connection.
    async fn connect<'a>(
        &self,
        phone_number: &str,
        proxy: Option<&'a str>,
    ) -> Result<LoginOutcome, SessionError>;

    /// Submit the second-factor code for a pending login
    async fn submit_second_factor(
        &self,
        pending: &PendingLogin,
        code: &str,
    ) -> Result<CredentialHandle, SessionError>;

    /// Close a live connection, consuming its handle
    async fn disconnect(&self, handle: CredentialHandle);

    /// Open the source media as a chunked byte stream
    async fn open_source(
        &self,
        handle: &CredentialHandle,
        source: &str,
    ) -> Result<MediaStream, TransferError>;

    /// Open an upload sink to the destination
    async fn open_sink(
        &self,
        handle: &CredentialHandle,
        destination: &str,
    ) -> Result<Box<dyn MediaSink>, TransferError>;
}

/// HTTP relay transport: streaming GET for sources, streaming PUT for
/// destinations, one proxied `reqwest::Client` per live session.
pub struct HttpRelayTransport {
    clients: RwLock<HashMap<u64, reqwest::Client>>,
    next_conn_id: AtomicU64,
    phone_re: Regex,
}

impl HttpRelayTransport {
    /// Create the transport
    ///
    /// # Errors
    ///
    /// Returns a `SessionError` if the phone-number pattern fails to compile.
    pub fn new() -> Result<Self, SessionError> {
        let phone_re = Regex::new(r"^\+?[0-9]{7,15}$")
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(Self {
            clients: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            phone_re,
        })
    }

    async fn client_for(&self, handle: &CredentialHandle) -> Result<reqwest::Client, TransferError> {
        let clients = self.clients.read().await;
        clients
            .get(&handle.conn_id())
            .cloned()
            .ok_or(TransferError::SessionUnavailable)
    }
}

/// Map an HTTP status to a transfer error, if it is one.
///
/// Rate limiting and server-side failures are worth retrying; everything
/// else that is not success is a bad link or a permission problem.
fn classify_status(status: StatusCode) -> Option<TransferError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Some(TransferError::Transient(format!("HTTP {status}")))
    } else {
        Some(TransferError::Permanent(format!("HTTP {status}")))
    }
}

/// Map a `reqwest` error to the retry taxonomy
fn classify_reqwest(e: &reqwest::Error) -> TransferError {
    if e.is_builder() || e.is_redirect() {
        TransferError::Permanent(e.to_string())
    } else {
        // Timeouts, connect failures, and mid-body resets are all
        // candidates for another attempt.
        TransferError::Transient(e.to_string())
    }
}

fn proxy_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[async_trait]
impl UserTransport for HttpRelayTransport {
    async fn connect<'a>(
        &self,
        phone_number: &str,
        proxy: Option<&'a str>,
    ) -> Result<LoginOutcome, SessionError> {
        if !self.phone_re.is_match(phone_number) {
            return Err(SessionError::Auth(
                "malformed phone number (expected international format)".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(30));
        if let Some(address) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url(address))
                .map_err(|e| SessionError::Transport(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.insert(conn_id, client);
        debug!(conn_id, "user session connection established");

        // Plain HTTP relaying has no identity-provider challenge; the
        // second-factor path exists for transports that do.
        Ok(LoginOutcome::Connected(CredentialHandle::new(conn_id)))
    }

    async fn submit_second_factor(
        &self,
        _pending: &PendingLogin,
        _code: &str,
    ) -> Result<CredentialHandle, SessionError> {
        Err(SessionError::SecondFactor(
            "this transport never requests a second factor".to_string(),
        ))
    }

    async fn disconnect(&self, handle: CredentialHandle) {
        self.clients.write().await.remove(&handle.conn_id());
        debug!(conn_id = handle.conn_id(), "user session connection closed");
    }

    async fn open_source(
        &self,
        handle: &CredentialHandle,
        source: &str,
    ) -> Result<MediaStream, TransferError> {
        let client = self.client_for(handle).await?;
        let response = client
            .get(source)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;
        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| classify_reqwest(&e)));
        Ok(Box::pin(stream))
    }

    async fn open_sink(
        &self,
        handle: &CredentialHandle,
        destination: &str,
    ) -> Result<Box<dyn MediaSink>, TransferError> {
        let client = self.client_for(handle).await?;
        let url = reqwest::Url::parse(destination)
            .map_err(|e| TransferError::Permanent(format!("invalid destination: {e}")))?;

        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let body_stream = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<Bytes, std::io::Error>(chunk), rx))
        });

        let upload = tokio::spawn(async move {
            let response = client
                .put(url)
                .body(reqwest::Body::wrap_stream(body_stream))
                .send()
                .await
                .map_err(|e| classify_reqwest(&e))?;
            match classify_status(response.status()) {
                None => Ok(()),
                Some(err) => Err(err),
            }
        });

        Ok(Box::new(HttpSink {
            tx: Some(tx),
            upload,
        }))
    }
}

struct HttpSink {
    tx: Option<mpsc::Sender<Bytes>>,
    upload: tokio::task::JoinHandle<Result<(), TransferError>>,
}

#[async_trait]
impl MediaSink for HttpSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransferError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TransferError::Permanent("sink already finished".to_string()));
        };
        if tx.send(chunk).await.is_err() {
            // The request task dropped the receiver; its result carries the
            // real error, surfaced on finish.
            return Err(TransferError::Transient(
                "upload connection closed mid-transfer".to_string(),
            ));
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), TransferError> {
        // Closing the channel ends the request body.
        self.tx.take();
        match self.upload.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Transient(format!("upload task failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_malformed_phone() {
        let transport = HttpRelayTransport::new().expect("transport");
        let err = transport
            .connect("not-a-phone", None)
            .await
            .expect_err("must reject");
        assert!(matches!(err, SessionError::Auth(_)));
    }

    #[tokio::test]
    async fn test_connect_accepts_international_phone() {
        let transport = HttpRelayTransport::new().expect("transport");
        let outcome = transport.connect("+79991234567", None).await.expect("login");
        assert!(matches!(outcome, LoginOutcome::Connected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_handle() {
        let transport = HttpRelayTransport::new().expect("transport");
        let LoginOutcome::Connected(handle) =
            transport.connect("+79991234567", None).await.expect("login")
        else {
            panic!("expected direct connection");
        };
        let conn_id = handle.conn_id();
        transport.disconnect(handle).await;

        let stale = CredentialHandle::new(conn_id);
        let err = transport
            .open_source(&stale, "http://example.org/a.mp4")
            .await
            .map(|_| ())
            .expect_err("stale handle");
        assert_eq!(err, TransferError::SessionUnavailable);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(TransferError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(TransferError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Some(TransferError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Some(TransferError::Permanent(_))
        ));
    }

    #[test]
    fn test_proxy_url_scheme_default() {
        assert_eq!(proxy_url("10.0.0.1:1080"), "http://10.0.0.1:1080");
        assert_eq!(proxy_url("socks5://1.2.3.4:1080"), "socks5://1.2.3.4:1080");
    }
}
