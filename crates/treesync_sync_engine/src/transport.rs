//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use treesync_sync_protocol::{
    decode_response, encode_request, FrameHandler, SyncRequest, SyncResponse,
};

/// Carries requests to the authority and brings back its responses.
///
/// Refusals ([`SyncResponse::Error`]) are returned as
/// [`SyncError::Rejected`], so callers only ever see successful responses.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Sends one request and waits for its response.
    async fn request(&self, request: SyncRequest) -> SyncResult<SyncResponse>;

    /// Checks if the transport believes it can reach the authority.
    fn is_connected(&self) -> bool;
}

/// Moves opaque frames to the authority and back.
///
/// Implement this to carry TreeSync over a real network.
#[async_trait]
pub trait FrameClient: Send + Sync {
    /// Sends a request frame and returns the response frame.
    async fn exchange(&self, frame: Vec<u8>) -> SyncResult<Vec<u8>>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// CBOR-framed transport over a [`FrameClient`].
pub struct FramedTransport<C: FrameClient> {
    client: C,
    timeout: Duration,
    last_error: Mutex<Option<String>>,
}

impl<C: FrameClient> FramedTransport<C> {
    /// Creates a transport with a 30 second request timeout.
    pub fn new(client: C) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(30),
            last_error: Mutex::new(None),
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The frame client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    async fn exchange(&self, frame: Vec<u8>) -> SyncResult<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.client.exchange(frame)).await {
            Ok(Ok(bytes)) => {
                *self.last_error.lock() = None;
                Ok(bytes)
            }
            Ok(Err(err)) => {
                *self.last_error.lock() = Some(err.to_string());
                Err(err)
            }
            Err(_) => {
                *self.last_error.lock() = Some("request timed out".into());
                Err(SyncError::Timeout)
            }
        }
    }
}

#[async_trait]
impl<C: FrameClient> SyncTransport for FramedTransport<C> {
    async fn request(&self, request: SyncRequest) -> SyncResult<SyncResponse> {
        if !self.client.is_healthy() {
            return Err(SyncError::NotConnected);
        }
        let frame = encode_request(&request)?;
        let bytes = self.exchange(frame).await?;
        match decode_response(&bytes)? {
            SyncResponse::Error { code, message } => Err(SyncError::Rejected { code, message }),
            response => Ok(response),
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_healthy()
    }
}

/// In-process frame client calling a [`FrameHandler`] directly.
///
/// Clones share the online switch and the failure counter, so a test can
/// keep a clone and cut the link under a running connection.
pub struct LoopbackClient<H: FrameHandler + ?Sized> {
    handler: Arc<H>,
    online: Arc<AtomicBool>,
    failures: Arc<AtomicU32>,
    exchanged: Arc<AtomicU64>,
}

impl<H: FrameHandler + ?Sized> LoopbackClient<H> {
    /// Creates an online client for `handler`.
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            online: Arc::new(AtomicBool::new(true)),
            failures: Arc::new(AtomicU32::new(0)),
            exchanged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connects or disconnects the link.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns true if the link is up.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Makes the next `count` exchanges fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of frames delivered to the handler.
    pub fn exchanged(&self) -> u64 {
        self.exchanged.load(Ordering::SeqCst)
    }
}

impl<H: FrameHandler + ?Sized> Clone for LoopbackClient<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            online: Arc::clone(&self.online),
            failures: Arc::clone(&self.failures),
            exchanged: Arc::clone(&self.exchanged),
        }
    }
}

#[async_trait]
impl<H: FrameHandler + ?Sized + 'static> FrameClient for LoopbackClient<H> {
    async fn exchange(&self, frame: Vec<u8>) -> SyncResult<Vec<u8>> {
        if !self.is_online() {
            return Err(SyncError::transport_retryable("loopback link is down"));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::transport_retryable("injected loopback failure"));
        }
        self.exchanged.fetch_add(1, Ordering::SeqCst);
        Ok(self.handler.handle_frame(&frame))
    }

    fn is_healthy(&self) -> bool {
        self.is_online()
    }
}
