use std::time::Instant;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::TransportEvent;

/// Lifecycle state of one tenant's messaging connection.
///
/// There is no `Closed` variant: a closed session is evicted from the
/// registry, so "no entry" and "closed" are externally equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection attempt initiated, no QR issued yet.
    Pending,
    /// A QR payload is available for scanning. Re-entered each time the
    /// payload expires and is reissued.
    QrIssued,
    /// Handshake completed; messages flow.
    Connected,
}

/// Outcome of a send attempt on a session. Neither variant changes the
/// session's state.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("session for tenant '{0}' is not connected")]
    NotConnected(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(#[source] anyhow::Error),
}

/// Live handle to a tenant's transport connection. Cloneable via `Arc` so
/// sends can happen outside the registry lock.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Attempt delivery over the live connection.
    async fn send(&self, recipient: &str, text: &str) -> anyhow::Result<()>;
    /// Release the connection. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Factory for per-tenant transport connections.
///
/// `open` initiates the connection attempt and returns immediately; all
/// further progress (QR issuance, handshake completion, inbound messages,
/// closure) arrives on the event receiver. The registry treats the end of
/// the event stream as an implicit close.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<(Arc<dyn TransportHandle>, mpsc::Receiver<TransportEvent>)>;
}

/// One tenant's session record, owned exclusively by the registry.
///
/// The registry is the only writer of these fields; the `generation` tags
/// every async continuation spawned for this session so a stale opener or
/// event pump can never mutate a successor session for the same tenant.
pub struct Session {
    pub tenant_id: String,
    pub generation: u64,
    pub state: SessionState,
    /// Present only while `state == QrIssued`.
    pub qr_payload: Option<String>,
    /// Present once the transport's `open` completed.
    pub handle: Option<Arc<dyn TransportHandle>>,
    pub created_at: Instant,
    pub last_transition_at: Instant,
}

impl Session {
    pub fn pending(tenant_id: &str, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            tenant_id: tenant_id.to_string(),
            generation,
            state: SessionState::Pending,
            qr_payload: None,
            handle: None,
            created_at: now,
            last_transition_at: now,
        }
    }

    /// Apply a QR issuance. Replacing an existing payload is the normal
    /// expiry/reissue path. Ignored once connected.
    pub fn apply_qr(&mut self, payload: String) -> bool {
        if self.state == SessionState::Connected {
            return false;
        }
        self.state = SessionState::QrIssued;
        self.qr_payload = Some(payload);
        self.last_transition_at = Instant::now();
        true
    }

    /// Apply handshake completion. Clears the QR payload in the same step.
    pub fn apply_connected(&mut self) {
        self.state = SessionState::Connected;
        self.qr_payload = None;
        self.last_transition_at = Instant::now();
    }
}
