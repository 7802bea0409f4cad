use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{InboundDispatcher, ReplySink};
use crate::protocol::{TenantId, TransportEvent};
use crate::session::{SendError, Session, SessionState, Transport};

/// Outcome of `ensure_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// No live session existed; a new connection attempt was started.
    Created,
    /// A live session already exists; nothing was done.
    Existing,
}

/// Read-only projection of a tenant's connection state for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotStarted,
    Pending,
    Connected,
}

struct Slot {
    session: Session,
    /// Event-pump task for this session, aborted on manual close.
    pump: Option<JoinHandle<()>>,
}

/// The single authoritative map from tenant id to at most one live session.
///
/// All mutations of the map go through this type; sessions are inserted by
/// `ensure_session`, transitioned by the per-session event pump, and removed
/// on close (eviction). Cheap to clone — all state is behind `Arc`.
#[derive(Clone)]
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<InboundDispatcher>,
    sessions: Arc<RwLock<HashMap<TenantId, Slot>>>,
    next_generation: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<InboundDispatcher>) -> Self {
        Self {
            transport,
            dispatcher,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a session for `tenant_id` unless one is already live.
    ///
    /// The existence check and the placeholder insertion happen under a
    /// single write-lock acquisition, before any transport work begins, so
    /// concurrent calls for the same tenant can never race two `open`s into
    /// flight. Safe to call repeatedly from a polling client.
    pub async fn ensure_session(&self, tenant_id: &str) -> EnsureOutcome {
        let generation = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(tenant_id) {
                return EnsureOutcome::Existing;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
            sessions.insert(
                tenant_id.to_string(),
                Slot {
                    session: Session::pending(tenant_id, generation),
                    pump: None,
                },
            );
            generation
        };

        info!(tenant = %tenant_id, generation, "Starting session");
        let registry = self.clone();
        let tenant = tenant_id.to_string();
        let pump = tokio::spawn(async move { registry.run_session(tenant, generation).await });

        let mut sessions = self.sessions.write().await;
        if let Some(slot) = sessions.get_mut(tenant_id) {
            if slot.session.generation == generation {
                slot.pump = Some(pump);
            }
        }
        EnsureOutcome::Created
    }

    /// Current QR payload, present only while the session is in QrIssued.
    pub async fn qr(&self, tenant_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(tenant_id)
            .filter(|slot| slot.session.state == SessionState::QrIssued)
            .and_then(|slot| slot.session.qr_payload.clone())
    }

    /// Read-only status projection. Never triggers side effects and never
    /// waits on in-flight connection work.
    pub async fn status(&self, tenant_id: &str) -> ConnectionStatus {
        let sessions = self.sessions.read().await;
        match sessions.get(tenant_id) {
            None => ConnectionStatus::NotStarted,
            Some(slot) => match slot.session.state {
                SessionState::Connected => ConnectionStatus::Connected,
                SessionState::Pending | SessionState::QrIssued => ConnectionStatus::Pending,
            },
        }
    }

    /// Number of live sessions, for the health endpoint.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Send `text` to `recipient` on the tenant's live session. The state
    /// check happens under the read lock; the transport send happens outside
    /// it. Neither failure mode changes session state.
    pub async fn send(
        &self,
        tenant_id: &str,
        recipient: &str,
        text: &str,
    ) -> Result<(), SendError> {
        let handle = {
            let sessions = self.sessions.read().await;
            let slot = sessions
                .get(tenant_id)
                .ok_or_else(|| SendError::NotConnected(tenant_id.to_string()))?;
            if slot.session.state != SessionState::Connected {
                return Err(SendError::NotConnected(tenant_id.to_string()));
            }
            slot.session
                .handle
                .clone()
                .ok_or_else(|| SendError::NotConnected(tenant_id.to_string()))?
        };
        handle
            .send(recipient, text)
            .await
            .map_err(SendError::DeliveryFailed)
    }

    /// Manually close a tenant's session and evict it. Idempotent: closing
    /// an absent session is a no-op.
    pub async fn close_session(&self, tenant_id: &str) {
        let slot = self.sessions.write().await.remove(tenant_id);
        let Some(slot) = slot else {
            return;
        };
        info!(tenant = %tenant_id, "Session closed (manual)");
        if let Some(pump) = slot.pump {
            pump.abort();
        }
        if let Some(handle) = slot.session.handle {
            if let Err(e) = handle.close().await {
                warn!(tenant = %tenant_id, error = %e, "Transport close failed");
            }
        }
    }

    /// Close every live session. Used on shutdown.
    pub async fn close_all(&self) {
        let tenants: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for tenant_id in tenants {
            self.close_session(&tenant_id).await;
        }
    }

    /// Open the transport connection and pump its events into state
    /// transitions until the connection closes.
    ///
    /// Every effect is guarded by the session generation: if this task's
    /// session has been evicted or replaced, the stale continuation stops
    /// without touching the successor.
    async fn run_session(self, tenant_id: String, generation: u64) {
        let (handle, mut events) = match self.transport.open(&tenant_id).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Transport open failed");
                self.evict(&tenant_id, generation, "open_failed").await;
                return;
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&tenant_id) {
                Some(slot) if slot.session.generation == generation => {
                    slot.session.handle = Some(handle.clone());
                }
                _ => {
                    // Evicted while the transport was opening.
                    drop(sessions);
                    if let Err(e) = handle.close().await {
                        debug!(tenant = %tenant_id, error = %e, "Close after stale open failed");
                    }
                    return;
                }
            }
        }

        loop {
            match events.recv().await {
                Some(TransportEvent::Qr { payload }) => {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get_mut(&tenant_id) {
                        Some(slot) if slot.session.generation == generation => {
                            if slot.session.apply_qr(payload) {
                                info!(tenant = %tenant_id, "QR issued");
                            } else {
                                debug!(tenant = %tenant_id, "QR event while connected, ignored");
                            }
                        }
                        _ => break,
                    }
                }
                Some(TransportEvent::Connected) => {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get_mut(&tenant_id) {
                        Some(slot) if slot.session.generation == generation => {
                            slot.session.apply_connected();
                            info!(tenant = %tenant_id, "Session connected");
                        }
                        _ => break,
                    }
                }
                Some(TransportEvent::Message { sender, text }) => {
                    // One task per message: a failing or slow reply never
                    // stalls this pump or other messages.
                    let registry = self.clone();
                    let dispatcher = self.dispatcher.clone();
                    let tenant = tenant_id.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(&registry, &tenant, &sender, &text).await;
                    });
                }
                Some(TransportEvent::Closed { reason }) => {
                    self.evict(&tenant_id, generation, &reason).await;
                    break;
                }
                // Stream end without a Closed event (transport crashed).
                None => {
                    self.evict(&tenant_id, generation, "transport").await;
                    break;
                }
            }
        }
    }

    /// Remove the tenant's entry if it still belongs to `generation`,
    /// releasing the transport handle. A later `ensure_session` starts
    /// fresh.
    async fn evict(&self, tenant_id: &str, generation: u64, reason: &str) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions
                .get(tenant_id)
                .is_some_and(|slot| slot.session.generation == generation);
            if owned {
                sessions.remove(tenant_id)
            } else {
                None
            }
        };
        if let Some(slot) = removed {
            info!(tenant = %tenant_id, reason, "Session evicted");
            if let Some(handle) = slot.session.handle {
                if let Err(e) = handle.close().await {
                    debug!(tenant = %tenant_id, error = %e, "Transport close after eviction failed");
                }
            }
        }
    }
}

#[async_trait]
impl ReplySink for SessionRegistry {
    async fn reply(&self, tenant_id: &str, recipient: &str, text: &str) -> Result<(), SendError> {
        self.send(tenant_id, recipient, text).await
    }
}
