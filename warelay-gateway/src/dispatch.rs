use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::session::SendError;

/// Fixed reply used whenever a generation cannot be produced in time.
/// Matches the responder's own degraded-path string so chat users see one
/// consistent failure message.
pub const REPLY_FALLBACK: &str =
    "Hubo un error al procesar el mensaje. Por favor, inténtalo de nuevo más tarde.";

/// The text-generation collaborator. `answer` never fails: implementations
/// degrade to a fixed fallback string on upstream errors. It may be slow,
/// which is why the dispatcher bounds it with a timeout.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn answer(&self, message: &str, context: &str) -> String;
}

/// Where replies go. The session registry implements this over the live
/// transport; tests substitute a recording sink.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, tenant_id: &str, recipient: &str, text: &str) -> Result<(), SendError>;
}

/// Reacts to one inbound message: resolves the tenant's grounding context,
/// asks the responder for a reply, and sends it back over the same session.
///
/// Every failure mode is absorbed here — a slow responder yields the
/// fallback reply, a failed send is logged — so one bad message never takes
/// down the session or stalls other messages.
pub struct InboundDispatcher {
    store: Arc<dyn CredentialStore>,
    responder: Arc<dyn Responder>,
    reply_timeout: Duration,
}

impl InboundDispatcher {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        responder: Arc<dyn Responder>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            store,
            responder,
            reply_timeout,
        }
    }

    pub async fn dispatch(&self, sink: &dyn ReplySink, tenant_id: &str, sender: &str, text: &str) {
        debug!(tenant = %tenant_id, sender = %sender, "Inbound message");

        let context = self
            .store
            .find_tenant(tenant_id)
            .await
            .map(|t| t.grounding_context)
            .unwrap_or_default();

        let reply = match timeout(self.reply_timeout, self.responder.answer(text, &context)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(tenant = %tenant_id, "Responder timed out, sending fallback reply");
                REPLY_FALLBACK.to_string()
            }
        };

        if let Err(e) = sink.reply(tenant_id, sender, &reply).await {
            warn!(tenant = %tenant_id, sender = %sender, error = %e, "Failed to deliver reply");
        }
    }
}
