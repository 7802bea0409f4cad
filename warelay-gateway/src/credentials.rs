use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::verify_secret;

/// One registered account: identity, secret, and the free-text grounding
/// context fed to the responder. Field names on the wire and on disk match
/// the original registration API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    #[serde(rename = "usuario")]
    pub id: String,
    #[serde(rename = "contraseña")]
    pub secret: String,
    #[serde(rename = "contexto", default)]
    pub grounding_context: String,
}

impl Tenant {
    /// Constant-time check of a presented secret against this tenant's.
    pub fn verify(&self, presented: &str) -> bool {
        verify_secret(&self.secret, presented)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tenant '{0}' already exists")]
    DuplicateTenant(String),
    #[error("failed to persist tenant store: {0}")]
    Persist(#[source] anyhow::Error),
}

/// The credential store collaborator: a flat tenant list keyed by id.
///
/// `append_tenant` must reject duplicate ids and must not leave the
/// in-memory list and the persisted list diverged on failure.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_tenant(&self, id: &str) -> Option<Tenant>;
    async fn append_tenant(&self, tenant: Tenant) -> Result<(), StoreError>;
}
