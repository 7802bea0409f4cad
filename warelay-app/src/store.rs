//! File-backed credential store.
//!
//! The tenant list lives in one flat JSON file (the original deployment's
//! `usuarios.json` format) and is rewritten wholesale on every
//! registration, via a temp file and an atomic rename. The file is written
//! *before* the in-memory list is updated, so a failed write never leaves
//! memory and disk diverged.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;

use warelay_gateway::credentials::{CredentialStore, StoreError, Tenant};

pub struct FileCredentialStore {
    path: PathBuf,
    tenants: RwLock<Vec<Tenant>>,
}

impl FileCredentialStore {
    /// Open the store, loading any existing tenant file. A missing or empty
    /// file is an empty store; it will be created on the first registration.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tenants = Self::load_tenants(&path)?;
        if !tenants.is_empty() {
            tracing::info!(
                count = tenants.len(),
                path = %path.display(),
                "Loaded tenants"
            );
        }
        Ok(Self {
            path,
            tenants: RwLock::new(tenants),
        })
    }

    fn load_tenants(path: &Path) -> anyhow::Result<Vec<Tenant>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read tenant store '{}'", path.display()))?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse tenant store '{}'", path.display()))
    }

    fn persist(&self, tenants: &[Tenant]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory '{}'", parent.display())
                })?;
            }
        }

        let serialized =
            serde_json::to_vec_pretty(tenants).context("Failed to serialize tenant store")?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)
            .with_context(|| format!("Failed to write temp store '{}'", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed to atomically replace tenant store '{}'",
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn find_tenant(&self, id: &str) -> Option<Tenant> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants.iter().find(|t| t.id == id).cloned()
    }

    async fn append_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        if tenants.iter().any(|t| t.id == tenant.id) {
            return Err(StoreError::DuplicateTenant(tenant.id));
        }

        // Persist the candidate list first; only adopt it in memory once
        // the file is safely on disk.
        let mut candidate = tenants.clone();
        candidate.push(tenant);
        self.persist(&candidate).map_err(StoreError::Persist)?;
        *tenants = candidate;
        Ok(())
    }
}
