//! Session lifecycle core for warelay: per-tenant messaging sessions, the
//! registry that owns them, the inbound-message dispatcher, and the thin
//! HTTP surface. Transport, credential storage, reply generation, and QR
//! rendering are trait seams filled in by `warelay-app`.

pub mod auth;
pub mod credentials;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use credentials::{CredentialStore, StoreError, Tenant};
pub use dispatch::{InboundDispatcher, Responder};
pub use registry::{ConnectionStatus, EnsureOutcome, SessionRegistry};
pub use session::{SendError, SessionState, Transport, TransportHandle};
