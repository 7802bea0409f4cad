use serde::{Deserialize, Serialize};

/// Type alias for tenant identifiers.
pub type TenantId = String;

/// Wire version of the newline-delimited JSON protocol spoken with the
/// messaging bridge sidecar.
pub const BRIDGE_PROTOCOL_VERSION: &str = "2026-08-01";

/// Events emitted by the messaging transport for one tenant's connection.
///
/// The bridge writes one JSON object per line on stdout; the same enum is
/// what a `Transport` implementation feeds into the session registry's
/// event pump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TransportEvent {
    /// A fresh authentication QR payload. Reissued when the previous one
    /// expires before being scanned.
    Qr { payload: String },
    /// The handshake completed; the connection is live.
    Connected,
    /// The connection ended. Terminal for this handshake attempt.
    Closed { reason: String },
    /// An inbound chat message on the live connection.
    Message { sender: String, text: String },
}

/// Commands written to the bridge sidecar's stdin, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BridgeCommand {
    /// Deliver `text` to `recipient` over the live connection.
    Send { recipient: String, text: String },
    /// Release the connection and exit.
    Close,
}
