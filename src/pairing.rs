//! Device-pairing flow.
//!
//! Builds a fresh, session-less socket adapter, requests a numeric
//! pairing code for a phone number, and tears the temporary connection
//! down unconditionally — success and failure paths both — before
//! returning or re-raising. The caller completes pairing on the
//! physical device within the code's validity window.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transport::socket::{SocketConfig, SocketTransport};
use crate::transport::{Transport, TransportError};

/// The slice of the socket adapter the flow needs. A seam so the
/// unconditional-teardown guarantee is testable with a mock.
#[async_trait]
pub trait PairingPort: Send + Sync {
    /// Open the throwaway connection.
    async fn connect(&self) -> Result<(), TransportError>;
    /// Request the numeric code for `number`.
    async fn request_code(&self, number: &str) -> Result<String, TransportError>;
    /// Tear the throwaway connection down.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl PairingPort for SocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Transport::connect(self).await
    }

    async fn request_code(&self, number: &str) -> Result<String, TransportError> {
        self.request_pairing_code(number).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Transport::disconnect(self).await
    }
}

/// Request a pairing code via a fresh session-less socket adapter.
///
/// # Errors
///
/// Returns an error when the number is invalid, the throwaway
/// connection cannot be established, or the gateway rejects the
/// request. The temporary connection is torn down in every case.
pub async fn request_pairing_code(
    config: SocketConfig,
    number: &str,
) -> Result<String, TransportError> {
    let digits = crate::jid::digits(number);
    if digits.is_empty() {
        return Err(TransportError::Pairing(format!(
            "number {number:?} contains no digits"
        )));
    }

    // The ephemeral adapter's events have no consumer; a small buffer
    // absorbs the handshake events until teardown.
    let (events_tx, _events_rx) = mpsc::channel(16);
    let adapter = SocketTransport::ephemeral(config, events_tx);
    let code = request_with(&adapter, &digits).await?;
    info!(number = %digits, "pairing code issued");
    Ok(code)
}

/// Connect, request, and always tear down.
pub(crate) async fn request_with<P: PairingPort>(
    port: &P,
    number: &str,
) -> Result<String, TransportError> {
    let result = async {
        port.connect().await?;
        debug!(number, "requesting pairing code");
        port.request_code(number).await
    }
    .await;

    // Teardown runs on every path, including a failed connect that may
    // have left partial resources behind.
    if let Err(e) = port.disconnect().await {
        warn!(error = %e, "failed to tear down temporary pairing connection");
    }
    result
}
