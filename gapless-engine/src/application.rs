/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Application callback interface.
//!
//! The session layer surfaces exactly four things to its owner: session
//! establishment, ordered application deliveries, non-terminal faults, and
//! terminal disconnects. Every failure callback carries the session identity
//! and the state at the time of failure.

use async_trait::async_trait;
use gapless_core::error::SessionFailure;
use gapless_core::types::SessionKey;
use gapless_core::wire::WireMessage;
use gapless_session::DisconnectReason;

/// Callback interface for session events.
///
/// Deliveries for one session arrive in strict sequence order: a message is
/// never delivered before every lower sequence number has been delivered or
/// gap-filled, and a replayed sequence number is delivered exactly once.
#[async_trait]
pub trait Application: Send + Sync {
    /// Called when the logon handshake completes.
    async fn on_session_established(&self, key: &SessionKey);

    /// Called when a session reaches its terminal state.
    async fn on_session_terminated(&self, key: &SessionKey, reason: &DisconnectReason);

    /// Called for each in-order application message.
    async fn on_message(&self, key: &SessionKey, message: &WireMessage);

    /// Called for non-terminal failures (store faults, peer rejects).
    async fn on_fault(&self, failure: &SessionFailure);
}

/// Default no-op application implementation.
#[derive(Debug, Default)]
pub struct NoOpApplication;

#[async_trait]
impl Application for NoOpApplication {
    async fn on_session_established(&self, _key: &SessionKey) {}

    async fn on_session_terminated(&self, _key: &SessionKey, _reason: &DisconnectReason) {}

    async fn on_message(&self, _key: &SessionKey, _message: &WireMessage) {}

    async fn on_fault(&self, _failure: &SessionFailure) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapless_core::types::CompId;

    #[tokio::test]
    async fn test_noop_application() {
        let app = NoOpApplication;
        let key = SessionKey::new(
            "FIX.4.4",
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
        );

        app.on_session_established(&key).await;
        app.on_session_terminated(&key, &DisconnectReason::LogoutComplete)
            .await;
    }
}
