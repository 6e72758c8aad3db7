/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session configuration.
//!
//! Configuration is consumed, not owned, by the session core: loading it
//! from files or environment is an external concern.

use chrono::NaiveTime;
use gapless_core::types::{CompId, MsgKind, SessionKey};
use std::time::Duration;

/// Which side of the connection this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We connect and send the first Logon.
    Initiator,
    /// We wait for the counterparty's Logon.
    Acceptor,
}

/// Ordering of the durable append relative to the transmit.
///
/// This is an explicit choice with no default: write-then-send makes the
/// append a precondition of the transmit; send-then-confirm transmits first
/// and surfaces a fault if the confirming append fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityOrder {
    /// Append durably, then transmit.
    WriteThenSend,
    /// Transmit, then append; a failed append is surfaced as a fault.
    SendThenConfirm,
}

/// What to do with sequence numbers across a transport reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePolicy {
    /// Resume from the persisted sequence record.
    Continue,
    /// Start both directions from 1 and clear the log.
    Reset,
}

/// How to react when the message store cannot serve the resend flow.
///
/// The engine never fabricates sequence numbers or skips gaps; it either
/// holds position or disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFaultAction {
    /// Surface the failure and keep the session where it is.
    Hold,
    /// Disconnect with the store failure as the reason.
    Disconnect,
}

/// Default resendable predicate: application messages are resent verbatim,
/// administrative messages are gap-filled.
fn resend_app_only(kind: &MsgKind) -> bool {
    kind.is_app()
}

/// Configuration for one FIX session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Our CompID (tag 49).
    pub sender_comp_id: CompId,
    /// Counterparty CompID (tag 56).
    pub target_comp_id: CompId,
    /// FIX version BeginString (e.g., "FIX.4.4").
    pub begin_string: String,
    /// Role played by this side.
    pub role: SessionRole,
    /// Durable-append ordering for outbound sends.
    pub durability: DurabilityOrder,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Window the peer has to answer a TestRequest.
    pub response_timeout: Duration,
    /// Logon handshake timeout.
    pub logon_timeout: Duration,
    /// Logout confirmation timeout.
    pub logout_timeout: Duration,
    /// Resend chunk size in sequence slots; 0 means unbounded.
    pub resend_chunk_size: u32,
    /// Sequence handling across reconnects.
    pub sequence_policy: SequencePolicy,
    /// Whether to request a sequence reset at logon (tag 141).
    pub reset_on_logon: bool,
    /// Optional time-of-day sequence reset (UTC).
    pub daily_reset_time: Option<NaiveTime>,
    /// Reaction to store failures in the resend flow.
    pub store_fault_action: StoreFaultAction,
    /// Whether administrative messages are appended to the log. When false
    /// their slots gap-fill on replay.
    pub persist_admin: bool,
    /// Whether inbound messages are journaled for audit.
    pub persist_inbound: bool,
    /// Predicate selecting message kinds resent verbatim; others gap-fill.
    pub resendable: fn(&MsgKind) -> bool,
    /// Whether to validate inbound checksums.
    pub validate_checksum: bool,
    /// Optional sender sub ID (tag 50).
    pub sender_sub_id: Option<String>,
    /// Optional target sub ID (tag 57).
    pub target_sub_id: Option<String>,
}

impl SessionConfig {
    /// Creates a configuration with required fields.
    ///
    /// # Arguments
    /// * `sender_comp_id` - Our CompID
    /// * `target_comp_id` - Counterparty CompID
    /// * `begin_string` - FIX version string
    /// * `durability` - Durable-append ordering; deliberately not defaulted
    #[must_use]
    pub fn new(
        sender_comp_id: CompId,
        target_comp_id: CompId,
        begin_string: impl Into<String>,
        durability: DurabilityOrder,
    ) -> Self {
        Self {
            sender_comp_id,
            target_comp_id,
            begin_string: begin_string.into(),
            role: SessionRole::Initiator,
            durability,
            heartbeat_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            logon_timeout: Duration::from_secs(10),
            logout_timeout: Duration::from_secs(10),
            resend_chunk_size: 0,
            sequence_policy: SequencePolicy::Continue,
            reset_on_logon: false,
            daily_reset_time: None,
            store_fault_action: StoreFaultAction::Disconnect,
            persist_admin: false,
            persist_inbound: false,
            resendable: resend_app_only,
            validate_checksum: true,
            sender_sub_id: None,
            target_sub_id: None,
        }
    }

    /// Sets the session role.
    #[must_use]
    pub const fn with_role(mut self, role: SessionRole) -> Self {
        self.role = role;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the TestRequest response timeout.
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the resend chunk size (0 = unbounded).
    #[must_use]
    pub const fn with_resend_chunk_size(mut self, chunk_size: u32) -> Self {
        self.resend_chunk_size = chunk_size;
        self
    }

    /// Sets the sequence policy for reconnects.
    #[must_use]
    pub const fn with_sequence_policy(mut self, policy: SequencePolicy) -> Self {
        self.sequence_policy = policy;
        self
    }

    /// Sets whether to request a sequence reset at logon.
    #[must_use]
    pub const fn with_reset_on_logon(mut self, reset: bool) -> Self {
        self.reset_on_logon = reset;
        self
    }

    /// Sets the daily sequence reset time (UTC).
    #[must_use]
    pub const fn with_daily_reset_time(mut self, time: NaiveTime) -> Self {
        self.daily_reset_time = Some(time);
        self
    }

    /// Sets the store fault reaction.
    #[must_use]
    pub const fn with_store_fault_action(mut self, action: StoreFaultAction) -> Self {
        self.store_fault_action = action;
        self
    }

    /// Sets whether administrative messages are persisted.
    #[must_use]
    pub const fn with_persist_admin(mut self, persist: bool) -> Self {
        self.persist_admin = persist;
        self
    }

    /// Sets whether inbound messages are journaled.
    #[must_use]
    pub const fn with_persist_inbound(mut self, persist: bool) -> Self {
        self.persist_inbound = persist;
        self
    }

    /// Sets the resendable-message predicate.
    #[must_use]
    pub fn with_resendable(mut self, resendable: fn(&MsgKind) -> bool) -> Self {
        self.resendable = resendable;
        self
    }

    /// Sets the sender sub ID.
    #[must_use]
    pub fn with_sender_sub_id(mut self, sub: impl Into<String>) -> Self {
        self.sender_sub_id = Some(sub.into());
        self
    }

    /// Sets the target sub ID.
    #[must_use]
    pub fn with_target_sub_id(mut self, sub: impl Into<String>) -> Self {
        self.target_sub_id = Some(sub.into());
        self
    }

    /// Builds the session key for this configuration.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        let mut key = SessionKey::new(
            self.begin_string.clone(),
            self.sender_comp_id.clone(),
            self.target_comp_id.clone(),
        );
        if let Some(sub) = &self.sender_sub_id {
            key = key.with_sender_sub(sub.clone());
        }
        if let Some(sub) = &self.target_sub_id {
            key = key.with_target_sub(sub.clone());
        }
        key
    }

    /// Returns the heartbeat interval in whole seconds, as carried in tag 108.
    #[must_use]
    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.heartbeat_interval.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SessionConfig {
        SessionConfig::new(
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
            "FIX.4.4",
            DurabilityOrder::WriteThenSend,
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = base_config();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.resend_chunk_size, 0);
        assert_eq!(config.sequence_policy, SequencePolicy::Continue);
        assert!(!config.reset_on_logon);
        assert!(!config.persist_admin);
        assert!(config.validate_checksum);
    }

    #[test]
    fn test_default_resendable_predicate() {
        let config = base_config();
        assert!((config.resendable)(&MsgKind::App("D".to_string())));
        assert!(!(config.resendable)(&MsgKind::Heartbeat));
        assert!(!(config.resendable)(&MsgKind::Logon));
    }

    #[test]
    fn test_fluent_setters() {
        let config = base_config()
            .with_role(SessionRole::Acceptor)
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_resend_chunk_size(100)
            .with_reset_on_logon(true);

        assert_eq!(config.role, SessionRole::Acceptor);
        assert_eq!(config.heartbeat_interval_secs(), 60);
        assert_eq!(config.resend_chunk_size, 100);
        assert!(config.reset_on_logon);
    }

    #[test]
    fn test_session_key_includes_sub_ids() {
        let config = base_config().with_sender_sub_id("DESK");
        let key = config.session_key();
        assert_eq!(key.sender_sub.as_deref(), Some("DESK"));
        assert_eq!(key.sender.as_str(), "SENDER");
    }
}
