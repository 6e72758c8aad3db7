/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session state machine.
//!
//! One [`SessionStateMachine`] instance owns one session. It consumes
//! inbound wire messages, tick events, and local commands, and emits
//! [`Action`]s: bytes to transmit, ordered application deliveries, and
//! lifecycle notifications. It performs no I/O of its own beyond the message
//! store; all timeouts are evaluated against externally supplied clock
//! instants.
//!
//! The state is an explicit tagged enum. Every (state, event) pair has a
//! defined outcome, including the pairs that are ignored in a given state.
//!
//! Ordering guarantee: an application message is never delivered before
//! every lower sequence number has been delivered or explicitly gap-filled.
//! Inbound traffic above an open gap is held in a sequence-ordered buffer
//! and drained as the gap fills. The two exceptions, per standard FIX
//! session rules, are inbound ResendRequest and Logout, which are honored
//! immediately.

use crate::chunker::{RequestId, ResendChunker};
use crate::config::{DurabilityOrder, SequencePolicy, SessionConfig, SessionRole, StoreFaultAction};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::sequence::{SeqStatus, SequenceTracker};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use gapless_core::error::{EngineError, SessionError, SessionFailure, StoreError};
use gapless_core::types::{MsgKind, SeqNum, SeqRange, SessionKey, Timestamp};
use gapless_core::wire::{self, MessageBuilder, WireMessage, tags};
use gapless_store::{LogRecord, MessageStore, SessionRecord};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Why a session reached `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Clean logout handshake (or logout confirmation timeout).
    LogoutComplete,
    /// Logon was rejected or timed out before the session became Active.
    LogonRejected {
        /// Reason for the rejection.
        reason: String,
    },
    /// Session-fatal inbound contract violation.
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },
    /// Liveness failure: no answer to a TestRequest.
    HeartbeatTimeout {
        /// Milliseconds of inbound silence.
        elapsed_ms: u64,
    },
    /// The message store could not serve the session.
    StoreUnavailable {
        /// The underlying store failure.
        error: StoreError,
    },
    /// The transport dropped; sequence state is preserved for reconnect.
    TransportFailure,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogoutComplete => write!(f, "logout complete"),
            Self::LogonRejected { reason } => write!(f, "logon rejected: {reason}"),
            Self::ProtocolViolation { reason } => write!(f, "protocol violation: {reason}"),
            Self::HeartbeatTimeout { elapsed_ms } => {
                write!(f, "heartbeat timeout after {elapsed_ms} ms")
            }
            Self::StoreUnavailable { error } => write!(f, "store unavailable: {error}"),
            Self::TransportFailure => write!(f, "transport failure"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Transport attach pending; no Logon exchanged yet.
    Connecting,
    /// Our Logon is out, awaiting the counterparty's.
    LogonPending {
        /// When the Logon was sent.
        sent_at: Instant,
    },
    /// Session established, sequences in order.
    Active,
    /// Established, with an inbound gap being recovered. Substate of Active:
    /// outbound traffic and resend servicing continue.
    PendingResend {
        /// The recovery plan covering the gap.
        request: RequestId,
        /// The missing range at the time the gap was observed.
        range: SeqRange,
        /// Index of the highest chunk whose ResendRequest has been emitted.
        requested_chunk: usize,
    },
    /// Logout sent, awaiting confirmation.
    LogoutPending {
        /// When the Logout was sent.
        sent_at: Instant,
        /// Whether we initiated the logout.
        initiated_locally: bool,
    },
    /// Terminal.
    Disconnected {
        /// Why the session ended.
        reason: DisconnectReason,
    },
}

impl SessionState {
    /// Returns the state name used in logs and persisted records.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::LogonPending { .. } => "LogonPending",
            Self::Active => "Active",
            Self::PendingResend { .. } => "PendingResend",
            Self::LogoutPending { .. } => "LogoutPending",
            Self::Disconnected { .. } => "Disconnected",
        }
    }

    /// Returns true for Active and its PendingResend substate.
    #[must_use]
    pub const fn is_established(&self) -> bool {
        matches!(self, Self::Active | Self::PendingResend { .. })
    }
}

/// Output of one state machine step.
#[derive(Debug, Clone)]
pub enum Action {
    /// Framed bytes to hand to the transport.
    Transmit(Bytes),
    /// Ordered application-level delivery.
    Deliver(WireMessage),
    /// The logon handshake completed.
    Established,
    /// A non-terminal failure surfaced to the session owner.
    Fault(SessionFailure),
    /// The session reached its terminal state.
    Terminated(DisconnectReason),
}

/// Externally delivered clock event.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// Monotonic instant for interval arithmetic.
    pub now: Instant,
    /// Wall-clock time for time-of-day rules.
    pub wall: DateTime<Utc>,
}

impl Tick {
    /// Creates a tick.
    #[must_use]
    pub const fn at(now: Instant, wall: DateTime<Utc>) -> Self {
        Self { now, wall }
    }
}

/// Result of one outbound send.
struct Sent {
    bytes: Bytes,
    fault: Option<SessionError>,
}

/// The session protocol core for one counterparty relationship.
///
/// Single-writer discipline: exactly one logical executor may drive a given
/// instance at a time.
pub struct SessionStateMachine {
    key: SessionKey,
    config: SessionConfig,
    state: SessionState,
    sequences: SequenceTracker,
    chunker: ResendChunker,
    heartbeat: HeartbeatMonitor,
    store: Arc<dyn MessageStore>,
    /// Inbound messages above an open gap, keyed by sequence number.
    held: BTreeMap<u64, WireMessage>,
    /// Incomplete plan servicing a counterparty's ResendRequest, if any.
    outbound_service: Option<RequestId>,
    /// Last day the time-of-day reset was considered handled.
    last_reset_day: Option<NaiveDate>,
}

impl fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStateMachine")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("sequences", &self.sequences)
            .finish_non_exhaustive()
    }
}

impl SessionStateMachine {
    /// Creates a state machine in `Connecting`.
    ///
    /// Under the `Continue` policy the sequence counters resume from the
    /// persisted session record; under `Reset` the store is cleared and both
    /// directions start at 1.
    ///
    /// # Errors
    /// Returns `EngineError` if the store cannot be consulted.
    pub async fn new(
        config: SessionConfig,
        store: Arc<dyn MessageStore>,
        now: Instant,
    ) -> Result<Self, EngineError> {
        let key = config.session_key();
        let sequences = match config.sequence_policy {
            SequencePolicy::Continue => match store.load_session(&key).await? {
                Some(record) => {
                    tracing::info!(
                        session = %key,
                        next_outbound = record.next_outbound,
                        next_inbound = record.next_inbound,
                        "resuming session sequences"
                    );
                    SequenceTracker::with_initial(record.next_outbound, record.next_inbound)
                }
                None => SequenceTracker::new(),
            },
            SequencePolicy::Reset => {
                store.reset(&key).await?;
                SequenceTracker::new()
            }
        };
        let heartbeat =
            HeartbeatMonitor::new(config.heartbeat_interval, config.response_timeout, now);
        let chunker = ResendChunker::new(config.resend_chunk_size);

        Ok(Self {
            key,
            config,
            state: SessionState::Connecting,
            sequences,
            chunker,
            heartbeat,
            store,
            held: BTreeMap::new(),
            outbound_service: None,
            last_reset_day: None,
        })
    }

    /// Returns the session identity.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns the sequence tracker.
    #[must_use]
    pub fn sequences(&self) -> &SequenceTracker {
        &self.sequences
    }

    /// The transport is attached. An initiator sends its Logon; an acceptor
    /// waits. Ignored in every other state.
    ///
    /// # Errors
    /// Returns `EngineError` if the durable send fails under write-then-send.
    pub async fn on_connected(&mut self, now: Instant) -> Result<Vec<Action>, EngineError> {
        let mut actions = Vec::new();
        match (&self.state, self.config.role) {
            (SessionState::Connecting, SessionRole::Initiator) => {
                if self.config.reset_on_logon {
                    self.sequences.reset();
                    if let Err(err) = self.store.reset(&self.key).await {
                        self.store_fault(err, &mut actions).await;
                        return Ok(actions);
                    }
                }
                let heartbeat_secs = self.config.heartbeat_interval_secs();
                let reset = self.config.reset_on_logon;
                let sent = self
                    .send_message(now, &MsgKind::Logon, |b| {
                        b.put_u64(tags::HEART_BT_INT, heartbeat_secs);
                        if reset {
                            b.put_bool(tags::RESET_SEQ_NUM_FLAG, true);
                        }
                    })
                    .await?;
                self.push_sent(sent, &mut actions);
                self.state = SessionState::LogonPending { sent_at: now };
                tracing::info!(session = %self.key, "logon sent");
            }
            (SessionState::Connecting, SessionRole::Acceptor) => {}
            _ => {
                tracing::debug!(session = %self.key, state = self.state.name(), "on_connected ignored");
            }
        }
        Ok(actions)
    }

    /// Processes one inbound framed message.
    ///
    /// # Errors
    /// Returns `EngineError` if a durable send fails under write-then-send.
    pub async fn on_message(&mut self, bytes: Bytes) -> Result<Vec<Action>, EngineError> {
        let mut actions = Vec::new();
        let now = Instant::now();

        let msg = match WireMessage::parse(bytes, self.config.validate_checksum) {
            Ok(msg) => msg,
            Err(err) => {
                self.protocol_violation(format!("malformed message: {err}"), now, &mut actions)
                    .await;
                return Ok(actions);
            }
        };
        self.heartbeat.on_received(now);

        if self.config.persist_inbound {
            let record = LogRecord::new(
                msg.seq().unwrap_or_default(),
                msg.bytes().clone(),
                Timestamp::now(),
            );
            if let Err(err) = self.store.journal_inbound(&self.key, record).await {
                actions.push(self.fail(SessionError::StoreUnavailable(err)));
            }
        }

        let kind = msg.kind().clone();
        match (self.state.clone(), kind) {
            (SessionState::Connecting, MsgKind::Logon) => {
                self.on_logon_request(msg, now, &mut actions).await?;
            }
            (SessionState::Connecting, _) => {
                self.protocol_violation("message before logon".to_string(), now, &mut actions)
                    .await;
            }
            (SessionState::LogonPending { .. }, MsgKind::Logon) => {
                self.on_logon_ack(msg, now, &mut actions).await?;
            }
            (SessionState::LogonPending { .. }, MsgKind::Logout) => {
                let reason = msg.text().unwrap_or("logout during logon").to_string();
                self.terminate(DisconnectReason::LogonRejected { reason }, &mut actions)
                    .await;
            }
            (SessionState::LogonPending { .. }, _) => {
                self.protocol_violation(
                    "non-logon reply to logon".to_string(),
                    now,
                    &mut actions,
                )
                .await;
            }
            (SessionState::Active | SessionState::PendingResend { .. }, kind) => {
                self.on_established(kind, msg, now, &mut actions).await?;
            }
            (SessionState::LogoutPending { .. }, MsgKind::Logout) => {
                self.terminate(DisconnectReason::LogoutComplete, &mut actions)
                    .await;
            }
            (SessionState::LogoutPending { .. }, _) => {
                tracing::debug!(session = %self.key, "draining message while logout pending");
            }
            (SessionState::Disconnected { .. }, _) => {
                tracing::debug!(session = %self.key, "message ignored while disconnected");
            }
        }

        self.persist_quiet(&mut actions).await;
        Ok(actions)
    }

    /// Evaluates timers: logon/logout handshake timeouts, time-of-day reset,
    /// and heartbeat supervision.
    ///
    /// # Errors
    /// Returns `EngineError` if a durable send fails under write-then-send.
    pub async fn on_tick(&mut self, tick: Tick) -> Result<Vec<Action>, EngineError> {
        let mut actions = Vec::new();
        match self.state.clone() {
            SessionState::Connecting | SessionState::Disconnected { .. } => {}
            SessionState::LogonPending { sent_at } => {
                if tick.now.saturating_duration_since(sent_at) >= self.config.logon_timeout {
                    self.terminate(
                        DisconnectReason::LogonRejected {
                            reason: "logon timed out".to_string(),
                        },
                        &mut actions,
                    )
                    .await;
                }
            }
            SessionState::LogoutPending { sent_at, .. } => {
                if tick.now.saturating_duration_since(sent_at) >= self.config.logout_timeout {
                    self.terminate(DisconnectReason::LogoutComplete, &mut actions)
                        .await;
                }
            }
            SessionState::Active | SessionState::PendingResend { .. } => {
                self.maybe_daily_reset(&tick, &mut actions).await;
                if !self.state.is_established() {
                    return Ok(actions);
                }
                match self.heartbeat.poll(tick.now) {
                    HeartbeatAction::Idle => {}
                    HeartbeatAction::SendHeartbeat => {
                        let sent = self.send_message(tick.now, &MsgKind::Heartbeat, |_| {}).await?;
                        self.push_sent(sent, &mut actions);
                    }
                    HeartbeatAction::SendTestRequest => {
                        let id = format!("TEST{}", Timestamp::from(tick.wall).as_nanos());
                        let sent = self
                            .send_message(tick.now, &MsgKind::TestRequest, |b| {
                                b.put_str(tags::TEST_REQ_ID, &id);
                            })
                            .await?;
                        self.heartbeat.on_test_request_sent(id, tick.now);
                        self.push_sent(sent, &mut actions);
                    }
                    HeartbeatAction::Disconnect => {
                        let elapsed_ms = self.heartbeat.silence_millis(tick.now);
                        tracing::warn!(session = %self.key, elapsed_ms, "test request unanswered");
                        self.terminate(
                            DisconnectReason::HeartbeatTimeout { elapsed_ms },
                            &mut actions,
                        )
                        .await;
                    }
                }
            }
        }
        Ok(actions)
    }

    /// Sends one application message. The session must be established.
    ///
    /// # Arguments
    /// * `msg_type` - Wire MsgType value (tag 35)
    /// * `body` - Body fields as `(tag, value)` pairs
    /// * `now` - Current instant
    ///
    /// # Errors
    /// Returns `EngineError` if the session is not established or the
    /// durable send fails under write-then-send.
    pub async fn send_app(
        &mut self,
        msg_type: &str,
        body: &[(u32, &str)],
        now: Instant,
    ) -> Result<Vec<Action>, EngineError> {
        if !self.state.is_established() {
            return Err(SessionError::NotEstablished {
                state: self.state.name().to_string(),
            }
            .into());
        }
        let kind = MsgKind::from_wire(msg_type);
        let sent = self
            .send_message(now, &kind, |b| {
                for (tag, value) in body {
                    b.put_str(*tag, value);
                }
            })
            .await?;
        let mut actions = Vec::new();
        self.push_sent(sent, &mut actions);
        Ok(actions)
    }

    /// Starts a logout handshake. Before the session is established this
    /// disconnects directly; during an existing logout it is ignored.
    ///
    /// # Errors
    /// Returns `EngineError` if the durable send fails under write-then-send.
    pub async fn initiate_logout(&mut self, now: Instant) -> Result<Vec<Action>, EngineError> {
        let mut actions = Vec::new();
        match self.state {
            SessionState::Active | SessionState::PendingResend { .. } => {
                let sent = self.send_message(now, &MsgKind::Logout, |_| {}).await?;
                self.push_sent(sent, &mut actions);
                self.state = SessionState::LogoutPending {
                    sent_at: now,
                    initiated_locally: true,
                };
                tracing::info!(session = %self.key, "logout sent");
            }
            SessionState::Connecting | SessionState::LogonPending { .. } => {
                self.terminate(DisconnectReason::LogoutComplete, &mut actions)
                    .await;
            }
            SessionState::LogoutPending { .. } | SessionState::Disconnected { .. } => {}
        }
        Ok(actions)
    }

    /// The transport dropped. Sequence state is preserved so a `Continue`
    /// reconnect resumes where it left off.
    pub async fn on_transport_closed(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !matches!(self.state, SessionState::Disconnected { .. }) {
            self.terminate(DisconnectReason::TransportFailure, &mut actions)
                .await;
        }
        actions
    }

    // ---- logon handling -------------------------------------------------

    /// Checks an inbound Logon against our configuration.
    fn validate_logon(&self, msg: &WireMessage) -> Result<(), String> {
        match msg.begin_string() {
            Ok(version) if version == self.config.begin_string => {}
            Ok(version) => return Err(format!("version mismatch: {version}")),
            Err(_) => return Err("missing begin string".to_string()),
        }
        if msg.sender_comp_id() != Some(self.config.target_comp_id.as_str()) {
            return Err("sender comp id mismatch".to_string());
        }
        if msg.target_comp_id() != Some(self.config.sender_comp_id.as_str()) {
            return Err("target comp id mismatch".to_string());
        }
        if self.config.reset_on_logon && !msg.reset_seq_num() {
            return Err("sequence reset expectation mismatch".to_string());
        }
        Ok(())
    }

    /// Acceptor path: counterparty Logon arrives in `Connecting`.
    async fn on_logon_request(
        &mut self,
        msg: WireMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        if let Err(reason) = self.validate_logon(&msg) {
            self.reject_logon(reason, now, actions).await;
            return Ok(());
        }

        if let Ok(secs) = msg.field_u64(tags::HEART_BT_INT) {
            // Acceptor adopts the initiator's interval.
            self.heartbeat
                .set_interval(std::time::Duration::from_secs(secs));
        }

        let peer_reset = msg.reset_seq_num();
        if peer_reset {
            self.sequences.reset();
            if let Err(err) = self.store.reset(&self.key).await {
                self.store_fault(err, actions).await;
                return Ok(());
            }
        }

        let seq = match msg.seq() {
            Ok(seq) => seq,
            Err(err) => {
                self.protocol_violation(format!("logon without sequence: {err}"), now, actions)
                    .await;
                return Ok(());
            }
        };
        let status = self.sequences.observe(seq);
        if let SeqStatus::Duplicate { expected, received } = status
            && !msg.poss_dup()
        {
            self.protocol_violation(
                format!("logon sequence regression: received {received}, expected {expected}"),
                now,
                actions,
            )
            .await;
            return Ok(());
        }

        let heartbeat_secs = self.heartbeat.interval().as_secs();
        let sent = self
            .send_message(now, &MsgKind::Logon, |b| {
                b.put_u64(tags::HEART_BT_INT, heartbeat_secs);
                if peer_reset {
                    b.put_bool(tags::RESET_SEQ_NUM_FLAG, true);
                }
            })
            .await?;
        self.push_sent(sent, actions);
        self.state = SessionState::Active;
        actions.push(Action::Established);
        tracing::info!(session = %self.key, "logon accepted, session active");

        if let SeqStatus::Gap(gap) = status {
            self.enter_recovery(gap, now, actions).await?;
        }
        Ok(())
    }

    /// Initiator path: Logon acknowledgement arrives in `LogonPending`.
    async fn on_logon_ack(
        &mut self,
        msg: WireMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        if let Err(reason) = self.validate_logon(&msg) {
            self.reject_logon(reason, now, actions).await;
            return Ok(());
        }

        if let Ok(secs) = msg.field_u64(tags::HEART_BT_INT) {
            self.heartbeat
                .set_interval(std::time::Duration::from_secs(secs));
        }
        if msg.reset_seq_num() && !self.config.reset_on_logon {
            // Counterparty-initiated reset: accept their restart at 1.
            self.sequences.set_inbound(1);
        }

        let seq = match msg.seq() {
            Ok(seq) => seq,
            Err(err) => {
                self.protocol_violation(format!("logon without sequence: {err}"), now, actions)
                    .await;
                return Ok(());
            }
        };
        let status = self.sequences.observe(seq);
        if let SeqStatus::Duplicate { expected, received } = status
            && !msg.poss_dup()
        {
            self.protocol_violation(
                format!("logon sequence regression: received {received}, expected {expected}"),
                now,
                actions,
            )
            .await;
            return Ok(());
        }

        self.state = SessionState::Active;
        actions.push(Action::Established);
        tracing::info!(session = %self.key, "logon acknowledged, session active");

        if let SeqStatus::Gap(gap) = status {
            self.enter_recovery(gap, now, actions).await?;
        }
        Ok(())
    }

    /// Rejects a logon: best-effort Logout with the reason, then terminal
    /// `Disconnected` without touching sequence state further.
    async fn reject_logon(&mut self, reason: String, now: Instant, actions: &mut Vec<Action>) {
        tracing::warn!(session = %self.key, %reason, "logon rejected");
        if let Ok(sent) = self
            .send_message(now, &MsgKind::Logout, |b| b.put_str(tags::TEXT, &reason))
            .await
        {
            self.push_sent(sent, actions);
        }
        self.terminate(DisconnectReason::LogonRejected { reason }, actions)
            .await;
    }

    // ---- established traffic --------------------------------------------

    /// Dispatches one inbound message while Active or PendingResend.
    async fn on_established(
        &mut self,
        kind: MsgKind,
        msg: WireMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        // Reset-mode SequenceReset ignores MsgSeqNum entirely.
        if kind == MsgKind::SequenceReset && !msg.gap_fill() {
            match msg.field_u64(tags::NEW_SEQ_NO) {
                Ok(new_seq) => {
                    let expected = self.sequences.expected_inbound().value();
                    if new_seq < expected {
                        self.protocol_violation(
                            format!(
                                "sequence reset attempts to decrease expected: {new_seq} < {expected}"
                            ),
                            now,
                            actions,
                        )
                        .await;
                    } else {
                        tracing::info!(session = %self.key, new_seq, "sequence reset (reset mode)");
                        self.sequences.set_inbound(new_seq);
                        self.after_inbound_advance(now, actions).await?;
                    }
                }
                Err(err) => {
                    self.protocol_violation(
                        format!("sequence reset without NewSeqNo: {err}"),
                        now,
                        actions,
                    )
                    .await;
                }
            }
            return Ok(());
        }

        let seq = match msg.seq() {
            Ok(seq) => seq,
            Err(err) => {
                self.protocol_violation(format!("missing MsgSeqNum: {err}"), now, actions)
                    .await;
                return Ok(());
            }
        };

        match self.sequences.observe(seq) {
            SeqStatus::InOrder => {
                self.handle_in_order(kind, msg, now, actions).await?;
                if self.state.is_established() {
                    self.after_inbound_advance(now, actions).await?;
                }
            }
            SeqStatus::Gap(gap) => {
                tracing::warn!(
                    session = %self.key,
                    expected = gap.begin,
                    received = seq.value(),
                    "inbound sequence gap"
                );
                match kind {
                    // Honored immediately even above a gap.
                    MsgKind::ResendRequest => {
                        self.service_resend(&msg, now, actions).await?;
                    }
                    MsgKind::Logout => {
                        if let Ok(sent) = self.send_message(now, &MsgKind::Logout, |_| {}).await {
                            self.push_sent(sent, actions);
                        }
                        self.terminate(DisconnectReason::LogoutComplete, actions).await;
                        return Ok(());
                    }
                    _ => {
                        self.held.insert(seq.value(), msg);
                    }
                }
                self.enter_recovery(gap, now, actions).await?;
            }
            SeqStatus::Duplicate { expected, received } => {
                if msg.poss_dup() {
                    // Replay of something already processed; exactly-once
                    // delivery means we drop it silently.
                    tracing::debug!(session = %self.key, received, expected, "duplicate discarded");
                } else {
                    self.protocol_violation(
                        format!(
                            "sequence regression without PossDupFlag: received {received}, expected {expected}"
                        ),
                        now,
                        actions,
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Handles one in-order message after the tracker advanced past it.
    async fn handle_in_order(
        &mut self,
        kind: MsgKind,
        msg: WireMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        match kind {
            MsgKind::Heartbeat => {
                if let Some(id) = msg.test_req_id()
                    && self.heartbeat.on_test_request_answered(id)
                {
                    tracing::debug!(session = %self.key, id, "test request answered");
                }
            }
            MsgKind::TestRequest => {
                let id = msg.test_req_id().map(str::to_string);
                let sent = self
                    .send_message(now, &MsgKind::Heartbeat, |b| {
                        if let Some(id) = &id {
                            b.put_str(tags::TEST_REQ_ID, id);
                        }
                    })
                    .await?;
                self.push_sent(sent, actions);
            }
            MsgKind::ResendRequest => {
                self.service_resend(&msg, now, actions).await?;
            }
            MsgKind::SequenceReset => {
                // Gap-fill mode: jump expected forward over the covered run.
                match msg.field_u64(tags::NEW_SEQ_NO) {
                    Ok(new_seq) => {
                        let expected = self.sequences.expected_inbound().value();
                        if new_seq >= expected {
                            tracing::debug!(session = %self.key, new_seq, "gap fill");
                            self.sequences.set_inbound(new_seq);
                        } else {
                            self.protocol_violation(
                                format!(
                                    "gap fill attempts to decrease expected: {new_seq} < {expected}"
                                ),
                                now,
                                actions,
                            )
                            .await;
                        }
                    }
                    Err(err) => {
                        self.protocol_violation(
                            format!("gap fill without NewSeqNo: {err}"),
                            now,
                            actions,
                        )
                        .await;
                    }
                }
            }
            MsgKind::Logout => {
                // Peer-initiated logout: confirm, then terminal.
                if let Ok(sent) = self.send_message(now, &MsgKind::Logout, |_| {}).await {
                    self.push_sent(sent, actions);
                }
                self.terminate(DisconnectReason::LogoutComplete, actions).await;
            }
            MsgKind::Logon => {
                self.protocol_violation(
                    "logon on established session".to_string(),
                    now,
                    actions,
                )
                .await;
            }
            MsgKind::Reject => {
                let ref_seq = msg.field_u64(tags::REF_SEQ_NUM).unwrap_or(0);
                let reason = msg.text().unwrap_or("").to_string();
                tracing::warn!(session = %self.key, ref_seq, %reason, "peer rejected message");
                actions.push(self.fail(SessionError::RejectedByPeer { ref_seq, reason }));
            }
            MsgKind::App(_) => {
                actions.push(Action::Deliver(msg));
            }
        }
        Ok(())
    }

    /// Drains held messages that became in-order and advances recovery
    /// bookkeeping. Called after every inbound sequence advance.
    async fn after_inbound_advance(
        &mut self,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        loop {
            let expected = self.sequences.expected_inbound().value();
            let Some(msg) = self.held.remove(&expected) else {
                break;
            };
            self.sequences.advance_inbound();
            let kind = msg.kind().clone();
            self.handle_in_order(kind, msg, now, actions).await?;
            if !self.state.is_established() {
                return Ok(());
            }
        }

        if let SessionState::PendingResend {
            request,
            range,
            requested_chunk,
        } = self.state.clone()
        {
            let expected = self.sequences.expected_inbound().value();
            self.chunker.mark_through(request, expected.saturating_sub(1));

            if self.chunker.is_complete(request) || expected > range.end {
                self.chunker.abandon(request);
                if let Some((&lowest, _)) = self.held.first_key_value() {
                    // A newer gap opened while we were recovering.
                    let hole = SeqRange::new(expected, lowest - 1);
                    tracing::info!(session = %self.key, %hole, "residual gap after resend");
                    self.start_recovery_plan(hole, now, actions).await?;
                } else {
                    tracing::info!(session = %self.key, "gap resolved, session in order");
                    self.state = SessionState::Active;
                }
            } else if let Some((idx, chunk)) = self.chunker.first_outstanding(request)
                && idx > requested_chunk
            {
                // Previous chunk filled; request the next one.
                self.emit_resend_request(chunk, now, actions).await?;
                self.state = SessionState::PendingResend {
                    request,
                    range,
                    requested_chunk: idx,
                };
            }
        }
        Ok(())
    }

    /// Enters recovery for a newly observed gap. While already recovering,
    /// later arrivals are only held: the outstanding plan keeps running and
    /// any residue is covered by a fresh plan on completion.
    async fn enter_recovery(
        &mut self,
        gap: SeqRange,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        if matches!(self.state, SessionState::Active) {
            self.start_recovery_plan(gap, now, actions).await?;
        }
        Ok(())
    }

    /// Plans chunked recovery over `range` and requests its first chunk.
    async fn start_recovery_plan(
        &mut self,
        range: SeqRange,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        let request = self.chunker.plan(range);
        if let Some((idx, chunk)) = self.chunker.first_outstanding(request) {
            self.emit_resend_request(chunk, now, actions).await?;
            self.state = SessionState::PendingResend {
                request,
                range,
                requested_chunk: idx,
            };
            tracing::info!(session = %self.key, %range, %request, "resend requested");
        }
        Ok(())
    }

    /// Emits one ResendRequest covering `chunk`.
    async fn emit_resend_request(
        &mut self,
        chunk: SeqRange,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        let sent = self
            .send_message(now, &MsgKind::ResendRequest, |b| {
                b.put_u64(tags::BEGIN_SEQ_NO, chunk.begin);
                b.put_u64(tags::END_SEQ_NO, chunk.end);
            })
            .await?;
        self.push_sent(sent, actions);
        Ok(())
    }

    // ---- resend servicing -----------------------------------------------

    /// Services an inbound ResendRequest by replaying the log chunk by
    /// chunk. Records are resent with PossDupFlag set and their original
    /// timestamp preserved; non-resendable or never-persisted slots coalesce
    /// into gap fills, never renumbered.
    async fn service_resend(
        &mut self,
        msg: &WireMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        let begin = match msg.field_u64(tags::BEGIN_SEQ_NO) {
            Ok(value) => value,
            Err(err) => {
                self.send_reject(msg.seq().ok(), format!("bad BeginSeqNo: {err}"), now, actions)
                    .await?;
                return Ok(());
            }
        };
        let end_raw = match msg.field_u64(tags::END_SEQ_NO) {
            Ok(value) => value,
            Err(err) => {
                self.send_reject(msg.seq().ok(), format!("bad EndSeqNo: {err}"), now, actions)
                    .await?;
                return Ok(());
            }
        };

        let last_sent = self.sequences.next_outbound().value().saturating_sub(1);
        if begin == 0 || begin > last_sent {
            self.send_reject(
                msg.seq().ok(),
                format!("resend range starts at {begin}, last sent is {last_sent}"),
                now,
                actions,
            )
            .await?;
            return Ok(());
        }
        let end = if end_raw == 0 { last_sent } else { end_raw.min(last_sent) };
        if end < begin {
            self.send_reject(
                msg.seq().ok(),
                format!("inverted resend range: [{begin}, {end_raw}]"),
                now,
                actions,
            )
            .await?;
            return Ok(());
        }
        let range = SeqRange::new(begin, end);

        // Abandon-and-replace: a newer request supersedes an in-flight plan.
        if let Some(previous) = self.outbound_service.take() {
            tracing::debug!(session = %self.key, %previous, "abandoning superseded resend plan");
            self.chunker.abandon(previous);
        }

        let request = self.chunker.plan(range);
        self.outbound_service = Some(request);
        tracing::info!(session = %self.key, %range, %request, "servicing resend request");

        let chunks: Vec<SeqRange> = self
            .chunker
            .chunks(request)
            .map(<[SeqRange]>::to_vec)
            .unwrap_or_default();
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let records = match self.store.read_range(&self.key, chunk).await {
                Ok(records) => records,
                Err(err) => {
                    // Fail closed: never fabricate or skip; the incomplete
                    // plan stays outstanding under the Hold policy.
                    self.store_fault(err, actions).await;
                    return Ok(());
                }
            };
            self.replay_chunk(chunk, &records, actions)?;
            self.chunker.mark_serviced(request, idx);
        }
        self.chunker.abandon(request);
        self.outbound_service = None;
        Ok(())
    }

    /// Replays one chunk: stored resendable records go out rewritten, every
    /// other slot extends a gap-fill run.
    fn replay_chunk(
        &self,
        chunk: SeqRange,
        records: &[LogRecord],
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        let by_seq: BTreeMap<u64, &LogRecord> =
            records.iter().map(|record| (record.seq.value(), record)).collect();

        let mut gap_run: Option<SeqRange> = None;
        for seq in chunk.begin..=chunk.end {
            let replay = by_seq.get(&seq).and_then(|record| {
                let parsed = WireMessage::parse(record.bytes.clone(), false).ok()?;
                (self.config.resendable)(parsed.kind()).then_some(parsed)
            });
            match replay {
                Some(parsed) => {
                    if let Some(run) = gap_run.take() {
                        actions.push(Action::Transmit(self.build_gap_fill(run)));
                    }
                    actions.push(Action::Transmit(wire::rewrite_as_resend(&parsed)?));
                }
                None => {
                    gap_run = Some(match gap_run {
                        Some(run) => SeqRange::new(run.begin, seq),
                        None => SeqRange::single(seq),
                    });
                }
            }
        }
        if let Some(run) = gap_run {
            actions.push(Action::Transmit(self.build_gap_fill(run)));
        }
        Ok(())
    }

    /// Builds a gap-fill SequenceReset occupying `run` on the wire: its
    /// MsgSeqNum is the first covered slot, NewSeqNo points past the run.
    fn build_gap_fill(&self, run: SeqRange) -> Bytes {
        wire::build_session_message(
            &self.key,
            MsgKind::SequenceReset.as_str(),
            SeqNum::new(run.begin),
            &Timestamp::now().format_millis(),
            |b| {
                b.put_bool(tags::POSS_DUP_FLAG, true);
                b.put_bool(tags::GAP_FILL_FLAG, true);
                b.put_u64(tags::NEW_SEQ_NO, run.end + 1);
            },
        )
    }

    // ---- outbound plumbing ----------------------------------------------

    /// Builds, records, and accounts one outbound message under the
    /// configured durability order. The sequence counter advances only after
    /// the durable point (write-then-send) or together with the transmit
    /// whose confirming append may still fault (send-then-confirm).
    async fn send_message(
        &mut self,
        now: Instant,
        kind: &MsgKind,
        body: impl FnOnce(&mut MessageBuilder),
    ) -> Result<Sent, EngineError> {
        let seq = self.sequences.next_outbound();
        let timestamp = Timestamp::now();
        let bytes = wire::build_session_message(
            &self.key,
            kind.as_str(),
            seq,
            &timestamp.format_millis(),
            body,
        );

        let persist = self.config.persist_admin || kind.is_app();
        let mut fault = None;
        match self.config.durability {
            DurabilityOrder::WriteThenSend => {
                if persist {
                    let record = LogRecord::new(seq, bytes.clone(), timestamp);
                    self.store
                        .append(&self.key, record)
                        .await
                        .map_err(|err| EngineError::Session(SessionError::StoreUnavailable(err)))?;
                }
            }
            DurabilityOrder::SendThenConfirm => {
                if persist {
                    let record = LogRecord::new(seq, bytes.clone(), timestamp);
                    if let Err(err) = self.store.append(&self.key, record).await {
                        fault = Some(SessionError::StoreUnavailable(err));
                    }
                }
            }
        }

        self.sequences.confirm_outbound();
        self.heartbeat.on_sent(now);
        if let Err(err) = self.persist_record().await
            && fault.is_none()
        {
            fault = Some(SessionError::StoreUnavailable(err));
        }
        Ok(Sent { bytes, fault })
    }

    /// Queues a sent message's transmit plus any deferred fault.
    fn push_sent(&self, sent: Sent, actions: &mut Vec<Action>) {
        actions.push(Action::Transmit(sent.bytes));
        if let Some(error) = sent.fault {
            actions.push(self.fail(error));
        }
    }

    // ---- failure plumbing -----------------------------------------------

    /// Wraps an error with the session identity and current state.
    fn fail(&self, error: SessionError) -> Action {
        Action::Fault(SessionFailure::new(
            self.key.clone(),
            self.state.name(),
            error,
        ))
    }

    /// Session-fatal violation: best-effort Logout, then terminal.
    async fn protocol_violation(
        &mut self,
        reason: String,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        tracing::warn!(session = %self.key, %reason, "protocol violation");
        if self.state.is_established()
            && let Ok(sent) = self
                .send_message(now, &MsgKind::Logout, |b| b.put_str(tags::TEXT, &reason))
                .await
        {
            self.push_sent(sent, actions);
        }
        self.terminate(DisconnectReason::ProtocolViolation { reason }, actions)
            .await;
    }

    /// Sends a session-level Reject for a semantically bad admin request.
    async fn send_reject(
        &mut self,
        ref_seq: Option<SeqNum>,
        reason: String,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<(), EngineError> {
        tracing::warn!(session = %self.key, %reason, "rejecting inbound request");
        let sent = self
            .send_message(now, &MsgKind::Reject, |b| {
                if let Some(seq) = ref_seq {
                    b.put_u64(tags::REF_SEQ_NUM, seq.value());
                }
                b.put_str(tags::TEXT, &reason);
            })
            .await?;
        self.push_sent(sent, actions);
        Ok(())
    }

    /// Applies the configured reaction to a store failure.
    async fn store_fault(&mut self, error: StoreError, actions: &mut Vec<Action>) {
        tracing::error!(session = %self.key, %error, "message store unavailable");
        match self.config.store_fault_action {
            StoreFaultAction::Hold => actions.push(self.fail(SessionError::StoreUnavailable(error))),
            StoreFaultAction::Disconnect => {
                self.terminate(DisconnectReason::StoreUnavailable { error }, actions)
                    .await;
            }
        }
    }

    /// Moves to the terminal state and notifies.
    async fn terminate(&mut self, reason: DisconnectReason, actions: &mut Vec<Action>) {
        tracing::info!(session = %self.key, %reason, "session disconnected");
        self.state = SessionState::Disconnected {
            reason: reason.clone(),
        };
        self.persist_quiet(actions).await;
        actions.push(Action::Terminated(reason));
    }

    // ---- persistence ----------------------------------------------------

    /// Writes the sequence record; errors become faults.
    async fn persist_quiet(&mut self, actions: &mut Vec<Action>) {
        if let Err(err) = self.persist_record().await {
            actions.push(self.fail(SessionError::StoreUnavailable(err)));
        }
    }

    async fn persist_record(&self) -> Result<(), StoreError> {
        let (next_outbound, next_inbound) = self.sequences.snapshot();
        self.store
            .save_session(&SessionRecord {
                key: self.key.clone(),
                next_outbound,
                next_inbound,
                state: self.state.name().to_string(),
            })
            .await
    }

    // ---- timers ---------------------------------------------------------

    /// Performs the configured time-of-day sequence reset. The first tick
    /// only records the current day, so a session started after the reset
    /// time does not reset immediately.
    async fn maybe_daily_reset(&mut self, tick: &Tick, actions: &mut Vec<Action>) {
        let Some(reset_time) = self.config.daily_reset_time else {
            return;
        };
        let today = tick.wall.date_naive();
        let past_reset = tick.wall.time() >= reset_time;

        match self.last_reset_day {
            None => {
                self.last_reset_day = Some(if past_reset {
                    today
                } else {
                    today.pred_opt().unwrap_or(today)
                });
            }
            Some(last) if past_reset && last < today => {
                tracing::info!(session = %self.key, "daily sequence reset");
                self.sequences.reset();
                if let Err(err) = self.store.reset(&self.key).await {
                    self.store_fault(err, actions).await;
                }
                self.persist_quiet(actions).await;
                self.last_reset_day = Some(today);
            }
            Some(_) => {}
        }
    }
}
