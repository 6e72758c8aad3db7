/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session coordinator.
//!
//! The engine owns the session table: handles are inserted when a session is
//! opened and removed when it reaches its terminal state. Each handle wraps
//! its state machine in an async mutex, enforcing the single-writer-per-
//! session discipline; concurrent sessions are driven independently. The
//! engine performs no transport I/O: inbound framed bytes come in through
//! [`Engine::on_inbound`], outbound framed bytes are returned to the caller.

use crate::application::{Application, NoOpApplication};
use bytes::Bytes;
use gapless_core::error::{EngineError, SessionError, SessionFailure};
use gapless_core::types::SessionKey;
use gapless_session::state::{Action, SessionStateMachine, Tick};
use gapless_session::SessionConfig;
use gapless_store::{MemoryStore, MessageStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// One registered session: its key and its exclusively held state machine.
#[derive(Debug)]
pub struct SessionHandle {
    key: SessionKey,
    machine: Mutex<SessionStateMachine>,
}

impl SessionHandle {
    /// Returns the session identity.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Returns the current state name.
    pub async fn state_name(&self) -> &'static str {
        self.machine.lock().await.state().name()
    }
}

/// Session coordinator: registry, routing, and application callbacks.
pub struct Engine<A: Application = NoOpApplication> {
    store: Arc<dyn MessageStore>,
    application: Arc<A>,
    sessions: RwLock<HashMap<SessionKey, Arc<SessionHandle>>>,
}

impl Engine<NoOpApplication> {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn builder() -> EngineBuilder<NoOpApplication> {
        EngineBuilder::new()
    }
}

impl<A: Application> Engine<A> {
    /// Opens a session and registers its handle.
    ///
    /// Under the `Continue` policy the state machine resumes from the
    /// store's persisted sequence record.
    ///
    /// # Errors
    /// Returns `EngineError` if the store cannot be consulted.
    pub async fn open_session(&self, config: SessionConfig) -> Result<SessionKey, EngineError> {
        let machine =
            SessionStateMachine::new(config, Arc::clone(&self.store), Instant::now()).await?;
        let key = machine.key().clone();
        let handle = Arc::new(SessionHandle {
            key: key.clone(),
            machine: Mutex::new(machine),
        });
        self.sessions.write().insert(key.clone(), handle);
        tracing::info!(session = %key, "session registered");
        Ok(key)
    }

    /// Returns true if a session is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.read().contains_key(key)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns the handle for a session.
    ///
    /// # Errors
    /// Returns `EngineError` if no session is registered under `key`.
    pub fn handle(&self, key: &SessionKey) -> Result<Arc<SessionHandle>, EngineError> {
        self.sessions
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| {
                SessionError::UnknownSession {
                    key: key.to_string(),
                }
                .into()
            })
    }

    /// Signals that the transport for a session is attached.
    ///
    /// # Errors
    /// Returns `EngineError` if the session is unknown or the send fails.
    pub async fn connect(&self, key: &SessionKey) -> Result<Vec<Bytes>, EngineError> {
        let handle = self.handle(key)?;
        let mut machine = handle.machine.lock().await;
        let actions = machine.on_connected(Instant::now()).await?;
        drop(machine);
        Ok(self.dispatch(key, actions).await)
    }

    /// Routes one inbound framed message to its session and returns the
    /// outbound frames it produced.
    ///
    /// # Errors
    /// Returns `EngineError` if the session is unknown or a durable send
    /// fails; the failure is also surfaced through `Application::on_fault`.
    pub async fn on_inbound(&self, key: &SessionKey, bytes: Bytes) -> Result<Vec<Bytes>, EngineError> {
        let handle = self.handle(key)?;
        let mut machine = handle.machine.lock().await;
        match machine.on_message(bytes).await {
            Ok(actions) => {
                drop(machine);
                Ok(self.dispatch(key, actions).await)
            }
            Err(err) => {
                let failure = SessionFailure::new(
                    key.clone(),
                    machine.state().name(),
                    session_error(err),
                );
                drop(machine);
                self.application.on_fault(&failure).await;
                Err(failure.error.into())
            }
        }
    }

    /// Delivers a tick to every registered session and returns the outbound
    /// frames produced, tagged with their session.
    pub async fn on_tick(&self, tick: Tick) -> Vec<(SessionKey, Bytes)> {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        let mut outbound = Vec::new();
        for handle in handles {
            let mut machine = handle.machine.lock().await;
            match machine.on_tick(tick).await {
                Ok(actions) => {
                    drop(machine);
                    for bytes in self.dispatch(&handle.key, actions).await {
                        outbound.push((handle.key.clone(), bytes));
                    }
                }
                Err(err) => {
                    tracing::error!(session = %handle.key, error = %err, "tick failed");
                }
            }
        }
        outbound
    }

    /// Sends one application message on a session.
    ///
    /// # Errors
    /// Returns `EngineError` if the session is unknown, not established, or
    /// the durable send fails.
    pub async fn send(
        &self,
        key: &SessionKey,
        msg_type: &str,
        body: &[(u32, &str)],
    ) -> Result<Vec<Bytes>, EngineError> {
        let handle = self.handle(key)?;
        let mut machine = handle.machine.lock().await;
        let actions = machine.send_app(msg_type, body, Instant::now()).await?;
        drop(machine);
        Ok(self.dispatch(key, actions).await)
    }

    /// Starts a logout handshake on a session.
    ///
    /// # Errors
    /// Returns `EngineError` if the session is unknown or the send fails.
    pub async fn logout(&self, key: &SessionKey) -> Result<Vec<Bytes>, EngineError> {
        let handle = self.handle(key)?;
        let mut machine = handle.machine.lock().await;
        let actions = machine.initiate_logout(Instant::now()).await?;
        drop(machine);
        Ok(self.dispatch(key, actions).await)
    }

    /// Signals that a session's transport dropped.
    ///
    /// # Errors
    /// Returns `EngineError` if the session is unknown.
    pub async fn transport_closed(&self, key: &SessionKey) -> Result<Vec<Bytes>, EngineError> {
        let handle = self.handle(key)?;
        let mut machine = handle.machine.lock().await;
        let actions = machine.on_transport_closed().await;
        drop(machine);
        Ok(self.dispatch(key, actions).await)
    }

    /// Applies a batch of state machine actions: collects transmits, runs
    /// application callbacks, and retires terminal sessions from the table.
    async fn dispatch(&self, key: &SessionKey, actions: Vec<Action>) -> Vec<Bytes> {
        let mut outbound = Vec::new();
        for action in actions {
            match action {
                Action::Transmit(bytes) => outbound.push(bytes),
                Action::Deliver(message) => {
                    self.application.on_message(key, &message).await;
                }
                Action::Established => {
                    self.application.on_session_established(key).await;
                }
                Action::Fault(failure) => {
                    self.application.on_fault(&failure).await;
                }
                Action::Terminated(reason) => {
                    self.application.on_session_terminated(key, &reason).await;
                    self.sessions.write().remove(key);
                    tracing::info!(session = %key, "session retired");
                }
            }
        }
        outbound
    }
}

/// Maps an engine error onto the session error surfaced to the application.
fn session_error(err: EngineError) -> SessionError {
    match err {
        EngineError::Session(session) => session,
        EngineError::Store(store) => SessionError::StoreUnavailable(store),
        other => SessionError::ProtocolViolation {
            reason: other.to_string(),
        },
    }
}

/// Builder for configuring an engine.
pub struct EngineBuilder<A: Application = NoOpApplication> {
    application: Arc<A>,
    store: Option<Arc<dyn MessageStore>>,
    sessions: Vec<SessionConfig>,
}

impl Default for EngineBuilder<NoOpApplication> {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder<NoOpApplication> {
    /// Creates a builder with a no-op application and no store configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            application: Arc::new(NoOpApplication),
            store: None,
            sessions: Vec::new(),
        }
    }
}

impl<A: Application> EngineBuilder<A> {
    /// Sets the application callback handler.
    #[must_use]
    pub fn with_application<B: Application>(self, application: B) -> EngineBuilder<B> {
        EngineBuilder {
            application: Arc::new(application),
            store: self.store,
            sessions: self.sessions,
        }
    }

    /// Sets the message store shared by all sessions.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Queues a session to open at start.
    #[must_use]
    pub fn add_session(mut self, config: SessionConfig) -> Self {
        self.sessions.push(config);
        self
    }

    /// Builds the engine and opens the queued sessions. Without an explicit
    /// store a non-durable in-memory store is used.
    ///
    /// # Errors
    /// Returns `EngineError` if a queued session cannot be opened.
    pub async fn start(self) -> Result<Engine<A>, EngineError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn MessageStore>);
        let engine = Engine {
            store,
            application: self.application,
            sessions: RwLock::new(HashMap::new()),
        };
        for config in self.sessions {
            engine.open_session(config).await?;
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use gapless_core::types::{CompId, SeqNum};
    use gapless_core::wire::{self, tags, MessageBuilder, WireMessage};
    use gapless_session::{DisconnectReason, DurabilityOrder};
    use parking_lot::Mutex as SyncMutex;

    const TS: &str = "20260127-10:00:00.000";

    fn config() -> SessionConfig {
        SessionConfig::new(
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
            "FIX.4.4",
            DurabilityOrder::WriteThenSend,
        )
    }

    fn peer_key() -> SessionKey {
        SessionKey::new(
            "FIX.4.4",
            CompId::new("TARGET").unwrap(),
            CompId::new("SENDER").unwrap(),
        )
    }

    fn peer_msg(msg_type: &str, seq: u64, body: impl FnOnce(&mut MessageBuilder)) -> Bytes {
        wire::build_session_message(&peer_key(), msg_type, SeqNum::new(seq), TS, body)
    }

    /// Records callback invocations for assertions.
    #[derive(Default)]
    struct RecordingApplication {
        events: SyncMutex<Vec<String>>,
    }

    impl RecordingApplication {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl Application for RecordingApplication {
        async fn on_session_established(&self, key: &SessionKey) {
            self.events.lock().push(format!("established:{key}"));
        }

        async fn on_session_terminated(&self, key: &SessionKey, reason: &DisconnectReason) {
            self.events.lock().push(format!("terminated:{key}:{reason}"));
        }

        async fn on_message(&self, _key: &SessionKey, message: &WireMessage) {
            self.events
                .lock()
                .push(format!("message:{}", message.seq().unwrap()));
        }

        async fn on_fault(&self, failure: &SessionFailure) {
            self.events.lock().push(format!("fault:{}", failure.error));
        }
    }

    async fn engine_with_recorder() -> (Engine<RecordingApplication>, SessionKey) {
        let engine = Engine::builder()
            .with_application(RecordingApplication::default())
            .add_session(config())
            .start()
            .await
            .unwrap();
        let key = config().session_key();
        (engine, key)
    }

    async fn establish(engine: &Engine<RecordingApplication>, key: &SessionKey) {
        let frames = engine.connect(key).await.unwrap();
        assert_eq!(frames.len(), 1);
        engine
            .on_inbound(
                key,
                peer_msg("A", 1, |b| {
                    b.put_u64(tags::HEART_BT_INT, 30);
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_builder_registers_sessions() {
        let engine = Engine::builder().add_session(config()).start().await.unwrap();
        let key = config().session_key();
        assert!(engine.contains(&key));
        assert_eq!(engine.session_count(), 1);
        assert_eq!(engine.handle(&key).unwrap().state_name().await, "Connecting");
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let engine = Engine::builder().start().await.unwrap();
        let key = config().session_key();
        let result = engine.on_inbound(&key, Bytes::from_static(b"x")).await;
        assert!(matches!(
            result,
            Err(EngineError::Session(SessionError::UnknownSession { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_and_callbacks() {
        let (engine, key) = engine_with_recorder().await;
        establish(&engine, &key).await;

        // Ordered delivery reaches the application.
        engine
            .on_inbound(&key, peer_msg("D", 2, |b| b.put_str(55, "EURUSD")))
            .await
            .unwrap();

        // Peer logout: confirmation frame out, session retired.
        let frames = engine
            .on_inbound(&key, peer_msg("5", 3, |_| {}))
            .await
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!engine.contains(&key));

        let events = engine.application.events();
        assert!(events[0].starts_with("established:"));
        assert_eq!(events[1], "message:2");
        assert!(events[2].starts_with("terminated:"));
    }

    #[tokio::test]
    async fn test_send_application_message() {
        let (engine, key) = engine_with_recorder().await;
        establish(&engine, &key).await;

        let frames = engine.send(&key, "D", &[(11, "ORDER-1")]).await.unwrap();
        assert_eq!(frames.len(), 1);
        let msg = WireMessage::parse(frames[0].clone(), true).unwrap();
        assert_eq!(msg.seq().unwrap().value(), 2);
        assert_eq!(msg.field_str(11), Some("ORDER-1"));
    }

    #[tokio::test]
    async fn test_logout_flow_retires_session() {
        let (engine, key) = engine_with_recorder().await;
        establish(&engine, &key).await;

        let frames = engine.logout(&key).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(engine.contains(&key));

        engine
            .on_inbound(&key, peer_msg("5", 2, |_| {}))
            .await
            .unwrap();
        assert!(!engine.contains(&key));
    }

    #[tokio::test]
    async fn test_transport_closed_retires_session() {
        let (engine, key) = engine_with_recorder().await;
        establish(&engine, &key).await;

        engine.transport_closed(&key).await.unwrap();
        assert!(!engine.contains(&key));
        let events = engine.application.events();
        assert!(events.iter().any(|e| e.contains("transport failure")));
    }

    #[tokio::test]
    async fn test_tick_fans_out_to_sessions() {
        let (engine, key) = engine_with_recorder().await;
        establish(&engine, &key).await;

        // Immediate tick: nothing due yet.
        let frames = engine.on_tick(Tick::at(Instant::now(), Utc::now())).await;
        assert!(frames.is_empty());

        // Past the heartbeat interval: the session probes its peer.
        let frames = engine
            .on_tick(Tick::at(
                Instant::now() + std::time::Duration::from_secs(31),
                Utc::now(),
            ))
            .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, key);
        let msg = WireMessage::parse(frames[0].1.clone(), true).unwrap();
        assert_eq!(msg.kind(), &gapless_core::types::MsgKind::TestRequest);
    }
}
