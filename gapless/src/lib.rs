/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Gapless
//!
//! A FIX session-layer protocol engine for Rust.
//!
//! Gapless maintains the session contract between two counterparties
//! exchanging ordered, sequenced, recoverable messages over an unreliable
//! transport: logon/logout lifecycle, heartbeat supervision, strictly
//! ordered sequence numbering, gap detection, and resend-driven recovery
//! (chunked for large gaps) backed by a durable message log that replays
//! bit-identical wire content.
//!
//! ## Features
//!
//! - **Exhaustive state machine**: Every (state, event) pair has a defined
//!   outcome, including explicit ignores
//! - **Ordered delivery**: A message is never delivered before every lower
//!   sequence number has been delivered or gap-filled
//! - **Durable replay**: Append-only log with crash-safe reopen; resends are
//!   byte-identical apart from the dup/timestamp rewrite
//! - **Deterministic timers**: Heartbeat and timeout logic is driven by
//!   externally delivered ticks, never by sleeping
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gapless::prelude::*;
//!
//! let engine = EngineBuilder::new()
//!     .with_application(MyApplication)
//!     .add_session(SessionConfig::new(
//!         CompId::new("SENDER").unwrap(),
//!         CompId::new("TARGET").unwrap(),
//!         "FIX.4.4",
//!         DurabilityOrder::WriteThenSend,
//!     ))
//!     .start()
//!     .await?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`core`]: Types, wire primitives, and error definitions
//! - [`store`]: Message persistence and session state records
//! - [`session`]: Session layer protocol core
//! - [`engine`]: Coordinator facade and application callbacks

pub mod core {
    //! Types, wire primitives, and error definitions.
    pub use gapless_core::*;
}

pub mod store {
    //! Message persistence and session state records.
    pub use gapless_store::*;
}

pub mod session {
    //! Session layer protocol core.
    pub use gapless_session::*;
}

pub mod engine {
    //! Coordinator facade and application callbacks.
    pub use gapless_engine::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types
    pub use gapless_core::{
        CompId, EngineError, MsgKind, Result, SeqNum, SeqRange, SessionError, SessionFailure,
        SessionKey, StoreError, Timestamp, WireError, WireMessage,
    };

    // Store
    pub use gapless_store::{FileStore, LogRecord, MemoryStore, MessageStore, SessionRecord};

    // Session
    pub use gapless_session::{
        Action, DisconnectReason, DurabilityOrder, HeartbeatAction, HeartbeatMonitor, RequestId,
        ResendChunker, SeqStatus, SequencePolicy, SequenceTracker, SessionConfig, SessionRole,
        SessionState, SessionStateMachine, StoreFaultAction, Tick,
    };

    // Engine
    pub use gapless_engine::{Application, Engine, EngineBuilder, NoOpApplication};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _seq = SeqNum::new(1);
        let _range = SeqRange::new(1, 10);
        let _ts = Timestamp::from_millis(0);
        let chunks = ResendChunker::split(SeqRange::new(1, 250), 100);
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_engine_builder_starts() {
        let engine = EngineBuilder::new().start().await.unwrap();
        assert_eq!(engine.session_count(), 0);
    }
}
