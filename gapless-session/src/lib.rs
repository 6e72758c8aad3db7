/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Gapless Session
//!
//! FIX session layer protocol core for the Gapless engine.
//!
//! This crate provides:
//! - **State machine**: Tagged-state session FSM with exhaustive
//!   (state, event) handling
//! - **Sequence management**: Per-direction sequence tracking with gap and
//!   duplicate classification
//! - **Resend chunking**: Bounded sub-range planning and completion tracking
//!   for large resend ranges
//! - **Heartbeat supervision**: Deterministic, tick-driven liveness decisions
//! - **Configuration**: Session configuration options

pub mod chunker;
pub mod config;
pub mod heartbeat;
pub mod sequence;
pub mod state;

pub use chunker::{RequestId, ResendChunker};
pub use config::{DurabilityOrder, SequencePolicy, SessionConfig, SessionRole, StoreFaultAction};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use sequence::{SeqStatus, SequenceTracker};
pub use state::{Action, DisconnectReason, SessionState, SessionStateMachine, Tick};
