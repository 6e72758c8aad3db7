/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Gapless Core
//!
//! Shared vocabulary for the Gapless FIX session engine.
//!
//! This crate provides:
//! - **Types**: Sequence numbers and ranges, session keys, timestamps
//! - **Wire primitives**: Tag=value scanning, checksum handling, admin
//!   message construction, and the PossDup rewrite used on replay
//! - **Errors**: The error taxonomy shared by all Gapless crates

pub mod error;
pub mod types;
pub mod wire;

pub use error::{EngineError, Result, SessionError, SessionFailure, StoreError, WireError};
pub use types::{CompId, MsgKind, SeqNum, SeqRange, SessionKey, Timestamp};
pub use wire::{MessageBuilder, WireMessage};
