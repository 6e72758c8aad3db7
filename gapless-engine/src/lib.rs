/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # Gapless Engine
//!
//! Session coordinator facade for the Gapless FIX session engine.
//!
//! This crate provides:
//! - **Engine**: Coordinator owning the session registry, routing inbound
//!   bytes and ticks to per-session state machines
//! - **Application trait**: Callback interface for ordered deliveries and
//!   lifecycle events
//! - **Builder API**: Fluent engine setup

pub mod application;
pub mod engine;

pub use application::{Application, NoOpApplication};
pub use engine::{Engine, EngineBuilder, SessionHandle};
