//! Task lifecycle state machine and on-chain escrow settlement engine.
//!
//! This module exports the core components for testing and integration.

pub mod api;
pub mod app;
pub mod blobs;
pub mod chain;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod hashing;
pub mod lifecycle;
pub mod logging;
pub mod state_machine;
pub mod types;
