//! Trust-minimized escrow settlement for milestone-based services
//!
//! This crate implements the core of a service marketplace as a deterministic
//! state machine:
//! - Milestone escrow: funds locked at creation, released tranche by tranche
//!   on explicit client approval, with a dispute path for everything else
//! - Reputation ledger: post-settlement reviews aggregated into contractor
//!   ratings
//! - Staking pool: staked balances accruing continuous-time rewards
//!
//! Persistence and transport are external collaborators' concerns; the engine
//! exposes typed operations, read projections, and an append-only event
//! outbox.

pub mod custody_ledger;
pub mod error;
pub mod escrow_engine;
pub mod event_outbox;
pub mod models;
pub mod node;
pub mod reputation_ledger;
pub mod staking_pool;

use error::EngineError;

/// Result type alias for settlement operations
pub type EngineResult<T> = Result<T, EngineError>;
