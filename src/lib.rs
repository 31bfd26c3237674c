//! Metered, branchable, streamed persona chat core.
//!
//! Conversations are trees of messages; every turn reserves tokens from the
//! [`service::ledger::Ledger`] before the model is called, streams the reply
//! and either commits it or refunds the exact reservation.

pub mod agent;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod observability;
pub mod routes;
pub mod service;
