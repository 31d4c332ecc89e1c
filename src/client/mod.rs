//! Offline-tolerant exam client: a durable event log, a reducer-style
//! state store for the UI, a background sync engine, and session restore.
//!
//! Everything here shares the server's wire types, so a client binary and
//! the backend stay in lockstep by construction.

pub mod event_log;
pub mod restore;
pub mod state;
pub mod storage;
pub mod sync;
