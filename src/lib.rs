//! Pitwall Backend Library
//!
//! Reconciled live and historical motorsport timing: a resilient live
//! subscription channel, a cross-source reconciliation engine, and a
//! historical replay reconstructor, with the provider clients and durable
//! store they sit on.

pub mod auth;
pub mod errors;
pub mod live;
pub mod models;
pub mod providers;
pub mod reconcile;
pub mod replay;
pub mod store;
pub mod timing;
