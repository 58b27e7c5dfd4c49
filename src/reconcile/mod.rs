//! Cross-source reconciliation and pace analysis

pub mod engine;
pub mod pace;

pub use engine::{merge, to_unified_rmonitor, to_unified_trackside, ReconciliationEngine};
pub use pace::{analyze, laps_to_close, pace_advantage, PaceReport};
