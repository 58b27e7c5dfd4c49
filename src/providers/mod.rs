//! Provider clients
//!
//! Two independent timing providers feed the reconciliation engine:
//! trackside (low-latency REST + hub live channel) and rmonitor (REST with
//! token-in-body POSTs plus a plain-socket line protocol).

pub mod rmonitor_rest;
pub mod rmonitor_stream;
pub mod trackside_rest;

pub use rmonitor_rest::{RmCompetitor, RmRace, RmonitorRestClient};
pub use rmonitor_stream::{parse_line, RmRecord};
pub use trackside_rest::{TracksideEvent, TracksideRestClient, TracksideSession};
