//! Live channel: connection management and envelope decoding

pub mod connection;
pub mod envelope;

pub use connection::{
    backoff_delay, ConnectionManager, ConnectionState, HubTransport, LiveTransport, Subscription,
    SubscriptionKind,
};
pub use envelope::{decode_envelope, dispatch, encode_envelope, LiveEvent, COMPRESSED_PREFIX};
