//! Realtime subscription modules.
//!
//! - `client`: websocket transport, command queue, and reconnect handling.
//! - `proto`: protocol messages and channel-name builders.
//! - `registry`: channel/callback bookkeeping and subscription handles.

/// Websocket connection and subscription entry points.
pub mod client;
/// Realtime protocol messages.
pub mod proto;
/// Channel registry and the `Subscription` handle.
pub mod registry;
