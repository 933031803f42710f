//! Rust client SDK for the Frappe application platform.
//!
//! The crate is organized by transport surface:
//! - `client`: HTTP client context and whitelisted method calls.
//! - `db`: document CRUD against Frappe's REST resource API.
//! - `auth`: session login/logout and identity queries.
//! - `realtime`: websocket subscription client for named channels.
//! - `state`: loading/error state containers around the remote operations.

/// Session authentication and identity helpers.
pub mod auth;
/// Client context, method calls, and error types.
pub mod client;
/// Document CRUD operations and list query options.
pub mod db;
/// Realtime websocket client, protocol types, and subscriptions.
pub mod realtime;
/// State containers tracking loading/error/result for remote operations.
pub mod state;

pub use auth::{LoginResponse, GUEST_USER};
pub use client::{ClientError, ClientOptions, FrappeClient, DEFAULT_BASE_URL};
pub use db::ListOptions;
pub use realtime::client::{RealtimeClient, RealtimeError};
pub use realtime::registry::Subscription;
pub use state::{
    AuthResource, CrudHandle, DocResource, ListResource, MethodCall, OperationState, StateSnapshot,
};
