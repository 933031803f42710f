//! Channel/callback bookkeeping and the subscription handle.
//!
//! The registry is the only place callback lifetimes are tracked; dispatch
//! clones the callbacks out and invokes them outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::realtime::proto::ClientMessage;

pub(crate) type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ChannelRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, EventCallback)>>,
}

impl ChannelRegistry {
    /// Registers a callback under a channel name and returns its id.
    ///
    /// Channel names are not unique across subscribers; every callback
    /// registered under a name fires for each event on it.
    pub(crate) fn register(&self, channel: String, callback: EventCallback) -> u64 {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        inner.next_id += 1;
        let id = inner.next_id;
        inner.channels.entry(channel).or_default().push((id, callback));
        id
    }

    /// Removes exactly the `(channel, id)` pair; other subscribers on the
    /// same channel are untouched. Returns whether anything was removed.
    pub(crate) fn deregister(&self, channel: &str, id: u64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(callbacks) = inner.channels.get_mut(channel) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(callback_id, _)| *callback_id != id);
        let removed = callbacks.len() < before;
        if callbacks.is_empty() {
            inner.channels.remove(channel);
        }
        removed
    }

    /// Invokes every callback registered under `channel` once.
    pub(crate) fn dispatch(&self, channel: &str, payload: &Value) {
        let callbacks: Vec<EventCallback> = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            inner
                .channels
                .get(channel)
                .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(payload);
        }
    }

    /// Names of all channels with at least one subscriber.
    pub(crate) fn channel_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.channels.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every registration. Outstanding [`Subscription`] handles stay
    /// safe to release; their deregistration becomes a no-op.
    pub(crate) fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.channels.clear();
        }
    }
}

/// Handle for one registered callback on one channel.
///
/// Releasing the handle, either via [`Subscription::unsubscribe`] or by
/// dropping it, deregisters the callback locally and emits a single
/// `unsubscribe` interest event upstream. Release happens at most once per
/// handle and never panics, even after the connection is closed.
pub struct Subscription {
    registry: Arc<ChannelRegistry>,
    commands: mpsc::UnboundedSender<ClientMessage>,
    channel: String,
    id: u64,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(
        registry: Arc<ChannelRegistry>,
        commands: mpsc::UnboundedSender<ClientMessage>,
        channel: String,
        id: u64,
    ) -> Self {
        Self {
            registry,
            commands,
            channel,
            id,
            released: false,
        }
    }

    /// The channel name this subscription is registered under.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Releases the subscription explicitly.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.deregister(&self.channel, self.id);
        // Best-effort: the worker may already be gone.
        let _ = self.commands.send(ClientMessage::Unsubscribe {
            channel: self.channel.clone(),
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
