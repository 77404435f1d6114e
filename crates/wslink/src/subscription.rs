//! Topic subscription registry

use crate::{Result, SessionError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use wslink_proto::Value;

/// Callback invoked with the payload of every event published on a topic
///
/// The payload is the event's result wrapped in a one-element slice.
pub type Callback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Mapping from topic to callbacks, in subscription order
///
/// The same callback may be registered more than once. Topics are never
/// removed, only their callback lists shrink.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, Vec<Callback>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self.topics.iter().map(|(t, cbs)| (t.as_str(), cbs.len())).collect();
        f.debug_struct("SubscriptionRegistry").field("topics", &counts).finish()
    }
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    // compare data pointers only; vtable pointers may differ across codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to a topic
    pub fn add(&mut self, topic: impl Into<String>, callback: Callback) {
        self.topics.entry(topic.into()).or_default().push(callback);
    }

    /// Remove the first registration of `callback` under `topic`
    pub fn remove(&mut self, topic: &str, callback: &Callback) -> Result<()> {
        let callbacks = self.topics.get_mut(topic).ok_or_else(|| {
            SessionError::client_side(format!("Unsubscribe call {} unsuccessful: not subscribed", topic))
        })?;

        let index = callbacks.iter().position(|cb| same_callback(cb, callback)).ok_or_else(|| {
            SessionError::client_side(format!("Unsubscribe call {} unsuccessful: callback not found", topic))
        })?;

        callbacks.remove(index);
        Ok(())
    }

    /// Callbacks registered under `topic`, in subscription order
    pub fn callbacks(&self, topic: &str) -> Vec<Callback> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Number of callbacks registered under `topic`
    pub fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Whether `topic` was ever subscribed to
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}
