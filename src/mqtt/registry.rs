//! Subscription registry: exact topic → message handler.
//!
//! The client does no wildcard matching. A PUBLISH is delivered to the handler
//! registered for exactly its topic, and frames for topics nobody registered are
//! dropped. Storage is a fixed-capacity `heapless` vector, so the number of
//! simultaneous subscriptions is a compile-time constant.
//!
//! # Examples
//!
//! ```rust
//! use core::cell::Cell;
//! use minimqtt::mqtt::registry::Registry;
//! use minimqtt::mqtt::QoS;
//!
//! let count = Cell::new(0);
//! let counter = |_topic: &str, _payload: &[u8]| count.set(count.get() + 1);
//!
//! let mut registry: Registry<'_, 4> = Registry::new();
//! registry.add("home/door", QoS::AtMostOnce, Some(&counter)).unwrap();
//!
//! assert!(registry.dispatch("home/door", b"open"));
//! assert!(!registry.dispatch("home/window", b"open"));
//! assert_eq!(count.get(), 1);
//! ```

use crate::fmt::info;
use crate::mqtt::error::{EncodingError, Error};
use crate::mqtt::packet::QoS;
use heapless::{String, Vec};

/// Longest topic the registry can store.
pub const MAX_TOPIC_LEN: usize = 256;

/// Receives messages for one subscribed topic.
///
/// Handlers run inside the inbound-processing path and return nothing: they
/// have no way to fail the frame that delivered the message. Closures of the
/// form `|topic: &str, payload: &[u8]| { ... }` implement this trait; use
/// interior mutability (`Cell`, `RefCell`) to record state.
pub trait Handler {
    /// Called once per delivered message.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

impl<F> Handler for F
where
    F: Fn(&str, &[u8]),
{
    fn on_message(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

/// Handler used when a subscription is made without one: logs and returns.
pub fn default_handler(topic: &str, payload: &[u8]) {
    info!("New message on {}: {} bytes", topic, payload.len());
}

/// One registered topic.
pub struct Subscription<'h> {
    topic: String<MAX_TOPIC_LEN>,
    qos: QoS,
    handler: Option<&'h dyn Handler>,
}

impl<'h> Subscription<'h> {
    /// Subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// QoS requested when subscribing, reused on resubscribe.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        match self.handler {
            Some(handler) => handler.on_message(topic, payload),
            None => default_handler(topic, payload),
        }
    }
}

impl core::fmt::Debug for Subscription<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic.as_str())
            .field("qos", &self.qos)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Fixed-capacity map from exact topic to handler.
#[derive(Debug)]
pub struct Registry<'h, const N: usize> {
    entries: Vec<Subscription<'h>, N>,
}

impl<const N: usize> Default for Registry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'h, const N: usize> Registry<'h, N> {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `topic`. `None` installs [`default_handler`].
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadySubscribed`] - the topic is registered; the existing
    ///   handler is left in place
    /// * [`Error::RegistryFull`] - all `N` slots are used
    /// * [`EncodingError::InvalidTopic`] - the topic does not fit [`MAX_TOPIC_LEN`]
    pub fn add(&mut self, topic: &str, qos: QoS, handler: Option<&'h dyn Handler>) -> Result<(), Error> {
        if self.contains(topic) {
            return Err(Error::AlreadySubscribed);
        }
        let mut owned = String::new();
        owned
            .push_str(topic)
            .map_err(|_| EncodingError::InvalidTopic)?;
        self.entries
            .push(Subscription {
                topic: owned,
                qos,
                handler,
            })
            .map_err(|_| Error::RegistryFull)
    }

    /// Remove `topic`. Removing an absent topic is not an error.
    pub fn remove(&mut self, topic: &str) {
        if let Some(index) = self.entries.iter().position(|s| s.topic == topic) {
            self.entries.swap_remove(index);
        }
    }

    /// Deliver a message to the handler for exactly `topic`.
    ///
    /// Returns whether a handler was found; unmatched topics are dropped.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        match self.get(topic) {
            Some(subscription) => {
                subscription.deliver(topic, payload);
                true
            }
            None => false,
        }
    }

    /// Look up the subscription for `topic`.
    pub fn get(&self, topic: &str) -> Option<&Subscription<'h>> {
        self.entries.iter().find(|s| s.topic == topic)
    }

    /// Whether `topic` is registered.
    pub fn contains(&self, topic: &str) -> bool {
        self.get(topic).is_some()
    }

    /// Whether another topic can be added.
    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// Iterate over the registered subscriptions.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription<'h>> {
        self.entries.iter()
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no topic is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every subscription.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
