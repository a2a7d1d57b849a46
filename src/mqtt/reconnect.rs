//! Bounded reconnection with platform recovery.
//!
//! [`Client::reconnect`] keeps calling [`Client::connect`] while failures are
//! transient (transport errors and CONNACK timeouts). Every
//! [`ReconnectPolicy::max_retries`] consecutive failures it asks the platform
//! to [`hard_reset`](Platform::hard_reset) the network path and starts
//! counting again. A broker refusal or a local encoding error is not going to
//! fix itself, so those are returned immediately.
//!
//! A QoS 1 publish cut off by the failure stays recorded only when the broker
//! resumes the session (`clean_session: false` and session present). Call
//! [`Client::retry_pending`] or [`Client::abandon_pending`] before the next
//! QoS 1 publish in that case.

use crate::fmt::{info, warning};
use crate::mqtt::client::Client;
use crate::mqtt::error::Error;
use crate::mqtt::packet::{MAX_SUBSCRIBE_TOPICS, QoS};
use crate::mqtt::platform::Platform;
use crate::mqtt::registry::MAX_TOPIC_LEN;
use crate::network::Connect;
use heapless::{String, Vec};

/// How [`Client::reconnect`] retries.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before a hard reset.
    pub max_retries: u32,
    /// Clean-session flag for the new connection.
    pub clean_session: bool,
    /// Re-send SUBSCRIBE for every registered topic once connected.
    pub resubscribe: bool,
    /// Give up after this many hard resets. `None` retries forever.
    pub max_resets: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 30,
            clean_session: false,
            resubscribe: false,
            max_resets: None,
        }
    }
}

impl<'a, N, P, const MAX_SUBS: usize, const BUF: usize> Client<'a, N, P, MAX_SUBS, BUF>
where
    N: Connect,
    P: Platform,
{
    /// Re-establish the session after it dropped.
    ///
    /// Returns the CONNACK session-present flag of the successful attempt.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyConnected`] - the session is still connected
    /// * any non-transient error from [`connect`](Self::connect)
    /// * the last transient error once `max_resets` hard resets were spent
    /// * errors from resubscribing, when the policy asks for it
    pub fn reconnect(&mut self, policy: &ReconnectPolicy) -> Result<bool, Error> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let mut retries = 0u32;
        let mut resets = 0u32;
        let session_present = loop {
            match self.connect(policy.clean_session) {
                Ok(session_present) => break session_present,
                Err(err) if err.is_transient() => {
                    retries += 1;
                    warning!("Reconnect attempt {} failed", retries);
                    if retries < policy.max_retries.max(1) {
                        continue;
                    }
                    if policy.max_resets.is_some_and(|max| resets >= max) {
                        return Err(err);
                    }
                    warning!("Retry budget used up, resetting network");
                    self.platform_mut().hard_reset();
                    resets += 1;
                    retries = 0;
                }
                Err(err) => return Err(err),
            }
        };
        info!("Reconnected after {} reset(s)", resets);

        if policy.resubscribe {
            self.resubscribe()?;
        }
        Ok(session_present)
    }

    /// Send SUBSCRIBE again for every registered topic, keeping the
    /// registered handlers as they are. Topics are batched up to
    /// [`MAX_SUBSCRIBE_TOPICS`] per frame.
    ///
    /// # Errors
    ///
    /// Fails like [`Client::subscribe`]; a rejected topic fails with
    /// [`Error::SubscriptionRejected`] after the rest of its batch was
    /// acknowledged.
    pub fn resubscribe(&mut self) -> Result<(), Error> {
        let mut topics: Vec<(String<MAX_TOPIC_LEN>, QoS), MAX_SUBS> = Vec::new();
        for subscription in self.registry().iter() {
            let mut topic = String::new();
            // registry topics already fit MAX_TOPIC_LEN
            let _ = topic.push_str(subscription.topic());
            let _ = topics.push((topic, subscription.qos()));
        }
        for batch in topics.chunks(MAX_SUBSCRIBE_TOPICS) {
            let mut filters: Vec<(&str, QoS), MAX_SUBSCRIBE_TOPICS> = Vec::new();
            for (topic, qos) in batch {
                info!("Resubscribing to {}", topic.as_str());
                let _ = filters.push((topic.as_str(), *qos));
            }
            let ack = self.request_subscribe(&filters)?;
            for index in 0..filters.len() {
                if let Some(granted) = ack.granted_qos_at(index) {
                    granted?;
                }
            }
        }
        Ok(())
    }
}
