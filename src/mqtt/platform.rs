//! Board services the MQTT session needs but cannot provide itself.
//!
//! This trait must be implemented by the target platform. It supplies the
//! material for a default client identifier, a monotonic clock used to bound
//! acknowledgement waits and drive keep-alive pings, a blocking delay used to
//! pace batched publishes, and the hard-reset hook the reconnection policy
//! invokes once its retry budget is exhausted.

use crate::mqtt::error::{EncodingError, Error};
use crate::mqtt::packet::MAX_CLIENT_ID_LEN;
use core::fmt::Write;
use core::time::Duration;
use heapless::String;

/// Platform-specific services.
pub trait Platform {
    /// Bytes that identify this board, e.g. a CPU or MAC serial.
    fn unique_id(&self) -> &[u8];

    /// A random number; does not need to be cryptographically strong.
    fn random(&mut self) -> u32;

    /// Milliseconds from an arbitrary, monotonic epoch.
    fn now_ms(&self) -> u64;

    /// Block for `duration`.
    fn delay(&mut self, duration: Duration);

    /// Recover the network path, e.g. power-cycle the WiFi co-processor.
    ///
    /// Called only after the reconnection policy has used up its retries.
    fn hard_reset(&mut self);
}

/// Build a client identifier `"{prefix}{uid byte}{digit}"`, where the byte is
/// picked at random from [`Platform::unique_id`] and the digit is random.
///
/// Generated identifiers always satisfy the 1–23 byte rule; a prefix that
/// makes them longer fails with [`EncodingError::InvalidClientId`].
pub fn generate_client_id<P: Platform + ?Sized>(
    platform: &mut P,
    prefix: &str,
) -> Result<String<MAX_CLIENT_ID_LEN>, Error> {
    let mut id: String<MAX_CLIENT_ID_LEN> = String::new();
    id.push_str(prefix)
        .map_err(|_| EncodingError::InvalidClientId)?;

    let uid_len = platform.unique_id().len();
    if uid_len > 0 {
        let pick = platform.random() as usize % uid_len;
        let byte = platform.unique_id()[pick];
        write!(id, "{byte}").map_err(|_| EncodingError::InvalidClientId)?;
    }
    let digit = platform.random() % 10;
    write!(id, "{digit}").map_err(|_| EncodingError::InvalidClientId)?;
    Ok(id)
}
