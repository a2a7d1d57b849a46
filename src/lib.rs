//! # minimqtt - blocking MQTT v3.1.1 client for constrained devices
//!
//! A small, allocation-free MQTT client engine for microcontrollers and
//! Linux gateways. It speaks MQTT 3.1.1 over any byte stream that implements
//! the [`network`] traits, keeps every buffer at a compile-time capacity, and
//! runs in `no_std` environments.
//!
//! ## Features
//!
//! - CONNECT with credentials, last will and generated client identifiers
//! - PUBLISH at QoS 0 and 1, with a single tracked in-flight QoS 1 message
//! - SUBSCRIBE/UNSUBSCRIBE with per-topic handlers (exact topic match)
//! - Keep-alive pings and a polling loop that acknowledges inbound QoS 1
//! - Bounded reconnection that hard-resets the network path when stuck
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! minimqtt = "0.1.0"
//! ```
//!
//! A transport implements [`network::Connect`] and a board implements
//! [`mqtt::Platform`]; see [`mqtt::client`] for a complete example.
//!
//! ## Optional Features
//!
//! - `std`: standard library support and a `TcpStream` transport
//! - `log`: route diagnostics through the `log` facade
//! - `defmt`: route diagnostics through `defmt` for embedded debugging

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

mod fmt;

/// Transport traits the MQTT engine runs over.
///
/// Implement [`network::Connect`] and [`network::Connection`] for a socket,
/// a TLS session or a modem driver.
pub mod network;

/// The MQTT 3.1.1 client engine.
pub mod mqtt;
