//! Local control channel for CozyLife smart-home devices (switches, lights,
//! energy-storage units) over their line-delimited JSON protocol on TCP
//! port 5555.
//!
//! The heart of the crate is [`client::DeviceClient`]: it owns the
//! connection, performs the info handshake that establishes the device's
//! identity, and keeps a cache of the device's data points fresh from a
//! background listener. Writes are fire-and-forget with optimistic local
//! state; reads never touch the network.
//!
//! [`scanner`] is a standalone one-shot probe over the same wire format,
//! used by the `cozylife-scan` binary to sweep a subnet for devices.

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scanner;

pub use client::{DeviceClient, DeviceIdentity};
pub use error::{Error, ProtocolError};
