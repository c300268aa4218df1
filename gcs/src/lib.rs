//! Guest Compute Service core.
//!
//! Data flow: [`transport`] <-> [`bridge`] <-> ([`host`] | [`container`] |
//! [`process`]). Notifications flow process -> container -> host -> bridge
//! -> transport.

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod container;
pub mod host;
pub mod process;
pub mod relay;
pub mod runtime;
pub mod transport;
