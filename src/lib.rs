//! termbroker: a browser-accessible interactive shell broker. Bridges a
//! WebSocket terminal to an SSH session in a lazily-provisioned container.

pub mod broker;
pub mod channel;
pub mod config;
pub mod containers;
pub mod error;
pub mod http;
pub mod ports;
pub mod process;
pub mod ssh;
pub mod supervisor;
