//! Reference relay server for relaywire.
//!
//! Accepts WebSocket connections, registers clients by the username in their
//! Hello, and fans every later frame out to all other clients. Exposed as a
//! library so integration tests can run a relay in-process.

pub mod config;
pub mod relay;
