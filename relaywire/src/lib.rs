//! relaywire: reconnecting, end-to-end encrypted chat transport over a
//! fan-out relay.
//!
//! The [`supervisor::Supervisor`] is the entry point. It owns the relay
//! connection and layers identity exchange, sealed direct messages and
//! chunked transfers on top of it, reporting everything through an
//! [`events::EventDispatcher`].

pub mod config;
pub mod crypto;
pub mod events;
pub mod supervisor;
pub mod transfer;
pub mod transport;
