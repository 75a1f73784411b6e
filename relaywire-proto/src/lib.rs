//! Shared protocol definitions for the relaywire wire format.

pub mod codec;
pub mod frame;
