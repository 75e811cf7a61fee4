//! Chat channel abstraction: the [`Channel`] trait every transport adapter
//! implements, plus the [`ChannelManager`] that wires adapters onto the
//! message bus.

pub mod base;
pub mod manager;

pub use base::{is_allowed, Channel};
pub use manager::ChannelManager;
