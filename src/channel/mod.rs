//! Channel delivery
//!
//! Channels are plugins at or above
//! [`CHANNEL_PRIORITY_THRESHOLD`](crate::plugin::CHANNEL_PRIORITY_THRESHOLD).
//! They never sit in the main chain themselves; the [`ChannelController`]
//! holds them in parallel queues and takes their place in the chain.

mod controller;

pub use controller::{CHANNEL_CONTROLLER_IDENTIFIER, ChannelController, ChannelQueue};
