//! Wire protocol shared between the OLTalk server and clients.
//!
//! `wire` holds the framed binary codec; `types` holds the serde types
//! carried in each frame's metadata JSON.

pub mod types;
pub mod wire;

pub use wire::{FrameError, Packet, PacketType};
