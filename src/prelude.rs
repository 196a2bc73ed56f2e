//! Convenience re-exports for the common path: open a connection (or a
//! solar-harvesting `Node`), drive it with `poll`, push payloads with
//! `send`.

pub use crate::address::NodeAddr;
pub use crate::config::Config;
pub use crate::connection::{Callbacks, Connection};
pub use crate::error::Error;
pub use crate::extender::Extender;
pub use crate::header::{ChannelAttributes, PacketType};
pub use crate::link::Link;
pub use crate::node::Node;
pub use crate::weight::{BasicWeight, EnergyAwareWeight, Weight};
