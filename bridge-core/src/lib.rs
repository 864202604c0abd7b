//! The reactor, wire protocol, client state machine and routing core
//! shared by every transport the daemon bridges between: the event loop
//! a TCP listener and the hardware stacks all plug into.

pub mod auth;
pub mod client;
pub mod io;
pub mod packet;
pub mod reactor;
pub mod routing;
pub mod stack;
pub mod writer;

pub use client::{Client, ClientId};
pub use packet::{EnumerateCallback, Packet, PacketBuilder, PacketError};
pub use reactor::{Interest, Reactor, SourceType, StopHandle};
pub use routing::Router;
pub use stack::{Recipient, Stack, StackId};
