//! The `Stack` trait hardware backends (USB, RS-485) implement so the
//! routing core can dispatch requests without knowing which transport a
//! uid lives behind. Grounded on spec.md §4.5's `hardware_dispatch_request`
//! contract and `daemonlib/event.h`'s source-agnostic callback shape.

use crate::packet::Packet;

/// Identifies a hardware stack instance a request can be dispatched to.
/// Stacks are registered once at startup (one per USB device, one for
/// the RS-485 master) and never removed except on hot-unplug.
pub type StackId = usize;

/// A hardware-facing transport the routing core can hand a request
/// packet to, and which later hands responses/callbacks back.
pub trait Stack {
    fn id(&self) -> StackId;

    /// Human readable name used in log lines ("USB bulk interface 1-2",
    /// "RS-485 master").
    fn name(&self) -> &str;

    /// Returns true if this stack currently has a uid reachable behind it
    /// (spec.md's `stack_is_uid_connected` / enumerate bookkeeping is
    /// layered on top by `usb-stack`/`rs485-stack`, not here).
    fn dispatch_request(&mut self, packet: &Packet) -> std::io::Result<()>;
}

/// Where an incoming response/callback packet from a stack should be
/// delivered: the single client that issued the still-pending request,
/// or every currently authenticated client for an unsolicited callback.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Recipient {
    Client(crate::client::ClientId),
    Broadcast,
}
