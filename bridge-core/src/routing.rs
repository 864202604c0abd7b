//! The routing core: correlates request packets sent out to a hardware
//! stack with the response that eventually comes back, across client
//! disconnects. Grounded on spec.md §4.5 (no `hardware.c`/`network.c` was
//! available in the retrieved original source, so the algorithm below is
//! a direct translation of the prose contract there) and on
//! `daemonlib/event.c`'s intrusive-list style, expressed as a `slab`
//! arena instead of raw pointers.

use slab::Slab;
use std::collections::HashMap;

use crate::client::ClientId;
use crate::packet::Packet;
use crate::stack::{Recipient, StackId};

/// How long a pending request survives its client's disconnect before
/// being discarded as unroutable. Chosen as an Open Question resolution:
/// long enough that a slow peripheral's response still finds its home
/// across a reconnect-in-progress, short enough not to leak memory under
/// a churning client population.
pub const ZOMBIE_GRACE_PERIOD_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct RequestKey {
    uid: u32,
    function_id: u8,
    sequence_number: u8,
}

impl RequestKey {
    fn of(packet: &Packet) -> RequestKey {
        RequestKey {
            uid: packet.uid(),
            function_id: packet.function_id(),
            sequence_number: packet.sequence_number(),
        }
    }
}

type RequestSlot = usize;

struct PendingRequest {
    key: RequestKey,
    stack_id: StackId,
    owner: Owner,
}

#[derive(Debug, Clone, Copy)]
enum Owner {
    Client(ClientId),
    /// Client disconnected while this request was outstanding; the slot
    /// is kept alive until `expires_at` so a response that is already in
    /// flight doesn't land on nobody, same as the C daemon's "zombie"
    /// request.
    Zombie { expires_at: u64 },
}

/// Global pending-request table plus the per-client and zombie indices
/// spec.md §4.5 describes as parallel lists over the same entries.
pub struct Router {
    requests: Slab<PendingRequest>,
    by_client: HashMap<ClientId, Vec<RequestSlot>>,
    zombie_slots: Vec<RequestSlot>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            requests: Slab::new(),
            by_client: HashMap::new(),
            zombie_slots: Vec::new(),
        }
    }

    /// Registers a request as awaiting a response, if the packet asked
    /// for one. Call this right after handing the packet to the target
    /// stack's `dispatch_request`.
    pub fn track_request(&mut self, packet: &Packet, client_id: ClientId, stack_id: StackId) {
        if !packet.response_expected() {
            return;
        }

        let slot = self.requests.insert(PendingRequest {
            key: RequestKey::of(packet),
            stack_id,
            owner: Owner::Client(client_id),
        });

        self.by_client.entry(client_id).or_insert_with(Vec::new).push(slot);
    }

    /// Looks up which client (if any) should receive a response/callback
    /// packet coming back from `stack_id`, consuming the pending-request
    /// entry on a match. Broadcast-style callbacks (sequence number 0)
    /// never match anything here; callers route those as
    /// `Recipient::Broadcast` directly.
    pub fn resolve_response(&mut self, packet: &Packet, stack_id: StackId) -> Option<Recipient> {
        if packet.sequence_number() == 0 {
            return Some(Recipient::Broadcast);
        }

        let key = RequestKey::of(packet);

        let found = self.requests.iter().find_map(|(slot, req)| {
            if req.key == key && req.stack_id == stack_id {
                Some(slot)
            } else {
                None
            }
        })?;

        let request = self.requests.remove(found);

        match request.owner {
            Owner::Client(client_id) => {
                if let Some(slots) = self.by_client.get_mut(&client_id) {
                    slots.retain(|s| *s != found);
                }
                Some(Recipient::Client(client_id))
            }
            Owner::Zombie { .. } => {
                self.zombie_slots.retain(|s| *s != found);
                None
            }
        }
    }

    /// Moves every request still outstanding for a disconnecting client
    /// into the zombie list instead of dropping it immediately, so a
    /// response already in flight from the hardware side isn't silently
    /// lost. `now` is the caller's monotonic/unix timestamp source
    /// (`support::time::timestamp_secs`).
    pub fn disconnect_client(&mut self, client_id: ClientId, now: u64) {
        let slots = match self.by_client.remove(&client_id) {
            Some(slots) => slots,
            None => return,
        };

        let expires_at = now + ZOMBIE_GRACE_PERIOD_SECS;

        for slot in slots {
            if let Some(request) = self.requests.get_mut(slot) {
                request.owner = Owner::Zombie { expires_at };
                self.zombie_slots.push(slot);
            }
        }
    }

    /// Drops zombie requests whose grace period has elapsed. Intended to
    /// be called once per reactor tick against a monotonic clock.
    pub fn reap_zombies(&mut self, now: u64) {
        let expired: Vec<RequestSlot> = self
            .zombie_slots
            .iter()
            .copied()
            .filter(|slot| match self.requests.get(*slot) {
                Some(req) => match req.owner {
                    Owner::Zombie { expires_at } => expires_at <= now,
                    Owner::Client(_) => false,
                },
                None => true,
            })
            .collect();

        for slot in &expired {
            self.requests.remove(*slot);
        }

        self.zombie_slots.retain(|slot| !expired.contains(slot));
    }

    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    pub fn zombie_count(&self) -> usize {
        self.zombie_slots.len()
    }
}

impl Default for Router {
    fn default() -> Router {
        Router::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBuilder;

    fn request(uid: u32, function_id: u8, seq: u8) -> Packet {
        PacketBuilder::new(uid, function_id).sequence_number(seq).response_expected(true).build().unwrap()
    }

    fn response(uid: u32, function_id: u8, seq: u8) -> Packet {
        PacketBuilder::new(uid, function_id).sequence_number(seq).build().unwrap()
    }

    #[test]
    fn test_request_then_response_resolves_to_owning_client() {
        let mut router = Router::new();
        let req = request(1, 2, 3);
        router.track_request(&req, 7, 0);

        let resp = response(1, 2, 3);
        assert_eq!(router.resolve_response(&resp, 0), Some(Recipient::Client(7)));
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_response_resolves_to_none() {
        let mut router = Router::new();
        let resp = response(1, 2, 3);
        assert_eq!(router.resolve_response(&resp, 0), None);
    }

    #[test]
    fn test_zero_sequence_is_always_broadcast() {
        let mut router = Router::new();
        let callback = response(1, 2, 0);
        assert_eq!(router.resolve_response(&callback, 0), Some(Recipient::Broadcast));
    }

    #[test]
    fn test_disconnect_preserves_pending_request_as_zombie() {
        let mut router = Router::new();
        let req = request(1, 2, 3);
        router.track_request(&req, 7, 0);

        router.disconnect_client(7, 1000);
        assert_eq!(router.zombie_count(), 1);

        let resp = response(1, 2, 3);
        assert_eq!(router.resolve_response(&resp, 0), None);
        assert_eq!(router.zombie_count(), 0);
    }

    #[test]
    fn test_zombie_reaped_after_grace_period() {
        let mut router = Router::new();
        let req = request(1, 2, 3);
        router.track_request(&req, 7, 0);
        router.disconnect_client(7, 1000);

        router.reap_zombies(1000 + ZOMBIE_GRACE_PERIOD_SECS - 1);
        assert_eq!(router.pending_count(), 1);

        router.reap_zombies(1000 + ZOMBIE_GRACE_PERIOD_SECS);
        assert_eq!(router.pending_count(), 0);
        assert_eq!(router.zombie_count(), 0);
    }
}
