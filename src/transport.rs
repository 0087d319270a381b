// Dice channel core library: off-chain state machines for a two-party
// wagering payment channel settled on EVM-compatible chains
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use dice2p::Messages;
use ethereum_types::Address;

/// Outgoing edge of the message bus.
///
/// Implementations serialise the message as UTF-8 JSON and are responsible
/// for in-order, reliable delivery within one channel peer-pair for the
/// session. Emission is fire-and-forget from the engine's point of view: the
/// engine has already persisted the message when it emits, and an undelivered
/// message surfaces later as a peer timeout, never as a send error.
pub trait MessageSender {
    fn send(&mut self, to: Address, message: &Messages);
}

/// In-memory transport endpoint: queues messages for a test harness (or a
/// local demo loop) to drain and feed into the peer's client.
#[derive(Clone, Debug, Default)]
pub struct Loopback {
    queue: Rc<RefCell<VecDeque<(Address, Messages)>>>,
}

impl Loopback {
    pub fn new() -> Loopback { Loopback::default() }

    /// Takes all queued messages in emission order.
    pub fn drain(&self) -> Vec<(Address, Messages)> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool { self.queue.borrow().is_empty() }
}

impl MessageSender for Loopback {
    fn send(&mut self, to: Address, message: &Messages) {
        self.queue.borrow_mut().push_back((to, message.clone()));
    }
}

#[cfg(test)]
mod test {
    use dice2p::{ChannelId, Preimage, Secret, Signature};

    use super::*;

    #[test]
    fn loopback_preserves_emission_order() {
        let mut link = Loopback::new();
        let to = Address::repeat_byte(0xbb);
        for round in 1..=3 {
            link.send(
                to,
                &Messages::Preimage(Preimage {
                    channel_id: ChannelId::default(),
                    round,
                    ra: Secret::default(),
                    signature: Signature::default(),
                }),
            );
        }
        let drained = link.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].1.round(), Some(1));
        assert_eq!(drained[2].1.round(), Some(3));
        assert!(link.is_empty());
    }
}
