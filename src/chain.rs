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

use dice2p::{ChannelId, Nonce, SecretHash, TokenAmount};
use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::channel::Error;
use crate::events::EventKind;
use crate::proofs::{
    CloseProof, CooperativeSettleProof, InitiatorSettleProof, SettleProof,
};

/// Hash of a submitted on-chain transaction.
pub type TxHash = H256;

/// An on-chain transaction reverted. The revert reason is surfaced
/// verbatim.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display("{operation} reverted: {reason}")]
pub struct ChainError {
    pub operation: &'static str,
    pub reason: String,
}

impl ChainError {
    pub fn new(operation: &'static str, reason: impl ToString) -> ChainError {
        ChainError {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Events emitted by the payment contract, as delivered by the chain
/// collaborator's websocket subscription.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ChainEvent {
    ChannelOpened {
        channel_id: ChannelId,
        participant1: Address,
        participant2: Address,
        settle_window: u64,
    },
    ChannelNewDeposit {
        channel_id: ChannelId,
        participant: Address,
        total_deposit: TokenAmount,
    },
    ChannelClosed {
        channel_id: ChannelId,
        closing_participant: Address,
        nonce: Nonce,
        balance_hash: H256,
    },
    NonClosingBalanceProofUpdated {
        channel_id: ChannelId,
        closing_participant: Address,
        nonce: Nonce,
        balance_hash: H256,
    },
    ChannelUnlocked {
        channel_id: ChannelId,
        participant: Address,
        lock_id: SecretHash,
        returned_amount: TokenAmount,
    },
    ChannelSettled {
        channel_id: ChannelId,
        participant1_amount: TokenAmount,
        participant2_amount: TokenAmount,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChainEvent::ChannelOpened { channel_id, .. }
            | ChainEvent::ChannelNewDeposit { channel_id, .. }
            | ChainEvent::ChannelClosed { channel_id, .. }
            | ChainEvent::NonClosingBalanceProofUpdated {
                channel_id, ..
            }
            | ChainEvent::ChannelUnlocked { channel_id, .. }
            | ChainEvent::ChannelSettled { channel_id, .. } => *channel_id,
        }
    }

    /// The subscriber event name this chain event is fanned out under.
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::ChannelOpened { .. } => EventKind::ChannelOpened,
            ChainEvent::ChannelNewDeposit { .. } => {
                EventKind::ChannelNewDeposit
            }
            ChainEvent::ChannelClosed { .. } => EventKind::ChannelClosed,
            ChainEvent::NonClosingBalanceProofUpdated { .. } => {
                EventKind::NonClosingBalanceProofUpdated
            }
            ChainEvent::ChannelUnlocked { .. } => EventKind::ChannelUnlocked,
            ChainEvent::ChannelSettled { .. } => EventKind::ChannelSettled,
        }
    }
}

/// A chain event together with the block it was mined in. The collaborator
/// only delivers events which are final under the configured confirmation
/// depth.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ConfirmedEvent {
    pub block_number: u64,
    #[serde(flatten)]
    pub event: ChainEvent,
}

/// The payment and game contracts, as consumed by the client. Implemented
/// by the blockchain collaborator; the core never talks RPC itself.
pub trait ChannelContract {
    fn open_channel(
        &mut self,
        partner: Address,
        settle_window: u64,
        deposit: TokenAmount,
    ) -> Result<TxHash, ChainError>;

    fn deposit(
        &mut self,
        partner: Address,
        amount: TokenAmount,
    ) -> Result<TxHash, ChainError>;

    fn get_channel_identifier(
        &self,
        partner: Address,
    ) -> Result<ChannelId, ChainError>;

    fn close_channel(
        &mut self,
        partner: Address,
        proof: &CloseProof,
    ) -> Result<TxHash, ChainError>;

    /// Settle-window submission of a newer partner balance proof by the
    /// non-closing side.
    fn update_non_closing_balance_proof(
        &mut self,
        partner: Address,
        proof: &CloseProof,
    ) -> Result<TxHash, ChainError>;

    fn cooperative_settle(
        &mut self,
        proof: &CooperativeSettleProof,
    ) -> Result<TxHash, ChainError>;

    fn settle(&mut self, proof: &SettleProof) -> Result<TxHash, ChainError>;

    fn unlock(
        &mut self,
        partner: Address,
        lock_id: SecretHash,
    ) -> Result<TxHash, ChainError>;

    fn initiator_settle(
        &mut self,
        proof: &InitiatorSettleProof,
    ) -> Result<TxHash, ChainError>;
}

/// Normalises the confirmed-event stream: events must arrive in block
/// order, and a step backwards deeper than the confirmation depth means the
/// chain the client acted on no longer exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct Reconciler {
    confirmation_depth: u64,
    last_block: u64,
}

impl Reconciler {
    pub fn new(confirmation_depth: u64) -> Reconciler {
        Reconciler {
            confirmation_depth,
            last_block: 0,
        }
    }

    pub fn last_block(&self) -> u64 { self.last_block }

    /// Accepts the event's block position, absorbing shallow jitter and
    /// failing fatally on a deep reorg.
    pub fn absorb(&mut self, block_number: u64) -> Result<(), Error> {
        if block_number + self.confirmation_depth < self.last_block {
            return Err(Error::FatalReorg {
                observed: block_number,
                last_processed: self.last_block,
            });
        }
        self.last_block = self.last_block.max(block_number);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_in_block_order_are_absorbed() {
        let mut reconciler = Reconciler::new(6);
        reconciler.absorb(10).unwrap();
        reconciler.absorb(11).unwrap();
        reconciler.absorb(11).unwrap();
        assert_eq!(reconciler.last_block(), 11);
    }

    #[test]
    fn shallow_reorg_is_absorbed() {
        let mut reconciler = Reconciler::new(6);
        reconciler.absorb(100).unwrap();
        // five blocks back: still within confirmation depth
        reconciler.absorb(95).unwrap();
        assert_eq!(reconciler.last_block(), 100);
    }

    #[test]
    fn deep_reorg_is_fatal() {
        let mut reconciler = Reconciler::new(6);
        reconciler.absorb(100).unwrap();
        assert_eq!(
            reconciler.absorb(93),
            Err(Error::FatalReorg {
                observed: 93,
                last_processed: 100,
            })
        );
    }

    #[test]
    fn chain_event_wire_format_is_tagged() {
        let event = ConfirmedEvent {
            block_number: 42,
            event: ChainEvent::ChannelClosed {
                channel_id: ChannelId::default(),
                closing_participant: Address::repeat_byte(0xaa),
                nonce: 7,
                balance_hash: H256::zero(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "ChannelClosed");
        assert_eq!(json["block_number"], 42);
        let back: ConfirmedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
