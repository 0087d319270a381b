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

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use dice2p::{ChannelId, Messages};

use crate::bet::BetStatus;
use crate::chain::ConfirmedEvent;
use crate::channel::ChannelStatus;
use crate::proofs::CooperativeSettleProof;

/// Names under which external subscribers register callbacks: one per
/// protocol message receipt, per state transition and per chain event.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
)]
pub enum EventKind {
    // Protocol message receipts
    #[display("bet_request")]
    BetRequest,
    #[display("bet_response")]
    BetResponse,
    #[display("locked_transfer")]
    LockedTransfer,
    #[display("locked_transfer_r")]
    LockedTransferR,
    #[display("direct_transfer")]
    DirectTransfer,
    #[display("direct_transfer_r")]
    DirectTransferR,
    #[display("preimage")]
    Preimage,
    #[display("cooperative_settle_request")]
    CooperativeSettleRequest,
    #[display("cooperative_settle_response")]
    CooperativeSettleResponse,

    // Local state transitions
    #[display("channel_status_changed")]
    ChannelStatusChanged,
    #[display("bet_status_changed")]
    BetStatusChanged,

    // Chain events, as reconciled
    #[display("channel_opened")]
    ChannelOpened,
    #[display("channel_new_deposit")]
    ChannelNewDeposit,
    #[display("channel_closed")]
    ChannelClosed,
    #[display("non_closing_balance_proof_updated")]
    NonClosingBalanceProofUpdated,
    #[display("channel_unlocked")]
    ChannelUnlocked,
    #[display("channel_settled")]
    ChannelSettled,

    // Engine notifications
    #[display("cooperative_settle_ready")]
    CooperativeSettleReady,
    #[display("round_timeout")]
    RoundTimeout,
    #[display("round_frozen")]
    RoundFrozen,
}

/// Payloads delivered to subscribers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DomainEvent {
    /// A protocol message was received and accepted.
    Message(Messages),

    /// A channel changed status.
    ChannelStatus {
        channel_id: ChannelId,
        old: ChannelStatus,
        new: ChannelStatus,
    },

    /// A bet round advanced.
    BetStatus {
        channel_id: ChannelId,
        round: u64,
        old: BetStatus,
        new: BetStatus,
    },

    /// A confirmed chain event was reconciled into local state.
    Chain(ConfirmedEvent),

    /// Both cooperative settle signatures are present; the proof can be
    /// submitted.
    CooperativeSettleReady(CooperativeSettleProof),

    /// The peer missed its response deadline; the round is frozen.
    RoundTimeout { channel_id: ChannelId, round: u64 },

    /// The round was halted by policy (a manual auto-respond switch) or by
    /// a validation failure.
    RoundFrozen { channel_id: ChannelId, round: u64 },
}

impl DomainEvent {
    /// The name subscribers register under to receive this event.
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Message(message) => match message {
                Messages::BetRequest(_) => EventKind::BetRequest,
                Messages::BetResponse(_) => EventKind::BetResponse,
                Messages::LockedTransfer(_) => EventKind::LockedTransfer,
                Messages::LockedTransferR(_) => EventKind::LockedTransferR,
                Messages::DirectTransfer(_) => EventKind::DirectTransfer,
                Messages::DirectTransferR(_) => EventKind::DirectTransferR,
                Messages::Preimage(_) => EventKind::Preimage,
                Messages::CooperativeSettleRequest(_) => {
                    EventKind::CooperativeSettleRequest
                }
                Messages::CooperativeSettleResponse(_) => {
                    EventKind::CooperativeSettleResponse
                }
            },
            DomainEvent::ChannelStatus { .. } => EventKind::ChannelStatusChanged,
            DomainEvent::BetStatus { .. } => EventKind::BetStatusChanged,
            DomainEvent::Chain(confirmed) => confirmed.event.kind(),
            DomainEvent::CooperativeSettleReady(_) => {
                EventKind::CooperativeSettleReady
            }
            DomainEvent::RoundTimeout { .. } => EventKind::RoundTimeout,
            DomainEvent::RoundFrozen { .. } => EventKind::RoundFrozen,
        }
    }
}

type Callback = Box<dyn FnMut(&DomainEvent)>;

/// Subscriber registry: exactly one callback per event name, later
/// registration replacing the earlier one.
#[derive(Default)]
pub struct EventBus {
    handlers: BTreeMap<EventKind, Callback>,
}

impl EventBus {
    pub fn new() -> EventBus { EventBus::default() }

    /// Registers `callback` for `kind`, replacing any previous handler.
    pub fn on(
        &mut self,
        kind: EventKind,
        callback: impl FnMut(&DomainEvent) + 'static,
    ) {
        self.handlers.insert(kind, Box::new(callback));
    }

    /// Removes the handler for `kind`, if any.
    pub fn off(&mut self, kind: EventKind) { self.handlers.remove(&kind); }

    /// Delivers `event` to the handler registered under its kind.
    pub fn emit(&mut self, event: &DomainEvent) {
        if let Some(handler) = self.handlers.get_mut(&event.kind()) {
            handler(event);
        }
    }
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
