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

use dice2p::{
    hash_balance_data, ChannelId, DirectTransfer, LockedTransfer,
    MessageError, Nonce, SecretHash, Signature, TokenAmount,
};
use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::bet::BetStatus;
use crate::chain::ChainError;
use crate::config::ConfigError;

/// Errors of the channel client, as surfaced to API callers.
///
/// Signature, nonce and balance-proof validation failures are always local
/// drops: the peer is never told why its message was discarded. Each variant
/// carries enough context to reconstruct the incident from logs alone.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// invalid signature on {kind} for channel {channel_id}: {details};
    /// message dropped
    InvalidSignature {
        channel_id: ChannelId,
        kind: &'static str,
        details: MessageError,
    },

    /// stale nonce {nonce} on {kind} for channel {channel_id}: last accepted
    /// nonce is {last_accepted}; message dropped
    StaleNonce {
        channel_id: ChannelId,
        kind: &'static str,
        nonce: Nonce,
        last_accepted: Nonce,
    },

    /// transfer on channel {channel_id} (round {round}) would break balance
    /// conservation; proposal rejected and round frozen
    BalanceConservationViolation { channel_id: ChannelId, round: u64 },

    /// channel {channel_id} is in state {current} which forbids {operation}
    WrongChannelState {
        channel_id: ChannelId,
        current: ChannelStatus,
        operation: &'static str,
    },

    /// round {round} on channel {channel_id} is in state {current} which
    /// forbids {operation}
    WrongBetState {
        channel_id: ChannelId,
        round: u64,
        current: BetStatus,
        operation: &'static str,
    },

    /// malformed {kind} on channel {channel_id} (round {round}): {reason};
    /// message dropped
    ProtocolViolation {
        channel_id: ChannelId,
        round: u64,
        kind: &'static str,
        reason: &'static str,
    },

    /// channel {0} is not known to this node
    UnknownChannel(ChannelId),

    /// no channel exists with partner {0}
    NoChannelWithPartner(Address),

    /// no bet at round {round} of channel {channel_id}
    UnknownBet { channel_id: ChannelId, round: u64 },

    /// no bet with id {0}
    UnknownBetId(H256),

    /// on-chain transaction rejected: {0}
    #[from]
    ChainRejected(ChainError),

    /// peer did not answer on channel {channel_id} (round {round}) within
    /// the deadline; round frozen
    Timeout { channel_id: ChannelId, round: u64 },

    /// chain reorganisation deeper than the confirmation depth: event from
    /// block {observed} arrived after block {last_processed} was final;
    /// halt and reconcile manually
    FatalReorg { observed: u64, last_processed: u64 },

    /// invalid client configuration: {0}
    #[from]
    Config(ConfigError),
}

/// Status of a channel.
///
/// Transitions happen on confirmed chain events only; off-chain messages
/// never move a channel between statuses.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Serialize,
    Deserialize,
)]
pub enum ChannelStatus {
    /// Channel is funded and operational.
    #[display("OPENED")]
    Opened,

    /// One side closed on-chain; the settle window is running.
    #[display("CLOSED")]
    Closed,

    /// The non-closing side submitted a newer balance proof during the
    /// settle window.
    #[display("UPDATE-BALANCE-PROOF")]
    UpdateBalanceProof,

    /// Settled on-chain. Terminal; the record is retained for audit.
    #[display("SETTLED")]
    Settled,
}

/// Summary of the latest balance-bearing message signed by one side: the
/// components of its on-chain balance hash plus the nonce and signature
/// which make it submittable as a proof.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BalanceProof {
    /// Counter of balance-bearing messages; 0 means no message was issued
    /// yet.
    pub nonce: Nonce,

    /// Cumulative amount transferred to the counterparty.
    pub transferred_amount: TokenAmount,

    /// Amount currently reserved under a round lock.
    pub locked_amount: TokenAmount,

    /// Lock id of the open round, or the null id.
    pub lock_id: SecretHash,

    /// Issuer's signature over `(channel, contract, nonce, balance_hash)`.
    pub signature: Signature,
}

impl BalanceProof {
    pub fn from_locked_transfer(msg: &LockedTransfer) -> Self {
        BalanceProof {
            nonce: msg.nonce,
            transferred_amount: msg.transferred_amount,
            locked_amount: msg.locked_amount,
            lock_id: msg.lock_id,
            signature: msg.signature,
        }
    }

    pub fn from_direct_transfer(msg: &DirectTransfer) -> Self {
        BalanceProof {
            nonce: msg.nonce,
            transferred_amount: msg.transferred_amount,
            locked_amount: TokenAmount::zero(),
            lock_id: SecretHash::none(),
            signature: msg.signature,
        }
    }

    /// The on-chain summary `keccak256(transferred ‖ locked ‖ lock_id)`.
    pub fn balance_hash(&self) -> H256 {
        hash_balance_data(
            self.transferred_amount,
            self.locked_amount,
            self.lock_id,
        )
    }
}

/// Balance hashes fixed at close time, one per side, from which the settle
/// tuple is later assembled.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CloseSnapshots {
    pub local: BalanceProof,
    pub remote: BalanceProof,
}

/// A bilateral funded relationship with one partner.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Channel {
    /// 32-byte id assigned by the payment contract at open.
    pub channel_id: ChannelId,

    /// This node's participant address.
    pub local: Address,

    /// The partner's participant address.
    pub remote: Address,

    pub status: ChannelStatus,

    /// Off-chain current view of the local spendable balance.
    pub local_balance: TokenAmount,

    /// Off-chain current view of the remote spendable balance.
    pub remote_balance: TokenAmount,

    /// Local funds reserved under the open round's lock.
    pub local_locked: TokenAmount,

    /// Remote funds reserved under the open round's lock.
    pub remote_locked: TokenAmount,

    /// Cumulative on-chain deposit of the local side.
    pub local_deposit: TokenAmount,

    /// Cumulative on-chain deposit of the remote side.
    pub remote_deposit: TokenAmount,

    /// Monotonic bet-round counter; 0 means no bet was ever initiated.
    pub current_round: u64,

    /// Nonce of the last balance-bearing message issued locally.
    pub local_nonce: Nonce,

    /// Nonce of the last accepted balance-bearing message from the partner.
    pub remote_nonce: Nonce,

    /// Latest balance-bearing message issued by the local side.
    pub latest_local_proof: BalanceProof,

    /// Latest accepted balance-bearing message from the partner.
    pub latest_remote_proof: BalanceProof,

    /// Populated once the channel reaches [`ChannelStatus::Closed`].
    pub close_snapshots: Option<CloseSnapshots>,

    /// Cooperative settle terms signed by the local side, if proposed.
    pub coop_local: Option<dice2p::CooperativeSettle>,

    /// Cooperative settle terms signed by the partner, if received.
    pub coop_remote: Option<dice2p::CooperativeSettle>,

    /// Blocks between close and settle finalisation.
    pub settle_window: u64,
}

impl Channel {
    /// New channel record as of its on-chain `ChannelOpened` event, before
    /// any deposit.
    pub fn with(
        channel_id: ChannelId,
        local: Address,
        remote: Address,
        settle_window: u64,
    ) -> Channel {
        Channel {
            channel_id,
            local,
            remote,
            status: ChannelStatus::Opened,
            local_balance: TokenAmount::zero(),
            remote_balance: TokenAmount::zero(),
            local_locked: TokenAmount::zero(),
            remote_locked: TokenAmount::zero(),
            local_deposit: TokenAmount::zero(),
            remote_deposit: TokenAmount::zero(),
            current_round: 0,
            local_nonce: 0,
            remote_nonce: 0,
            latest_local_proof: BalanceProof::default(),
            latest_remote_proof: BalanceProof::default(),
            close_snapshots: None,
            coop_local: None,
            coop_remote: None,
            settle_window,
        }
    }

    pub fn locked_total(&self) -> TokenAmount {
        self.local_locked + self.remote_locked
    }

    /// Conservation invariant: spendable balances plus locks always equal
    /// the sum of deposits.
    pub fn conserves_deposits(&self) -> bool {
        let assets = self
            .local_balance
            .checked_add(self.remote_balance)
            .and_then(|sum| sum.checked_add(self.local_locked))
            .and_then(|sum| sum.checked_add(self.remote_locked));
        let deposits = self.local_deposit.checked_add(self.remote_deposit);
        match (assets, deposits) {
            (Some(assets), Some(deposits)) => assets == deposits,
            _ => false,
        }
    }

    /// Moves `value` from the local spendable balance under the round lock.
    pub fn lock_local(&mut self, value: TokenAmount) -> Result<(), Error> {
        if self.local_balance < value {
            return Err(self.conservation_violation());
        }
        self.local_balance -= value;
        self.local_locked += value;
        Ok(())
    }

    /// Moves `value` from the remote spendable balance under the round lock.
    pub fn lock_remote(&mut self, value: TokenAmount) -> Result<(), Error> {
        if self.remote_balance < value {
            return Err(self.conservation_violation());
        }
        self.remote_balance -= value;
        self.remote_locked += value;
        Ok(())
    }

    /// Releases the local lock, paying `delta` of it (plus unlocked funds if
    /// the outcome exceeds the lock) over to the remote side.
    pub fn settle_local_lock(&mut self, delta: TokenAmount) -> Result<(), Error> {
        let lock = self.local_locked;
        self.local_locked = TokenAmount::zero();
        self.local_balance += lock;
        if self.local_balance < delta {
            return Err(self.conservation_violation());
        }
        self.local_balance -= delta;
        self.remote_balance += delta;
        Ok(())
    }

    /// Releases the remote lock, paying `delta` over to the local side.
    pub fn settle_remote_lock(&mut self, delta: TokenAmount) -> Result<(), Error> {
        let lock = self.remote_locked;
        self.remote_locked = TokenAmount::zero();
        self.remote_balance += lock;
        if self.remote_balance < delta {
            return Err(self.conservation_violation());
        }
        self.remote_balance -= delta;
        self.local_balance += delta;
        Ok(())
    }

    /// Accepts an incoming balance-bearing nonce. Nonces must strictly
    /// increase per emitter; anything else is a replay and is dropped.
    pub fn accept_remote_nonce(
        &mut self,
        nonce: Nonce,
        kind: &'static str,
    ) -> Result<(), Error> {
        if nonce <= self.remote_nonce {
            return Err(Error::StaleNonce {
                channel_id: self.channel_id,
                kind,
                nonce,
                last_accepted: self.remote_nonce,
            });
        }
        self.remote_nonce = nonce;
        Ok(())
    }

    /// The nonce the next locally issued balance-bearing message must carry.
    pub fn next_local_nonce(&self) -> Nonce { self.local_nonce + 1 }

    /// Participants with their close-time proofs in ascending address order,
    /// as the on-chain settle ABI requires.
    pub fn ordered_snapshot(
        &self,
    ) -> Option<((Address, &BalanceProof), (Address, &BalanceProof))> {
        let snapshots = self.close_snapshots.as_ref()?;
        if self.local.as_bytes() < self.remote.as_bytes() {
            Some((
                (self.local, &snapshots.local),
                (self.remote, &snapshots.remote),
            ))
        } else {
            Some((
                (self.remote, &snapshots.remote),
                (self.local, &snapshots.local),
            ))
        }
    }

    /// Participants with their current spendable-plus-locked balances in
    /// ascending address order.
    pub fn ordered_balances(
        &self,
    ) -> ((Address, TokenAmount), (Address, TokenAmount)) {
        let local_total = self.local_balance + self.local_locked;
        let remote_total = self.remote_balance + self.remote_locked;
        if self.local.as_bytes() < self.remote.as_bytes() {
            ((self.local, local_total), (self.remote, remote_total))
        } else {
            ((self.remote, remote_total), (self.local, local_total))
        }
    }

    fn conservation_violation(&self) -> Error {
        Error::BalanceConservationViolation {
            channel_id: self.channel_id,
            round: self.current_round,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn channel_for_tests() -> Channel {
        let mut channel = Channel::with(
            ChannelId::from(H256::repeat_byte(0x0c)),
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
            6,
        );
        channel.local_deposit = TokenAmount::from(1000u64);
        channel.remote_deposit = TokenAmount::from(1000u64);
        channel.local_balance = TokenAmount::from(1000u64);
        channel.remote_balance = TokenAmount::from(1000u64);
        channel
    }

    #[test]
    fn locks_preserve_conservation() {
        let mut channel = channel_for_tests();
        assert!(channel.conserves_deposits());
        channel.lock_local(TokenAmount::from(100u64)).unwrap();
        channel.lock_remote(TokenAmount::from(100u64)).unwrap();
        assert!(channel.conserves_deposits());
        assert_eq!(channel.locked_total(), TokenAmount::from(200u64));

        // initiator lost: local pays the stake out of its lock
        channel.settle_local_lock(TokenAmount::from(100u64)).unwrap();
        channel.settle_remote_lock(TokenAmount::zero()).unwrap();
        assert!(channel.conserves_deposits());
        assert_eq!(channel.local_balance, TokenAmount::from(900u64));
        assert_eq!(channel.remote_balance, TokenAmount::from(1100u64));
        assert_eq!(channel.locked_total(), TokenAmount::zero());
    }

    #[test]
    fn overdrawn_lock_is_rejected() {
        let mut channel = channel_for_tests();
        let result = channel.lock_local(TokenAmount::from(1001u64));
        assert!(matches!(
            result,
            Err(Error::BalanceConservationViolation { .. })
        ));
        // failed lock must not move funds
        assert_eq!(channel.local_balance, TokenAmount::from(1000u64));
        assert_eq!(channel.local_locked, TokenAmount::zero());
    }

    #[test]
    fn stale_nonce_is_rejected() {
        let mut channel = channel_for_tests();
        channel.accept_remote_nonce(1, "LockedTransfer").unwrap();
        channel.accept_remote_nonce(2, "DirectTransfer").unwrap();
        assert_eq!(
            channel.accept_remote_nonce(2, "DirectTransfer"),
            Err(Error::StaleNonce {
                channel_id: channel.channel_id,
                kind: "DirectTransfer",
                nonce: 2,
                last_accepted: 2,
            })
        );
    }

    #[test]
    fn participants_are_ordered_by_address() {
        let mut channel = channel_for_tests();
        // aa < bb: local first
        let ((first, _), (second, _)) = channel.ordered_balances();
        assert_eq!(first, channel.local);
        assert_eq!(second, channel.remote);

        std::mem::swap(&mut channel.local, &mut channel.remote);
        let ((first, _), (second, _)) = channel.ordered_balances();
        assert_eq!(first, channel.remote);
        assert_eq!(second, channel.local);
    }

    #[test]
    fn balance_proof_hash_matches_components() {
        let proof = BalanceProof {
            nonce: 1,
            transferred_amount: TokenAmount::from(250u64),
            locked_amount: TokenAmount::from(100u64),
            lock_id: dice2p::expand_seed(b"lock").hash(),
            signature: Signature::default(),
        };
        assert_eq!(
            proof.balance_hash(),
            hash_balance_data(
                proof.transferred_amount,
                proof.locked_amount,
                proof.lock_id
            )
        );
        assert_eq!(BalanceProof::default().balance_hash(), H256::zero());
    }
}
