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

//! Assembly of the four on-chain proofs: close, cooperative settle, settle
//! and initiator settle.
//!
//! The assembler works over a read-only view of the persisted records and
//! refuses to construct any proof which would contradict the channel
//! invariants; a refused proof is always an error, never a truncated tuple.

use dice2p::{
    ChannelId, Nonce, Secret, SecretHash, SignedMessage, Signature,
    TokenAmount,
};
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::bet::{Bet, BetStatus};
use crate::channel::{BalanceProof, Channel, ChannelStatus, Error};
use crate::store::StateStore;

/// Unilateral close: the latest accepted balance proof of the partner, in
/// the shape `close_channel` takes on-chain. Also submitted by the
/// non-closing side as its settle-window update.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CloseProof {
    pub channel_id: ChannelId,
    pub balance_hash: H256,
    pub nonce: Nonce,
    /// The partner's signature over its own balance proof.
    pub signature: Signature,
}

/// Final balance split co-signed by both participants; settles without a
/// dispute window.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CooperativeSettleProof {
    pub channel_id: ChannelId,
    pub participant1: Address,
    pub participant1_balance: TokenAmount,
    pub participant2: Address,
    pub participant2_balance: TokenAmount,
    pub participant1_signature: Signature,
    pub participant2_signature: Signature,
}

/// One side of the settle tuple.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SettleSide {
    pub participant: Address,
    pub transferred: TokenAmount,
    pub locked: TokenAmount,
    pub lock_id: SecretHash,
}

impl SettleSide {
    fn with(participant: Address, proof: &BalanceProof) -> SettleSide {
        SettleSide {
            participant,
            transferred: proof.transferred_amount,
            locked: proof.locked_amount,
            lock_id: proof.lock_id,
        }
    }
}

/// The post-window settle tuple, participants in ascending address order as
/// the settle ABI requires.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SettleProof {
    pub channel_id: ChannelId,
    pub participant1: SettleSide,
    pub participant2: SettleSide,
}

/// On-chain evidence resolving a disputed round: both commitments, both
/// signatures and both randoms, in the 11-argument shape `initiatorSettle`
/// takes.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InitiatorSettleProof {
    pub channel_id: ChannelId,
    pub round: u64,
    pub bet_mask: U256,
    pub modulo: u64,
    pub positive: Address,
    pub negative: Address,
    pub hash_ra: SecretHash,
    pub initiator_signature: Signature,
    pub rb: Secret,
    pub acceptor_signature: Signature,
    pub ra: Secret,
}

/// Read-only state view the assembler works over. Implemented by every
/// state store; a snapshot type can stand in for tests.
pub trait ProofContext {
    fn channel(&self, channel_id: ChannelId) -> Option<Channel>;
    fn bet(&self, channel_id: ChannelId, round: u64) -> Option<Bet>;
}

impl<S: StateStore + ?Sized> ProofContext for S {
    fn channel(&self, channel_id: ChannelId) -> Option<Channel> {
        self.get_channel(channel_id)
    }

    fn bet(&self, channel_id: ChannelId, round: u64) -> Option<Bet> {
        self.get_bet(channel_id, round)
    }
}

/// Builds on-chain proofs from persisted state.
pub struct ProofAssembler<'a, C: ProofContext + ?Sized> {
    context: &'a C,
}

impl<'a, C: ProofContext + ?Sized> ProofAssembler<'a, C> {
    pub fn new(context: &'a C) -> Self { ProofAssembler { context } }

    fn channel(&self, channel_id: ChannelId) -> Result<Channel, Error> {
        self.context
            .channel(channel_id)
            .ok_or(Error::UnknownChannel(channel_id))
    }

    /// Proof for a unilateral close: the latest accepted partner balance
    /// proof. A channel with no partner message yet closes with the empty
    /// proof (zero hash, nonce 0).
    pub fn close_proof(&self, channel_id: ChannelId) -> Result<CloseProof, Error> {
        let channel = self.channel(channel_id)?;
        if channel.status != ChannelStatus::Opened {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "close_channel",
            });
        }
        Ok(Self::proof_from(&channel, &channel.latest_remote_proof))
    }

    /// Settle-window update by the non-closing side: its latest partner
    /// proof, which must be newer than what the closer already put on
    /// chain.
    pub fn update_proof(&self, channel_id: ChannelId) -> Result<CloseProof, Error> {
        let channel = self.channel(channel_id)?;
        if channel.status != ChannelStatus::Closed {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "update_balance_proof",
            });
        }
        let proof = &channel.latest_remote_proof;
        if proof.nonce == 0 {
            return Err(Error::StaleNonce {
                channel_id,
                kind: "update_balance_proof",
                nonce: 0,
                last_accepted: 0,
            });
        }
        Ok(Self::proof_from(&channel, proof))
    }

    fn proof_from(channel: &Channel, proof: &BalanceProof) -> CloseProof {
        CloseProof {
            channel_id: channel.channel_id,
            balance_hash: proof.balance_hash(),
            nonce: proof.nonce,
            signature: proof.signature,
        }
    }

    /// The co-signed cooperative settlement. Requires both signatures to be
    /// on record, over identical terms, and re-verifies each against its
    /// participant before handing the tuple out.
    pub fn cooperative_settle_proof(
        &self,
        channel_id: ChannelId,
    ) -> Result<CooperativeSettleProof, Error> {
        let channel = self.channel(channel_id)?;
        let (local, remote) = match (&channel.coop_local, &channel.coop_remote)
        {
            (Some(local), Some(remote)) => (local, remote),
            _ => {
                return Err(Error::WrongChannelState {
                    channel_id,
                    current: channel.status,
                    operation: "cooperative_settle",
                })
            }
        };
        if local.digest() != remote.digest() {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: channel.current_round,
                kind: "CooperativeSettleResponse",
                reason: "settlement terms differ between the two signatures",
            });
        }
        for (message, signer) in
            [(local, channel.local), (remote, channel.remote)]
        {
            message.verify(signer).map_err(|details| {
                Error::InvalidSignature {
                    channel_id,
                    kind: "CooperativeSettle",
                    details,
                }
            })?;
        }
        let (p1_signature, p2_signature) =
            if local.participant1 == channel.local {
                (local.signature, remote.signature)
            } else {
                (remote.signature, local.signature)
            };
        Ok(CooperativeSettleProof {
            channel_id,
            participant1: local.participant1,
            participant1_balance: local.participant1_balance,
            participant2: local.participant2,
            participant2_balance: local.participant2_balance,
            participant1_signature: p1_signature,
            participant2_signature: p2_signature,
        })
    }

    /// The settle tuple from the close-time snapshots, once the channel is
    /// closed. Totals are summed with overflow checks; an overflowing tuple
    /// is reported, never truncated.
    pub fn settle_proof(&self, channel_id: ChannelId) -> Result<SettleProof, Error> {
        let channel = self.channel(channel_id)?;
        if !matches!(
            channel.status,
            ChannelStatus::Closed | ChannelStatus::UpdateBalanceProof
        ) {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "settle_channel",
            });
        }
        let ((p1, p1_proof), (p2, p2_proof)) =
            channel.ordered_snapshot().ok_or(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "settle_channel",
            })?;
        p1_proof
            .transferred_amount
            .checked_add(p1_proof.locked_amount)
            .and_then(|sum| sum.checked_add(p2_proof.transferred_amount))
            .and_then(|sum| sum.checked_add(p2_proof.locked_amount))
            .ok_or(Error::BalanceConservationViolation {
                channel_id,
                round: channel.current_round,
            })?;
        Ok(SettleProof {
            channel_id,
            participant1: SettleSide::with(p1, p1_proof),
            participant2: SettleSide::with(p2, p2_proof),
        })
    }

    /// Dispute evidence for a frozen round. Requires the round to have
    /// reached `Start` and both randoms plus both commitment signatures to
    /// be locally known.
    pub fn initiator_settle_proof(
        &self,
        channel_id: ChannelId,
        round: u64,
    ) -> Result<InitiatorSettleProof, Error> {
        let bet = self
            .context
            .bet(channel_id, round)
            .ok_or(Error::UnknownBet { channel_id, round })?;
        if bet.status < BetStatus::Start {
            return Err(Error::WrongBetState {
                channel_id,
                round,
                current: bet.status,
                operation: "initiator_settle",
            });
        }
        let incomplete = |current| Error::WrongBetState {
            channel_id,
            round,
            current,
            operation: "initiator_settle",
        };
        let ra = bet.ra.ok_or(incomplete(bet.status))?;
        let rb = bet.rb.ok_or(incomplete(bet.status))?;
        if bet.acceptor_signature.is_zero() {
            return Err(incomplete(bet.status));
        }
        Ok(InitiatorSettleProof {
            channel_id,
            round,
            bet_mask: bet.bet_mask,
            modulo: bet.modulo,
            positive: bet.initiator,
            negative: bet.acceptor,
            hash_ra: bet.hash_ra,
            initiator_signature: bet.initiator_signature,
            rb,
            acceptor_signature: bet.acceptor_signature,
            ra,
        })
    }
}

#[cfg(test)]
mod test {
    use dice2p::{expand_seed, CooperativeSettle, Signer};
    use ethereum_types::H256;
    use secp256k1::SecretKey;

    use super::*;
    use crate::store::MemoryStore;

    fn signer(byte: u8) -> Signer {
        Signer::new(SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    fn channel_id() -> ChannelId { ChannelId::from(H256::repeat_byte(0x0c)) }

    fn funded_channel(local: Address, remote: Address) -> Channel {
        let mut channel = Channel::with(channel_id(), local, remote, 6);
        channel.local_deposit = TokenAmount::from(1000u64);
        channel.remote_deposit = TokenAmount::from(1000u64);
        channel.local_balance = TokenAmount::from(1000u64);
        channel.remote_balance = TokenAmount::from(1000u64);
        channel
    }

    #[test]
    fn close_proof_reflects_latest_remote_proof() {
        let mut store = MemoryStore::new();
        let mut channel = funded_channel(
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
        );
        channel.latest_remote_proof = BalanceProof {
            nonce: 5,
            transferred_amount: TokenAmount::from(250u64),
            locked_amount: TokenAmount::from(100u64),
            lock_id: expand_seed(b"lock").hash(),
            signature: Signature::from_parts([0x33; 64], 28),
        };
        store.put_channel(channel.clone());

        let assembler = ProofAssembler::new(&store);
        let proof = assembler.close_proof(channel_id()).unwrap();
        assert_eq!(proof.nonce, 5);
        assert_eq!(
            proof.balance_hash,
            channel.latest_remote_proof.balance_hash()
        );
        assert_eq!(proof.signature, channel.latest_remote_proof.signature);
    }

    #[test]
    fn close_proof_refused_after_close() {
        let mut store = MemoryStore::new();
        let mut channel = funded_channel(
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
        );
        channel.status = ChannelStatus::Closed;
        store.put_channel(channel);
        let assembler = ProofAssembler::new(&store);
        assert!(matches!(
            assembler.close_proof(channel_id()),
            Err(Error::WrongChannelState { .. })
        ));
    }

    #[test]
    fn update_proof_requires_a_partner_message() {
        let mut store = MemoryStore::new();
        let mut channel = funded_channel(
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
        );
        channel.status = ChannelStatus::Closed;
        store.put_channel(channel);
        let assembler = ProofAssembler::new(&store);
        assert!(matches!(
            assembler.update_proof(channel_id()),
            Err(Error::StaleNonce { .. })
        ));
    }

    #[test]
    fn settle_proof_orders_participants_by_address() {
        let mut store = MemoryStore::new();
        // local has the higher address: it must land in the second slot
        let mut channel = funded_channel(
            Address::repeat_byte(0xbb),
            Address::repeat_byte(0xaa),
        );
        channel.status = ChannelStatus::Closed;
        channel.close_snapshots = Some(crate::channel::CloseSnapshots {
            local: BalanceProof {
                nonce: 2,
                transferred_amount: TokenAmount::from(100u64),
                ..BalanceProof::default()
            },
            remote: BalanceProof {
                nonce: 3,
                transferred_amount: TokenAmount::from(200u64),
                ..BalanceProof::default()
            },
        });
        store.put_channel(channel);

        let assembler = ProofAssembler::new(&store);
        let proof = assembler.settle_proof(channel_id()).unwrap();
        assert_eq!(proof.participant1.participant, Address::repeat_byte(0xaa));
        assert_eq!(proof.participant1.transferred, TokenAmount::from(200u64));
        assert_eq!(proof.participant2.participant, Address::repeat_byte(0xbb));
        assert_eq!(proof.participant2.transferred, TokenAmount::from(100u64));
    }

    #[test]
    fn settle_proof_reports_overflowing_totals() {
        let mut store = MemoryStore::new();
        let mut channel = funded_channel(
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
        );
        channel.status = ChannelStatus::Closed;
        channel.close_snapshots = Some(crate::channel::CloseSnapshots {
            local: BalanceProof {
                nonce: 2,
                transferred_amount: U256::MAX,
                ..BalanceProof::default()
            },
            remote: BalanceProof {
                nonce: 3,
                transferred_amount: U256::one(),
                ..BalanceProof::default()
            },
        });
        store.put_channel(channel);
        let assembler = ProofAssembler::new(&store);
        assert!(matches!(
            assembler.settle_proof(channel_id()),
            Err(Error::BalanceConservationViolation { .. })
        ));
    }

    #[test]
    fn cooperative_proof_needs_matching_cosigned_terms() {
        let local_signer = signer(0x01);
        let remote_signer = signer(0x02);
        let (p1, p2) = if local_signer.address().as_bytes()
            < remote_signer.address().as_bytes()
        {
            (local_signer.address(), remote_signer.address())
        } else {
            (remote_signer.address(), local_signer.address())
        };
        let mut terms = CooperativeSettle {
            channel_id: channel_id(),
            participant1: p1,
            participant1_balance: TokenAmount::from(900u64),
            participant2: p2,
            participant2_balance: TokenAmount::from(1100u64),
            signature: Signature::default(),
        };

        let mut store = MemoryStore::new();
        let mut channel =
            funded_channel(local_signer.address(), remote_signer.address());
        terms.sign(&local_signer);
        channel.coop_local = Some(terms.clone());
        terms.sign(&remote_signer);
        channel.coop_remote = Some(terms);
        store.put_channel(channel);

        let assembler = ProofAssembler::new(&store);
        let proof = assembler.cooperative_settle_proof(channel_id()).unwrap();
        assert_eq!(proof.participant1, p1);
        assert_eq!(proof.participant1_balance, TokenAmount::from(900u64));
        // both signatures verify against their participants
        assert_ne!(proof.participant1_signature, proof.participant2_signature);
    }

    #[test]
    fn cooperative_proof_refused_on_diverging_terms() {
        let local_signer = signer(0x01);
        let remote_signer = signer(0x02);
        let mut terms = CooperativeSettle {
            channel_id: channel_id(),
            participant1: local_signer.address(),
            participant1_balance: TokenAmount::from(900u64),
            participant2: remote_signer.address(),
            participant2_balance: TokenAmount::from(1100u64),
            signature: Signature::default(),
        };
        let mut store = MemoryStore::new();
        let mut channel =
            funded_channel(local_signer.address(), remote_signer.address());
        terms.sign(&local_signer);
        channel.coop_local = Some(terms.clone());
        terms.participant1_balance = TokenAmount::from(901u64);
        terms.sign(&remote_signer);
        channel.coop_remote = Some(terms);
        store.put_channel(channel);

        let assembler = ProofAssembler::new(&store);
        assert!(matches!(
            assembler.cooperative_settle_proof(channel_id()),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn initiator_settle_needs_both_randoms() {
        let mut store = MemoryStore::new();
        let ra = expand_seed(b"seedA");
        let mut bet = crate::bet::Bet {
            channel_id: channel_id(),
            round: 1,
            bet_mask: U256::from(0x3fu64),
            modulo: 6,
            value: TokenAmount::from(100u64),
            win_amount: TokenAmount::from(100u64),
            initiator: Address::repeat_byte(0xaa),
            acceptor: Address::repeat_byte(0xbb),
            ra: Some(ra),
            hash_ra: ra.hash(),
            rb: None,
            initiator_signature: Signature::from_parts([0x11; 64], 27),
            acceptor_signature: Signature::from_parts([0x22; 64], 28),
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status: BetStatus::LockedTransferRSent,
            deadline_block: None,
            frozen: true,
        };
        store.put_bet(bet.clone());

        let assembler = ProofAssembler::new(&store);
        assert!(matches!(
            assembler.initiator_settle_proof(channel_id(), 1),
            Err(Error::WrongBetState { .. })
        ));

        bet.rb = Some(expand_seed(b"seedB"));
        bet.status = BetStatus::BetResponseReceived;
        store.put_bet(bet.clone());
        let assembler = ProofAssembler::new(&store);
        let proof =
            assembler.initiator_settle_proof(channel_id(), 1).unwrap();
        assert_eq!(proof.ra, ra);
        assert_eq!(proof.rb, expand_seed(b"seedB"));
        assert_eq!(proof.positive, bet.initiator);
        assert_eq!(proof.modulo, 6);
    }

    #[test]
    fn initiator_settle_unknown_round_is_reported() {
        let store = MemoryStore::new();
        let assembler = ProofAssembler::new(&store);
        assert_eq!(
            assembler.initiator_settle_proof(channel_id(), 9),
            Err(Error::UnknownBet {
                channel_id: channel_id(),
                round: 9,
            })
        );
    }
}
