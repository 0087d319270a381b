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

use dice2p::crypto::Packer;
use dice2p::{
    ChannelId, LockedTransfer, Secret, SecretHash, Signature, TokenAmount,
};
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::channel::Error;

/// Largest supported die: outcomes are `0..modulo-1`.
pub const MAX_MODULO: u64 = 100;

/// Identifier of a bet round across channels:
/// `keccak256(channel_id ‖ round)`.
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From,
    Serialize,
    Deserialize,
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex)]
#[serde(transparent)]
pub struct BetId(H256);

impl BetId {
    pub fn with(channel_id: ChannelId, round: u64) -> BetId {
        BetId(Packer::new().channel(channel_id).uint(round).hash())
    }
}

/// Progress of one bet round. Both sides walk the same ladder; the state
/// names the last protocol step that has been fully exchanged.
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
pub enum BetStatus {
    /// Initiator persisted the round before emitting its request.
    #[display("INIT")]
    Init,

    /// `BetRequest` emitted or accepted.
    #[display("START")]
    Start,

    /// The acceptor's locked transfer is exchanged.
    #[display("LOCKED-TRANSFER-SENT")]
    LockedTransferSent,

    /// The initiator's locked transfer is exchanged.
    #[display("LOCKED-TRANSFER-R-SENT")]
    LockedTransferRSent,

    /// `BetResponse` exchanged; the initiator can determine the winner.
    #[display("BET-RESPONSE-RECEIVED")]
    BetResponseReceived,

    /// The initiator's preimage is revealed.
    #[display("PREIMAGE-SENT")]
    PreimageSent,

    /// The initiator's closing direct transfer is exchanged.
    #[display("DIRECT-TRANSFER-SENT")]
    DirectTransferSent,

    /// Balances committed; the round is complete.
    #[display("FINISH")]
    Finish,
}

/// One wagering round within a channel. `(channel_id, round)` is the
/// primary key.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Bet {
    pub channel_id: ChannelId,

    pub round: u64,

    /// Bitmask over dice outcomes the initiator bets on.
    pub bet_mask: U256,

    /// Number of equally likely outcomes.
    pub modulo: u64,

    /// Stake of the round.
    pub value: TokenAmount,

    /// Payout to the initiator if the outcome hits the mask:
    /// `value × modulo / popcount(bet_mask)`.
    pub win_amount: TokenAmount,

    /// The positive party, betting on the mask.
    pub initiator: Address,

    /// The negative party, betting against it.
    pub acceptor: Address,

    /// The initiator's preimage. Known to the initiator from the start and
    /// to the acceptor only once revealed.
    pub ra: Option<Secret>,

    /// Commitment to `ra`; also the round's lock id.
    pub hash_ra: SecretHash,

    /// The acceptor's random, revealed in its `BetResponse`.
    pub rb: Option<Secret>,

    /// Initiator's commitment signature from the `BetRequest`.
    pub initiator_signature: Signature,

    /// Acceptor's commitment signature from the `BetResponse`.
    pub acceptor_signature: Signature,

    /// The locally issued locked transfer of this round.
    pub locked_transfer_local: Option<LockedTransfer>,

    /// The partner's locked transfer of this round.
    pub locked_transfer_remote: Option<LockedTransfer>,

    pub status: BetStatus,

    /// Block by which the next peer message must arrive, when one is
    /// awaited.
    pub deadline_block: Option<u64>,

    /// Set when the round was halted by a validation failure or timeout.
    /// A frozen round only resolves on-chain.
    pub frozen: bool,
}

impl Bet {
    pub fn bet_id(&self) -> BetId { BetId::with(self.channel_id, self.round) }

    /// Whether the round still occupies the channel: at most one bet below
    /// `Finish` may exist per channel.
    pub fn is_open(&self) -> bool { self.status < BetStatus::Finish }

    /// The round outcome, computable once both randoms are known.
    pub fn outcome(&self) -> Option<u64> {
        Some(outcome(self.ra?, self.rb?, self.modulo))
    }

    /// Whether the initiator won, computable once both randoms are known.
    pub fn initiator_wins(&self) -> Option<bool> {
        self.outcome().map(|s| self.bet_mask.bit(s as usize))
    }
}

/// The mixed dice outcome: `keccak256(Ra ‖ Rb) mod modulo`, reduced in
/// 256-bit arithmetic exactly as `uint256(keccak256(...)) % modulo` reduces
/// on-chain.
pub fn outcome(ra: Secret, rb: Secret, modulo: u64) -> u64 {
    let mixed = Packer::new().secret(ra).secret(rb).hash();
    let seed = U256::from_big_endian(mixed.as_bytes());
    (seed % U256::from(modulo)).as_u64()
}

/// Number of outcome bits set in the mask.
pub fn mask_popcount(mask: U256) -> u32 {
    mask.0.iter().map(|limb| limb.count_ones()).sum()
}

/// Validates game parameters and computes the initiator payout with the
/// same integer arithmetic the game contract uses:
/// `value × modulo / popcount(mask)`, multiplication before division.
pub fn win_amount(
    channel_id: ChannelId,
    round: u64,
    bet_mask: U256,
    modulo: u64,
    value: TokenAmount,
) -> Result<TokenAmount, Error> {
    let violation = |reason| Error::ProtocolViolation {
        channel_id,
        round,
        kind: "BetRequest",
        reason,
    };
    if modulo == 0 || modulo > MAX_MODULO {
        return Err(violation("modulo out of range"));
    }
    if bet_mask.is_zero() {
        return Err(violation("empty bet mask"));
    }
    if bet_mask.bits() as u64 > modulo {
        return Err(violation("bet mask covers impossible outcomes"));
    }
    let ones = mask_popcount(bet_mask);
    let product = value
        .checked_mul(U256::from(modulo))
        .ok_or(Error::BalanceConservationViolation { channel_id, round })?;
    Ok(product / U256::from(ones))
}

#[cfg(test)]
mod test {
    use dice2p::expand_seed;

    use super::*;

    #[test]
    fn popcount_counts_across_limbs() {
        assert_eq!(mask_popcount(U256::from(0x3fu64)), 6);
        assert_eq!(mask_popcount(U256::one() << 99), 1);
        assert_eq!(mask_popcount((U256::one() << 99) | U256::one()), 2);
    }

    #[test]
    fn full_mask_pays_back_the_stake() {
        let win = win_amount(
            ChannelId::default(),
            1,
            U256::from(0x3fu64),
            6,
            TokenAmount::from(100u64),
        )
        .unwrap();
        assert_eq!(win, TokenAmount::from(100u64));
    }

    #[test]
    fn single_outcome_pays_modulo_times() {
        let win = win_amount(
            ChannelId::default(),
            1,
            U256::one(),
            6,
            TokenAmount::from(100u64),
        )
        .unwrap();
        assert_eq!(win, TokenAmount::from(600u64));
    }

    #[test]
    fn oversized_mask_is_rejected() {
        let result = win_amount(
            ChannelId::default(),
            1,
            U256::from(0x7fu64), // seven bits on a six-sided die
            6,
            TokenAmount::from(100u64),
        );
        assert!(matches!(result, Err(Error::ProtocolViolation { .. })));
    }

    #[test]
    fn degenerate_parameters_are_rejected() {
        let id = ChannelId::default();
        let value = TokenAmount::from(100u64);
        assert!(win_amount(id, 1, U256::zero(), 6, value).is_err());
        assert!(win_amount(id, 1, U256::one(), 0, value).is_err());
        assert!(win_amount(id, 1, U256::one(), MAX_MODULO + 1, value).is_err());
    }

    #[test]
    fn outcome_is_deterministic_and_bounded() {
        let ra = expand_seed(b"seedA");
        let rb = expand_seed(b"seedB");
        let s = outcome(ra, rb, 6);
        assert!(s < 6);
        assert_eq!(s, outcome(ra, rb, 6));
        // full 6-bit mask always hits
        assert!(U256::from(0x3fu64).bit(s as usize));
    }

    #[test]
    fn full_mask_round_declares_initiator_winner() {
        let ra = expand_seed(b"seedA");
        let mut bet = bet_for_tests();
        bet.ra = Some(ra);
        assert_eq!(bet.initiator_wins(), None); // rb still unknown
        bet.rb = Some(expand_seed(b"seedB"));
        assert_eq!(bet.initiator_wins(), Some(true));
    }

    fn bet_for_tests() -> Bet {
        Bet {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            round: 1,
            bet_mask: U256::from(0x3fu64),
            modulo: 6,
            value: TokenAmount::from(100u64),
            win_amount: TokenAmount::from(100u64),
            initiator: Address::repeat_byte(0xaa),
            acceptor: Address::repeat_byte(0xbb),
            ra: None,
            hash_ra: expand_seed(b"seedA").hash(),
            rb: None,
            initiator_signature: Signature::default(),
            acceptor_signature: Signature::default(),
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status: BetStatus::Start,
            deadline_block: None,
            frozen: false,
        }
    }
}
