// Dice channel P2P library: signed protocol messages and commitment
// primitives for the two-party wagering state channel
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use ethereum_types::{Address, U256};
use serde::{Deserialize, Serialize};

use super::SignedMessage;
use crate::crypto::Packer;
use crate::types::{ChannelId, Secret, SecretHash, Signature, TokenAmount};

/// Opens a bet round.
///
/// The initiator (positive party) commits to the game parameters and to the
/// hash of its random preimage. The commitment signature is what the game
/// contract later verifies during a disputed settlement, so its packing must
/// match the contract's `abi.encodePacked` order exactly.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("bet_request({channel_id}, round {round}, mask {bet_mask}, \
           modulo {modulo}, value {value})")]
pub struct BetRequest {
    /// The channel the round is played in.
    pub channel_id: ChannelId,

    /// Round number; starts at 1 and increases by one per bet.
    pub round: u64,

    /// The game contract whose rules resolve this round on-chain if
    /// disputed.
    pub game_contract: Address,

    /// Bitmask over dice outcomes `0..modulo-1`; the initiator wins iff the
    /// outcome bit is set.
    pub bet_mask: U256,

    /// Number of equally likely dice outcomes.
    pub modulo: u64,

    /// The initiator, betting that the outcome hits the mask.
    pub positive: Address,

    /// The acceptor, betting against the mask.
    pub negative: Address,

    /// Keccak-256 commitment to the initiator's preimage `Ra`.
    pub hash_ra: SecretHash,

    /// Stake of the round. Not part of the commitment tuple: the stake is
    /// committed one message later by both locked transfers, whose balance
    /// deltas must equal it.
    pub value: TokenAmount,

    /// Initiator's signature over the commitment tuple.
    pub signature: Signature,
}

impl SignedMessage for BetRequest {
    fn pack(&self) -> Vec<u8> {
        Packer::new()
            .channel(self.channel_id)
            .uint(self.round)
            .address(self.game_contract)
            .uint256(self.bet_mask)
            .uint(self.modulo)
            .address(self.positive)
            .address(self.negative)
            .lock(self.hash_ra)
            .finish()
    }

    fn signature(&self) -> &Signature { &self.signature }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

/// Accepts a bet round.
///
/// The acceptor reveals its own random `Rb` immediately: it learns nothing
/// from it (the outcome also needs the still-hidden `Ra`), while the echoed
/// initiator signature binds both commitments together for the dispute path.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("bet_response({channel_id}, round {round}, rb {rb})")]
pub struct BetResponse {
    /// The channel the round is played in.
    pub channel_id: ChannelId,

    /// Round number being accepted.
    pub round: u64,

    /// The game contract named in the matching request.
    pub game_contract: Address,

    /// The initiator's preimage commitment, echoed from the request.
    pub hash_ra: SecretHash,

    /// The acceptor's random, revealed in clear.
    pub rb: Secret,

    /// The initiator's commitment signature, echoed from the request.
    pub initiator_signature: Signature,

    /// Acceptor's signature over the response tuple.
    pub signature: Signature,
}

impl SignedMessage for BetResponse {
    fn pack(&self) -> Vec<u8> {
        Packer::new()
            .channel(self.channel_id)
            .uint(self.round)
            .address(self.game_contract)
            .lock(self.hash_ra)
            .secret(self.rb)
            .signature(&self.initiator_signature)
            .finish()
    }

    fn signature(&self) -> &Signature { &self.signature }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

/// Reveals the initiator's preimage `Ra`, resolving the round off-chain.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("preimage({channel_id}, round {round})")]
pub struct Preimage {
    /// The channel the round is played in.
    pub channel_id: ChannelId,

    /// Round number being resolved.
    pub round: u64,

    /// The preimage matching the `hash_ra` commitment of the round.
    pub ra: Secret,

    /// Initiator's signature over the reveal tuple.
    pub signature: Signature,
}

impl SignedMessage for Preimage {
    fn pack(&self) -> Vec<u8> {
        Packer::new()
            .channel(self.channel_id)
            .uint(self.round)
            .secret(self.ra)
            .finish()
    }

    fn signature(&self) -> &Signature { &self.signature }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

#[cfg(test)]
mod test {
    use amplify::hex::ToHex;
    use ethereum_types::H256;

    use super::*;
    use crate::crypto::expand_seed;

    fn bet_request_for_tests() -> BetRequest {
        BetRequest {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            round: 1,
            game_contract: Address::repeat_byte(0x99),
            bet_mask: U256::from(0x3fu64),
            modulo: 6,
            positive: Address::repeat_byte(0xaa),
            negative: Address::repeat_byte(0xbb),
            hash_ra: expand_seed(b"seedA").hash(),
            value: U256::from(100u64),
            signature: Signature::default(),
        }
    }

    #[test]
    fn bet_request_packing_order_is_pinned() {
        let request = bet_request_for_tests();
        let packed = request.pack().to_hex();

        let mut expected = String::new();
        expected.push_str(&"0c".repeat(32)); // channel_id
        expected.push_str(&"00".repeat(31)); // round as uint256
        expected.push_str("01");
        expected.push_str(&"99".repeat(20)); // game contract
        expected.push_str(&"00".repeat(31)); // bet mask
        expected.push_str("3f");
        expected.push_str(&"00".repeat(31)); // modulo
        expected.push_str("06");
        expected.push_str(&"aa".repeat(20)); // positive
        expected.push_str(&"bb".repeat(20)); // negative
        expected.push_str(&expand_seed(b"seedA").hash().to_string()); // hashRa

        assert_eq!(packed, expected);
    }

    #[test]
    fn stake_is_outside_the_commitment() {
        let mut request = bet_request_for_tests();
        let before = request.digest();
        request.value = U256::from(500u64);
        assert_eq!(request.digest(), before);
    }

    #[test]
    fn bet_response_commits_to_initiator_signature() {
        let request = bet_request_for_tests();
        let mut response = BetResponse {
            channel_id: request.channel_id,
            round: request.round,
            game_contract: request.game_contract,
            hash_ra: request.hash_ra,
            rb: expand_seed(b"seedB"),
            initiator_signature: Signature::from_parts([0x11; 64], 27),
            signature: Signature::default(),
        };
        let before = response.digest();
        response.initiator_signature = Signature::from_parts([0x22; 64], 27);
        assert_ne!(response.digest(), before);
    }

    #[test]
    fn preimage_packing_is_channel_round_secret() {
        let ra = expand_seed(b"seedA");
        let preimage = Preimage {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            round: 2,
            ra,
            signature: Signature::default(),
        };
        let mut expected = String::new();
        expected.push_str(&"0c".repeat(32));
        expected.push_str(&"00".repeat(31));
        expected.push_str("02");
        expected.push_str(&ra.to_string());
        assert_eq!(preimage.pack().to_hex(), expected);
    }
}
