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

use ethereum_types::Address;
use serde::{Deserialize, Serialize};

use super::SignedMessage;
use crate::crypto::Packer;
use crate::types::{ChannelId, Signature, TokenAmount};

/// Cooperative settlement terms: the final balance split both participants
/// sign so the channel can settle on-chain without a dispute window.
///
/// The same record is used as request (first signature) and response
/// (counter-signature); the wire tag distinguishes the two. Participants are
/// listed in ascending address order, matching the settle ABI.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("cooperative_settle({channel_id}, {participant1}: \
           {participant1_balance}, {participant2}: {participant2_balance})")]
pub struct CooperativeSettle {
    /// The channel being settled.
    pub channel_id: ChannelId,

    /// Lower-addressed participant.
    pub participant1: Address,

    /// Final balance paid out to `participant1`.
    pub participant1_balance: TokenAmount,

    /// Higher-addressed participant.
    pub participant2: Address,

    /// Final balance paid out to `participant2`.
    pub participant2_balance: TokenAmount,

    /// Signature of the emitting side over the settlement tuple.
    pub signature: Signature,
}

impl SignedMessage for CooperativeSettle {
    fn pack(&self) -> Vec<u8> {
        Packer::new()
            .channel(self.channel_id)
            .address(self.participant1)
            .uint256(self.participant1_balance)
            .address(self.participant2)
            .uint256(self.participant2_balance)
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
    use ethereum_types::{H256, U256};

    use super::*;

    #[test]
    fn settle_packing_order_is_pinned() {
        let settle = CooperativeSettle {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            participant1: Address::repeat_byte(0xaa),
            participant1_balance: U256::from(900u64),
            participant2: Address::repeat_byte(0xbb),
            participant2_balance: U256::from(1100u64),
            signature: Signature::default(),
        };
        let mut expected = String::new();
        expected.push_str(&"0c".repeat(32));
        expected.push_str(&"aa".repeat(20));
        expected.push_str(&"00".repeat(30));
        expected.push_str("0384"); // 900
        expected.push_str(&"bb".repeat(20));
        expected.push_str(&"00".repeat(30));
        expected.push_str("044c"); // 1100
        assert_eq!(settle.pack().to_hex(), expected);
    }

    #[test]
    fn both_signatures_cover_the_same_digest() {
        let template = CooperativeSettle {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            participant1: Address::repeat_byte(0xaa),
            participant1_balance: U256::from(900u64),
            participant2: Address::repeat_byte(0xbb),
            participant2_balance: U256::from(1100u64),
            signature: Signature::default(),
        };
        let mut response = template.clone();
        response.signature = Signature::from_parts([0x55; 64], 28);
        // the signature field itself is outside the signed tuple
        assert_eq!(template.digest(), response.digest());
    }
}
