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

use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};

use super::SignedMessage;
use crate::crypto::Packer;
use crate::types::{ChannelId, Nonce, SecretHash, Signature, TokenAmount};

/// `keccak256(transferred_amount ‖ locked_amount ‖ lock_id)` — the on-chain
/// summary of one side's latest balance state.
///
/// A side which never moved or locked anything has the null balance hash;
/// the payment contract uses the zero word, not the hash of zeros, for that
/// case.
pub fn hash_balance_data(
    transferred: TokenAmount,
    locked: TokenAmount,
    lock_id: SecretHash,
) -> H256 {
    if transferred.is_zero() && locked.is_zero() {
        return H256::zero();
    }
    Packer::new()
        .uint256(transferred)
        .uint256(locked)
        .lock(lock_id)
        .hash()
}

/// Moves the wager stake from the sender's unlocked balance under the
/// round's lock.
///
/// This is a balance-bearing message: it consumes one nonce and its
/// signature doubles as a balance proof the counterparty can take on-chain.
/// The signed digest commits to the balance hash, not the flat fields, so
/// the payment contract can verify it from `(balance_hash, nonce)` alone
/// during close.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("locked_transfer({channel_id}, nonce {nonce}, \
           transferred {transferred_amount}, locked {locked_amount})")]
pub struct LockedTransfer {
    /// The channel the transfer belongs to.
    pub channel_id: ChannelId,

    /// The payment contract governing the channel; binds the proof to one
    /// deployment.
    pub payment_contract: Address,

    /// Sender's balance-proof counter; must exceed every nonce the sender
    /// issued before on this channel.
    pub nonce: Nonce,

    /// Cumulative amount the sender has transferred to the receiver over the
    /// channel lifetime. Unchanged by a lock.
    pub transferred_amount: TokenAmount,

    /// Amount reserved under the round's lock; equals the wager stake.
    pub locked_amount: TokenAmount,

    /// The round's lock id: the initiator's preimage commitment.
    pub lock_id: SecretHash,

    /// Sender's signature over `(channel, contract, nonce, balance_hash)`.
    pub signature: Signature,
}

impl LockedTransfer {
    /// The balance hash this transfer commits to.
    pub fn balance_hash(&self) -> H256 {
        hash_balance_data(
            self.transferred_amount,
            self.locked_amount,
            self.lock_id,
        )
    }
}

impl SignedMessage for LockedTransfer {
    fn pack(&self) -> Vec<u8> {
        Packer::new()
            .channel(self.channel_id)
            .address(self.payment_contract)
            .uint(self.nonce)
            .h256(self.balance_hash())
            .finish()
    }

    fn signature(&self) -> &Signature { &self.signature }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

/// Unconditional balance update: converts a resolved round's lock into a
/// final transferred amount (or releases it unchanged when the sender won).
///
/// Balance-bearing, like [`LockedTransfer`]; carries no lock, so its balance
/// hash is computed over a zero locked amount and the null lock id.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("direct_transfer({channel_id}, nonce {nonce}, \
           transferred {transferred_amount})")]
pub struct DirectTransfer {
    /// The channel the transfer belongs to.
    pub channel_id: ChannelId,

    /// The payment contract governing the channel.
    pub payment_contract: Address,

    /// Sender's balance-proof counter.
    pub nonce: Nonce,

    /// New cumulative transferred amount after settling the round outcome.
    pub transferred_amount: TokenAmount,

    /// Sender's signature over `(channel, contract, nonce, balance_hash)`.
    pub signature: Signature,
}

impl DirectTransfer {
    /// The balance hash this transfer commits to.
    pub fn balance_hash(&self) -> H256 {
        hash_balance_data(
            self.transferred_amount,
            TokenAmount::zero(),
            SecretHash::none(),
        )
    }
}

impl SignedMessage for DirectTransfer {
    fn pack(&self) -> Vec<u8> {
        Packer::new()
            .channel(self.channel_id)
            .address(self.payment_contract)
            .uint(self.nonce)
            .h256(self.balance_hash())
            .finish()
    }

    fn signature(&self) -> &Signature { &self.signature }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

#[cfg(test)]
mod test {
    use amplify::hex::{FromHex, ToHex};
    use ethereum_types::U256;

    use super::*;
    use crate::crypto::expand_seed;

    #[test]
    fn null_balance_hashes_to_zero_word() {
        assert_eq!(
            hash_balance_data(
                U256::zero(),
                U256::zero(),
                expand_seed(b"lock").hash()
            ),
            H256::zero()
        );
    }

    #[test]
    fn balance_hash_packing_is_pinned() {
        let lock_id = expand_seed(b"lock").hash();
        let mut packed = String::new();
        packed.push_str(&"00".repeat(31));
        packed.push_str("fa"); // transferred = 250
        packed.push_str(&"00".repeat(31));
        packed.push_str("64"); // locked = 100
        packed.push_str(&lock_id.to_string());
        let bytes = Vec::<u8>::from_hex(&packed).unwrap();
        let expected = crate::crypto::keccak256(&bytes);
        assert_eq!(
            hash_balance_data(U256::from(250u64), U256::from(100u64), lock_id),
            expected
        );
    }

    #[test]
    fn locked_transfer_signs_over_balance_hash() {
        let transfer = LockedTransfer {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            payment_contract: Address::repeat_byte(0x77),
            nonce: 3,
            transferred_amount: U256::from(250u64),
            locked_amount: U256::from(100u64),
            lock_id: expand_seed(b"lock").hash(),
            signature: Signature::default(),
        };
        let mut expected = String::new();
        expected.push_str(&"0c".repeat(32)); // channel
        expected.push_str(&"77".repeat(20)); // payment contract
        expected.push_str(&"00".repeat(31)); // nonce as uint256
        expected.push_str("03");
        expected.push_str(&transfer.balance_hash().as_bytes().to_hex());
        assert_eq!(transfer.pack().to_hex(), expected);
    }

    #[test]
    fn direct_transfer_digest_matches_unlocked_locked_transfer() {
        // After a round resolves, the closing direct transfer commits to the
        // same digest shape a contract-side balance proof check expects.
        let direct = DirectTransfer {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            payment_contract: Address::repeat_byte(0x77),
            nonce: 4,
            transferred_amount: U256::from(350u64),
            signature: Signature::default(),
        };
        let locked_shape = LockedTransfer {
            channel_id: direct.channel_id,
            payment_contract: direct.payment_contract,
            nonce: direct.nonce,
            transferred_amount: direct.transferred_amount,
            locked_amount: U256::zero(),
            lock_id: SecretHash::none(),
            signature: Signature::default(),
        };
        assert_eq!(direct.digest(), locked_shape.digest());
    }
}
