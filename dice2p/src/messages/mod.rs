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

mod bet;
mod settle;
mod transfer;

pub use bet::{BetRequest, BetResponse, Preimage};
pub use settle::CooperativeSettle;
pub use transfer::{hash_balance_data, DirectTransfer, LockedTransfer};

use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::crypto::{keccak256, recover, SignatureError, Signer};
use crate::types::{ChannelId, Signature};

/// Message validation failure. Always a local drop: the peer is never told
/// why its message was discarded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum MessageError {
    /// invalid message signature: {0}
    #[from]
    Signature(SignatureError),

    /// message signed by {recovered} instead of the channel peer {claimed}
    SignerMismatch { claimed: Address, recovered: Address },
}

/// Common behavior of every protocol message: canonical packing of the
/// semantic fields, signing of the packed hash and sender recovery.
///
/// Generating and validating sides must produce bit-identical packings; the
/// canonical field orders are pinned by the tests of each message module.
pub trait SignedMessage {
    /// Canonical EVM packing of the signed semantic fields, in protocol
    /// order.
    fn pack(&self) -> Vec<u8>;

    fn signature(&self) -> &Signature;

    fn set_signature(&mut self, signature: Signature);

    /// Keccak-256 of the canonical packing; the digest that is signed.
    fn digest(&self) -> H256 { keccak256(&self.pack()) }

    fn sign(&mut self, signer: &Signer) {
        let digest = self.digest();
        self.set_signature(signer.sign_digest(digest));
    }

    /// Re-derives the digest and recovers the address which produced the
    /// carried signature.
    fn recover_sender(&self) -> Result<Address, SignatureError> {
        recover(self.digest(), self.signature())
    }

    /// Accepts the message only if its signature recovers to the claimed
    /// sender bound in the enclosing channel.
    fn verify(&self, claimed: Address) -> Result<(), MessageError> {
        let recovered = self.recover_sender()?;
        if recovered != claimed {
            return Err(MessageError::SignerMismatch { claimed, recovered });
        }
        Ok(())
    }
}

/// All messages of the dice channel protocol.
///
/// The set is closed: a wire record whose `message_type` matches none of the
/// variants fails deserialization and is treated as a protocol error by the
/// engine, not silently ignored.
///
/// `LockedTransferR` and `DirectTransferR` are the acceptor-to-initiator
/// twins of their forward kinds; they reuse the same payload shape and differ
/// in the direction the balance delta moves.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[serde(tag = "message_type")]
#[display(inner)]
pub enum Messages {
    /// Initiator opens a bet round, committing to game parameters and its
    /// hashed preimage.
    BetRequest(BetRequest),

    /// Acceptor commits to the round, revealing its own random and echoing
    /// the initiator's commitment signature.
    BetResponse(BetResponse),

    /// Acceptor stakes the wager value under the round's lock.
    LockedTransfer(LockedTransfer),

    /// Initiator stakes the wager value under the round's lock.
    LockedTransferR(LockedTransfer),

    /// Initiator converts the round outcome into an unconditional balance
    /// update.
    DirectTransfer(DirectTransfer),

    /// Acceptor's unconditional balance update closing the round.
    DirectTransferR(DirectTransfer),

    /// Initiator reveals its preimage once all commitments are exchanged.
    Preimage(Preimage),

    /// Proposal to settle the channel cooperatively at the given balances.
    CooperativeSettleRequest(CooperativeSettle),

    /// Counter-signature of a cooperative settle proposal.
    CooperativeSettleResponse(CooperativeSettle),
}

impl Messages {
    /// The channel this message belongs to.
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Messages::BetRequest(m) => m.channel_id,
            Messages::BetResponse(m) => m.channel_id,
            Messages::LockedTransfer(m) | Messages::LockedTransferR(m) => {
                m.channel_id
            }
            Messages::DirectTransfer(m) | Messages::DirectTransferR(m) => {
                m.channel_id
            }
            Messages::Preimage(m) => m.channel_id,
            Messages::CooperativeSettleRequest(m)
            | Messages::CooperativeSettleResponse(m) => m.channel_id,
        }
    }

    /// Bet round the message refers to, for kinds which are round-scoped.
    pub fn round(&self) -> Option<u64> {
        match self {
            Messages::BetRequest(m) => Some(m.round),
            Messages::BetResponse(m) => Some(m.round),
            Messages::Preimage(m) => Some(m.round),
            _ => None,
        }
    }

    /// Wire tag of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Messages::BetRequest(_) => "BetRequest",
            Messages::BetResponse(_) => "BetResponse",
            Messages::LockedTransfer(_) => "LockedTransfer",
            Messages::LockedTransferR(_) => "LockedTransferR",
            Messages::DirectTransfer(_) => "DirectTransfer",
            Messages::DirectTransferR(_) => "DirectTransferR",
            Messages::Preimage(_) => "Preimage",
            Messages::CooperativeSettleRequest(_) => "CooperativeSettleRequest",
            Messages::CooperativeSettleResponse(_) => {
                "CooperativeSettleResponse"
            }
        }
    }

    /// View of the message through its signing behavior.
    pub fn as_signed(&self) -> &dyn SignedMessage {
        match self {
            Messages::BetRequest(m) => m,
            Messages::BetResponse(m) => m,
            Messages::LockedTransfer(m) | Messages::LockedTransferR(m) => m,
            Messages::DirectTransfer(m) | Messages::DirectTransferR(m) => m,
            Messages::Preimage(m) => m,
            Messages::CooperativeSettleRequest(m)
            | Messages::CooperativeSettleResponse(m) => m,
        }
    }

    /// Validates the carried signature against the claimed sender.
    pub fn verify(&self, claimed: Address) -> Result<(), MessageError> {
        self.as_signed().verify(claimed)
    }
}

#[cfg(test)]
mod test {
    use ethereum_types::U256;
    use secp256k1::SecretKey;

    use super::*;
    use crate::crypto::expand_seed;
    use crate::types::SecretHash;

    fn signer(byte: u8) -> Signer {
        Signer::new(SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    fn locked_transfer_for_tests() -> LockedTransfer {
        LockedTransfer {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            payment_contract: Address::repeat_byte(0x77),
            nonce: 3,
            transferred_amount: U256::from(250u64),
            locked_amount: U256::from(100u64),
            lock_id: expand_seed(b"lock").hash(),
            signature: Signature::default(),
        }
    }

    #[test]
    fn generate_validate_roundtrip() {
        let signer = signer(0x21);
        let mut transfer = locked_transfer_for_tests();
        transfer.sign(&signer);
        let msg = Messages::LockedTransfer(transfer);
        msg.verify(signer.address()).unwrap();
    }

    #[test]
    fn flipped_field_is_rejected() {
        let signer = signer(0x21);
        let mut transfer = locked_transfer_for_tests();
        transfer.sign(&signer);
        transfer.transferred_amount = U256::from(251u64);
        match transfer.verify(signer.address()) {
            Err(MessageError::SignerMismatch { .. })
            | Err(MessageError::Signature(_)) => {}
            other => panic!("tampered message accepted: {:?}", other),
        }
    }

    #[test]
    fn wrong_claimed_sender_is_rejected() {
        let owner = signer(0x21);
        let stranger = signer(0x22);
        let mut transfer = locked_transfer_for_tests();
        transfer.sign(&owner);
        assert_eq!(
            transfer.verify(stranger.address()),
            Err(MessageError::SignerMismatch {
                claimed: stranger.address(),
                recovered: owner.address(),
            })
        );
    }

    #[test]
    fn unsigned_message_is_rejected() {
        let transfer = locked_transfer_for_tests();
        assert!(matches!(
            transfer.verify(signer(0x21).address()),
            Err(MessageError::Signature(SignatureError::Unsigned))
        ));
    }

    #[test]
    fn wire_format_is_tagged_by_message_type() {
        let mut transfer = locked_transfer_for_tests();
        transfer.sign(&signer(0x21));
        let json =
            serde_json::to_value(Messages::LockedTransferR(transfer)).unwrap();
        assert_eq!(json["message_type"], "LockedTransferR");
        assert!(json["nonce"].is_number());
    }

    #[test]
    fn unknown_message_type_fails_decoding() {
        let raw = r#"{"message_type": "RefundTransfer", "nonce": 1}"#;
        assert!(serde_json::from_str::<Messages>(raw).is_err());
    }

    #[test]
    fn wire_roundtrip_preserves_direction() {
        let mut transfer = locked_transfer_for_tests();
        transfer.sign(&signer(0x21));
        let forward = Messages::LockedTransfer(transfer.clone());
        let reverse = Messages::LockedTransferR(transfer);
        let forward_json = serde_json::to_string(&forward).unwrap();
        let reverse_json = serde_json::to_string(&reverse).unwrap();
        assert_eq!(
            serde_json::from_str::<Messages>(&forward_json).unwrap(),
            forward
        );
        assert_eq!(
            serde_json::from_str::<Messages>(&reverse_json).unwrap(),
            reverse
        );
        assert_ne!(forward_json, reverse_json);
    }

    #[test]
    fn direct_transfer_balance_hash_uses_null_lock() {
        let transfer = DirectTransfer {
            channel_id: ChannelId::from(H256::repeat_byte(0x0c)),
            payment_contract: Address::repeat_byte(0x77),
            nonce: 4,
            transferred_amount: U256::from(350u64),
            signature: Signature::default(),
        };
        assert_eq!(
            transfer.balance_hash(),
            hash_balance_data(
                U256::from(350u64),
                U256::zero(),
                SecretHash::none()
            )
        );
    }
}
