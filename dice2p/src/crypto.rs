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

//! Keccak-256 hashing, EVM-style packed encoding, recoverable ECDSA and seed
//! expansion.
//!
//! Every protocol message is a packed hash of a canonically ordered field
//! tuple signed with the participant's long-term key. The packing discipline
//! must match the EVM's `abi.encodePacked` byte for byte: addresses are 20
//! bytes raw, `uint256` values are 32-byte big-endian, `bytes32` values are
//! raw. One diverging byte makes the signature unverifiable on-chain.

use std::fmt::{self, Debug, Formatter};

use ethereum_types::{Address, H256, U256};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use tiny_keccak::{Hasher, Keccak};

use amplify::Wrapper;

use crate::types::{ChannelId, Secret, SecretHash, Signature};

/// Domain tag mixed into deterministic seed expansion so that a seed string
/// reused by the caller in another protocol cannot collide with our preimage.
const SEED_DOMAIN: &[u8] = b"dice-channel:seed:v1";

/// Signature production or recovery failure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SignatureError {
    /// message carries no signature
    Unsigned,

    /// signature recovery byte {0} is invalid; expected 27 or 28
    InvalidRecoveryByte(u8),

    /// malformed signature: {0}
    #[from]
    Encoding(secp256k1::Error),
}

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> H256 {
    let mut keccak = Keccak::v256();
    let mut output = [0u8; 32];
    keccak.update(data);
    keccak.finalize(&mut output);
    H256(output)
}

/// Builder reproducing EVM `abi.encodePacked` for the field shapes the
/// protocol signs over.
#[derive(Clone, Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self { Packer::default() }

    /// 20 raw bytes.
    pub fn address(mut self, addr: Address) -> Self {
        self.buf.extend_from_slice(addr.as_bytes());
        self
    }

    /// 32-byte big-endian `uint256`.
    pub fn uint256(mut self, value: U256) -> Self {
        let mut word = [0u8; 32];
        value.to_big_endian(&mut word);
        self.buf.extend_from_slice(&word);
        self
    }

    /// `uint64`/`uint32`-sized counters enter signed tuples widened to
    /// `uint256`, matching how the contracts declare them.
    pub fn uint(self, value: u64) -> Self { self.uint256(U256::from(value)) }

    /// 32 raw bytes (`bytes32`).
    pub fn h256(mut self, value: H256) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Raw byte run (signature echoes).
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn channel(self, id: ChannelId) -> Self { self.h256(id.into_inner()) }

    pub fn secret(self, secret: Secret) -> Self {
        self.h256(secret.into_inner())
    }

    pub fn lock(self, lock_id: SecretHash) -> Self {
        self.h256(lock_id.into_inner())
    }

    pub fn signature(self, signature: &Signature) -> Self {
        self.bytes(signature.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> { self.buf }

    /// Keccak-256 over the packed run.
    pub fn hash(self) -> H256 { keccak256(&self.buf) }
}

/// Exclusive holder of the participant's long-term signing key. The key never
/// leaves this type; all components sign through it.
#[derive(Clone)]
pub struct Signer {
    secret: SecretKey,
    address: Address,
}

impl Signer {
    pub fn new(secret: SecretKey) -> Self {
        let pubkey = PublicKey::from_secret_key(SECP256K1, &secret);
        Signer {
            secret,
            address: address_of(&pubkey),
        }
    }

    /// EVM address corresponding to the held key.
    pub fn address(&self) -> Address { self.address }

    /// Signs a 32-byte digest, producing an `r ‖ s ‖ v` signature with
    /// `v ∈ {27, 28}`. The digest is signed raw: the on-chain verifier
    /// recovers over the same unprefixed digest.
    pub fn sign_digest(&self, digest: H256) -> Signature {
        let message = Message::from_slice(digest.as_bytes())
            .expect("digest is exactly 32 bytes");
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, &self.secret);
        let (recovery_id, rs) = signature.serialize_compact();
        Signature::from_parts(rs, 27 + recovery_id.to_i32() as u8)
    }
}

impl Debug for Signer {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        // never print the key
        write!(f, "Signer({:?})", self.address)
    }
}

/// Recovers the signing address from a digest and a 65-byte signature.
pub fn recover(digest: H256, signature: &Signature) -> Result<Address, SignatureError> {
    if signature.is_zero() {
        return Err(SignatureError::Unsigned);
    }
    let v = signature.v();
    let recovery_id = match v {
        27 | 28 => RecoveryId::from_i32((v - 27) as i32)?,
        _ => return Err(SignatureError::InvalidRecoveryByte(v)),
    };
    let recoverable =
        RecoverableSignature::from_compact(&signature.rs(), recovery_id)?;
    let message = Message::from_slice(digest.as_bytes())
        .expect("digest is exactly 32 bytes");
    let pubkey = SECP256K1.recover_ecdsa(&message, &recoverable)?;
    Ok(address_of(&pubkey))
}

/// EVM address of a public key: low 20 bytes of the Keccak-256 of the
/// uncompressed key without its `0x04` tag byte.
pub fn address_of(pubkey: &PublicKey) -> Address {
    let serialized = pubkey.serialize_uncompressed();
    let hash = keccak256(&serialized[1..]);
    Address::from_slice(&hash.as_bytes()[12..])
}

/// Produces a 32-byte random preimage.
///
/// An empty seed draws 32 bytes from the operating system CSPRNG. A non-empty
/// seed is expanded deterministically (extract-then-expand over Keccak-256),
/// so a caller replaying the same seed reconstructs the same preimage.
pub fn expand_seed(seed: &[u8]) -> Secret {
    if seed.is_empty() {
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);
        return Secret::from(H256(entropy));
    }
    let prk = keccak256(&[SEED_DOMAIN, seed].concat());
    let okm = keccak256(&[prk.as_bytes(), &[0x01][..]].concat());
    Secret::from(okm)
}

#[cfg(test)]
mod test {
    use amplify::hex::ToHex;

    use super::*;

    fn signer(byte: u8) -> Signer {
        Signer::new(SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    #[test]
    fn keccak256_empty_vector() {
        assert_eq!(
            keccak256(b"").as_bytes().to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn keccak256_abc_vector() {
        assert_eq!(
            keccak256(b"abc").as_bytes().to_hex(),
            "4e03657aea45a94fc7d47ba826c8d667c0d1e6e33a64a036ec44f58fa12d6c45"
        );
    }

    #[test]
    fn address_of_known_key() {
        // The classic test key: secret = 1
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let signer = Signer::new(SecretKey::from_slice(&secret).unwrap());
        assert_eq!(
            signer.address().as_bytes().to_hex(),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn packing_matches_abi_encode_packed() {
        let packed = Packer::new()
            .address(Address::repeat_byte(0x11))
            .uint256(U256::from(0x2a))
            .h256(H256::repeat_byte(0xff))
            .finish();
        let mut expected = String::new();
        expected.push_str(&"11".repeat(20));
        expected.push_str(&"00".repeat(31));
        expected.push_str("2a");
        expected.push_str(&"ff".repeat(32));
        assert_eq!(packed.to_hex(), expected);
    }

    #[test]
    fn sign_recovers_to_signer() {
        let signer = signer(0x42);
        let digest = keccak256(b"round payload");
        let signature = signer.sign_digest(digest);
        assert!(matches!(signature.v(), 27 | 28));
        assert_eq!(recover(digest, &signature).unwrap(), signer.address());
    }

    #[test]
    fn recover_rejects_zero_signature() {
        let digest = keccak256(b"round payload");
        assert_eq!(
            recover(digest, &Signature::default()),
            Err(SignatureError::Unsigned)
        );
    }

    #[test]
    fn recover_rejects_bad_recovery_byte() {
        let signer = signer(0x42);
        let digest = keccak256(b"round payload");
        let good = signer.sign_digest(digest);
        let bad = Signature::from_parts(good.rs(), 31);
        assert_eq!(
            recover(digest, &bad),
            Err(SignatureError::InvalidRecoveryByte(31))
        );
    }

    #[test]
    fn tampered_digest_recovers_to_other_address() {
        let signer = signer(0x42);
        let signature = signer.sign_digest(keccak256(b"round payload"));
        let other = recover(keccak256(b"round payloae"), &signature);
        // recovery either fails or yields an unrelated address
        if let Ok(address) = other {
            assert_ne!(address, signer.address());
        }
    }

    #[test]
    fn seed_expansion_is_deterministic() {
        assert_eq!(expand_seed(b"seedA"), expand_seed(b"seedA"));
        assert_ne!(expand_seed(b"seedA"), expand_seed(b"seedB"));
    }

    #[test]
    fn empty_seed_draws_fresh_entropy() {
        assert_ne!(expand_seed(b""), expand_seed(b""));
    }
}
