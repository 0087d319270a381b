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

use std::fmt::{self, Debug, Display, Formatter, LowerHex};
use std::str::FromStr;

use amplify::hex::{Error as HexError, FromHex, ToHex};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use ethereum_types::{Address, H256, U256};

/// Token amounts are EVM `uint256` values. The protocol never constructs a
/// negative amount; all balance arithmetic is checked.
pub type TokenAmount = U256;

/// Per-emitter counter of balance-bearing messages within one channel.
/// Packed as `uint256` wherever it enters a signed tuple or on-chain proof.
pub type Nonce = u64;

/// Channel identifier assigned by the payment contract when the channel is
/// opened on-chain: a 256-bit number opaque to the off-chain protocol.
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
pub struct ChannelId(H256);

impl ChannelId {
    /// Channel id consisting of all zeros is never assigned by the contract
    /// and marks a record which has not been anchored on-chain yet.
    pub fn is_null(&self) -> bool { self.0 == H256::zero() }
}

/// 32-byte random preimage. Kept private by its originator until the reveal
/// step of the round; knowing both preimages determines the round outcome.
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
pub struct Secret(H256);

impl Secret {
    /// Keccak-256 commitment to the preimage, used as the lock id of the
    /// round's locked transfers.
    pub fn hash(&self) -> SecretHash {
        SecretHash::from(crate::crypto::keccak256(self.0.as_bytes()))
    }
}

/// Keccak-256 hash of a [`Secret`]. Doubles as the lock id binding a locked
/// transfer to the bet round it stakes.
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
pub struct SecretHash(H256);

impl SecretHash {
    /// The all-zero lock id used by direct transfers, which carry no lock.
    pub fn none() -> Self { SecretHash(H256::zero()) }

    pub fn is_none(&self) -> bool { self.0 == H256::zero() }
}

/// Failure parsing a [`Signature`] from its hex representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SignatureParseError {
    /// invalid hex encoding: {0}
    #[from]
    Hex(HexError),

    /// signature must be 65 bytes, got {0}
    WrongLength(usize),
}

/// 65-byte recoverable ECDSA signature in EVM layout: `r ‖ s ‖ v` with
/// `v ∈ {27, 28}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 65]);

impl Signature {
    pub fn from_raw(data: [u8; 65]) -> Self { Signature(data) }

    pub fn from_parts(rs: [u8; 64], v: u8) -> Self {
        let mut data = [0u8; 65];
        data[..64].copy_from_slice(&rs);
        data[64] = v;
        Signature(data)
    }

    /// The compact `r ‖ s` part.
    pub fn rs(&self) -> [u8; 64] {
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&self.0[..64]);
        rs
    }

    /// The recovery byte.
    pub fn v(&self) -> u8 { self.0[64] }

    pub fn as_bytes(&self) -> &[u8; 65] { &self.0 }

    /// A message which was constructed but not yet signed carries the zero
    /// signature; it must never pass validation.
    pub fn is_zero(&self) -> bool { self.0 == [0u8; 65] }
}

impl Default for Signature {
    fn default() -> Self { Signature([0u8; 65]) }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Signature(0x{:x})", self)
    }
}

impl LowerHex for Signature {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self)
    }
}

impl FromStr for Signature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let data = Vec::<u8>::from_hex(s)?;
        if data.len() != 65 {
            return Err(SignatureParseError::WrongLength(data.len()));
        }
        let mut inner = [0u8; 65];
        inner.copy_from_slice(&data);
        Ok(Signature(inner))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_str(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_hex_roundtrip() {
        let mut raw = [0u8; 65];
        raw[0] = 0xde;
        raw[1] = 0xad;
        raw[64] = 27;
        let sig = Signature::from_raw(raw);
        let s = sig.to_string();
        assert!(s.starts_with("0xdead"));
        assert!(s.ends_with("1b"));
        assert_eq!(Signature::from_str(&s).unwrap(), sig);
    }

    #[test]
    fn signature_rejects_wrong_length() {
        assert!(Signature::from_str("0xdeadbeef").is_err());
    }

    #[test]
    fn zero_signature_is_detected() {
        assert!(Signature::default().is_zero());
        assert!(!Signature::from_parts([1u8; 64], 27).is_zero());
    }

    #[test]
    fn channel_id_display_parses_back() {
        let id = ChannelId::from(H256::repeat_byte(0xa7));
        let s = id.to_string();
        assert_eq!(ChannelId::from_str(&s).unwrap(), id);
        assert!(!id.is_null());
        assert!(ChannelId::default().is_null());
    }
}
