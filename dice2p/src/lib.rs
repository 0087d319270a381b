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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;

pub mod crypto;
mod messages;
pub mod types;

pub use crypto::{expand_seed, keccak256, recover, Packer, SignatureError, Signer};
pub use messages::{
    hash_balance_data, BetRequest, BetResponse, CooperativeSettle,
    DirectTransfer, LockedTransfer, MessageError, Messages, Preimage,
    SignedMessage,
};
pub use types::{
    Address, ChannelId, Nonce, Secret, SecretHash, Signature,
    SignatureParseError, TokenAmount, H256, U256,
};
