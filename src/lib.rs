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
#[macro_use]
extern crate log;

pub extern crate dice2p as p2p;

pub mod bet;
pub mod chain;
pub mod channel;
pub mod client;
pub mod config;
pub mod events;
pub mod proofs;
pub mod store;
pub mod transport;

pub use bet::{Bet, BetId, BetStatus};
pub use chain::{ChainError, ChainEvent, ChannelContract, ConfirmedEvent, Reconciler, TxHash};
pub use channel::{BalanceProof, Channel, ChannelStatus, Error};
pub use client::ChannelClient;
pub use config::{AutoRespond, Config, ConfigError};
pub use events::{DomainEvent, EventBus, EventKind};
pub use proofs::{
    CloseProof, CooperativeSettleProof, InitiatorSettleProof, ProofAssembler,
    ProofContext, SettleProof,
};
pub use store::{BetFilter, MemoryStore, StateStore};
pub use transport::MessageSender;
