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

use std::collections::BTreeMap;

use dice2p::ChannelId;
use ethereum_types::Address;
use serde::{Deserialize, Serialize};

use crate::bet::{Bet, BetId, BetStatus};
use crate::channel::Channel;

/// Selection predicate for bet listings.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BetFilter {
    /// Restrict to one channel.
    pub channel_id: Option<ChannelId>,

    /// Restrict to an exact round status.
    pub status: Option<BetStatus>,

    /// Restrict to rounds which still occupy their channel.
    pub open_only: bool,
}

impl BetFilter {
    pub fn channel(channel_id: ChannelId) -> BetFilter {
        BetFilter {
            channel_id: Some(channel_id),
            ..BetFilter::default()
        }
    }

    pub fn matches(&self, bet: &Bet) -> bool {
        if let Some(channel_id) = self.channel_id {
            if bet.channel_id != channel_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if bet.status != status {
                return false;
            }
        }
        if self.open_only && !bet.is_open() {
            return false;
        }
        true
    }
}

/// Persistence capability for channel and bet records.
///
/// Each `put` must be applied atomically and durably before returning: the
/// engine persists an outgoing message before emitting it and an incoming
/// message before replying, so that a crash between send and persist can
/// never leave the peer holding a commitment the local side has no record
/// of. The production database backend plugs in through this trait; the
/// in-memory [`MemoryStore`] is the reference implementation.
pub trait StateStore {
    fn get_channel(&self, channel_id: ChannelId) -> Option<Channel>;

    /// The channel shared with `partner`, if any. The protocol is strictly
    /// pairwise, so at most one channel per partner exists.
    fn channel_with_partner(&self, partner: Address) -> Option<Channel>;

    fn put_channel(&mut self, channel: Channel);

    fn list_channels(&self) -> Vec<Channel>;

    fn get_bet(&self, channel_id: ChannelId, round: u64) -> Option<Bet>;

    fn get_bet_by_id(&self, bet_id: BetId) -> Option<Bet>;

    fn put_bet(&mut self, bet: Bet);

    /// Bets matching `filter`, ordered by `(channel_id, round)`, with
    /// pagination.
    fn list_bets(
        &self,
        filter: &BetFilter,
        offset: usize,
        limit: usize,
    ) -> Vec<Bet>;
}

/// BTreeMap-backed store. Reference implementation and test fixture; state
/// lives only as long as the process.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    channels: BTreeMap<ChannelId, Channel>,
    bets: BTreeMap<(ChannelId, u64), Bet>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore { MemoryStore::default() }
}

impl StateStore for MemoryStore {
    fn get_channel(&self, channel_id: ChannelId) -> Option<Channel> {
        self.channels.get(&channel_id).cloned()
    }

    fn channel_with_partner(&self, partner: Address) -> Option<Channel> {
        self.channels
            .values()
            .find(|channel| channel.remote == partner)
            .cloned()
    }

    fn put_channel(&mut self, channel: Channel) {
        self.channels.insert(channel.channel_id, channel);
    }

    fn list_channels(&self) -> Vec<Channel> {
        self.channels.values().cloned().collect()
    }

    fn get_bet(&self, channel_id: ChannelId, round: u64) -> Option<Bet> {
        self.bets.get(&(channel_id, round)).cloned()
    }

    fn get_bet_by_id(&self, bet_id: BetId) -> Option<Bet> {
        self.bets
            .values()
            .find(|bet| bet.bet_id() == bet_id)
            .cloned()
    }

    fn put_bet(&mut self, bet: Bet) {
        self.bets.insert((bet.channel_id, bet.round), bet);
    }

    fn list_bets(
        &self,
        filter: &BetFilter,
        offset: usize,
        limit: usize,
    ) -> Vec<Bet> {
        self.bets
            .values()
            .filter(|bet| filter.matches(bet))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}
