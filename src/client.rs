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

//! The per-participant protocol engine: channel and bet-round state
//! machines, auto-responses, chain-event reconciliation and the public
//! client API.
//!
//! The engine is logically single-threaded per channel: every handler loads
//! the affected records, validates, mutates the loaded copies and persists
//! them before any message leaves the node. A handler that fails leaves the
//! store untouched.

use std::collections::BTreeMap;

use amplify::Wrapper;
use dice2p::{
    expand_seed, BetRequest, BetResponse, ChannelId, CooperativeSettle,
    DirectTransfer, LockedTransfer, Messages, Preimage, SecretHash,
    SignedMessage, Signer, TokenAmount,
};
use ethereum_types::{Address, U256};

use crate::bet::{win_amount, Bet, BetId, BetStatus};
use crate::chain::{
    ChainEvent, ChannelContract, ConfirmedEvent, Reconciler, TxHash,
};
use crate::channel::{
    BalanceProof, Channel, ChannelStatus, CloseSnapshots, Error,
};
use crate::config::Config;
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::proofs::ProofAssembler;
use crate::store::{BetFilter, StateStore};
use crate::transport::MessageSender;

/// The long-lived channel client of one participant.
pub struct ChannelClient<S, C, T>
where
    S: StateStore,
    C: ChannelContract,
    T: MessageSender,
{
    config: Config,
    signer: Signer,
    store: S,
    chain: C,
    transport: T,
    events: EventBus,
    reconciler: Reconciler,
    /// Partner address → on-chain channel identifier, filled from open
    /// events and contract lookups.
    channel_ids: BTreeMap<Address, ChannelId>,
    current_block: u64,
}

impl<S, C, T> ChannelClient<S, C, T>
where
    S: StateStore,
    C: ChannelContract,
    T: MessageSender,
{
    /// Constructs the client, validating the configuration against the
    /// signing key.
    pub fn with(
        config: Config,
        signer: Signer,
        store: S,
        chain: C,
        transport: T,
    ) -> Result<Self, Error> {
        config.validate(signer.address())?;
        let reconciler = Reconciler::new(config.confirmation_depth);
        Ok(ChannelClient {
            config,
            signer,
            store,
            chain,
            transport,
            events: EventBus::new(),
            reconciler,
            channel_ids: BTreeMap::new(),
            current_block: 0,
        })
    }

    pub fn local_address(&self) -> Address { self.config.address }

    /// Read access to the persisted records, for inspection and proof
    /// assembly by embedding code.
    pub fn store(&self) -> &S { &self.store }

    /// Registers `callback` under `kind`, replacing any earlier
    /// registration for the same event name.
    pub fn on(
        &mut self,
        kind: EventKind,
        callback: impl FnMut(&DomainEvent) + 'static,
    ) {
        self.events.on(kind, callback);
    }

    // Public operations
    // =================

    /// Opens a channel with `partner` on-chain. The local record is created
    /// once the confirmed `ChannelOpened` event arrives.
    pub fn open_channel(
        &mut self,
        partner: Address,
        deposit: TokenAmount,
    ) -> Result<TxHash, Error> {
        let tx = self.chain.open_channel(
            partner,
            self.config.settle_window,
            deposit,
        )?;
        info!("opening channel with {:?}, deposit {}", partner, deposit);
        Ok(tx)
    }

    /// Adds `amount` to the local deposit. Safe to retry: the contract
    /// keeps cumulative totals.
    pub fn deposit(
        &mut self,
        partner: Address,
        amount: TokenAmount,
    ) -> Result<TxHash, Error> {
        Ok(self.chain.deposit(partner, amount)?)
    }

    /// Initiates a bet round with the channel partner.
    ///
    /// A non-empty `seed` derives the round preimage deterministically;
    /// an empty one draws fresh entropy.
    pub fn start_bet(
        &mut self,
        partner: Address,
        bet_mask: U256,
        modulo: u64,
        value: TokenAmount,
        seed: &[u8],
    ) -> Result<(), Error> {
        let mut channel = self.channel_by_partner(partner)?;
        let channel_id = channel.channel_id;
        if channel.status != ChannelStatus::Opened {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "start_bet",
            });
        }
        if let Some(open) = self.open_bet(&channel) {
            return Err(Error::WrongBetState {
                channel_id,
                round: open.round,
                current: open.status,
                operation: "start_bet",
            });
        }
        let round = channel.current_round + 1;
        let win = win_amount(channel_id, round, bet_mask, modulo, value)?;
        // the initiator risks the stake, the acceptor the payout
        if channel.local_balance < value || channel.remote_balance < win {
            return Err(Error::BalanceConservationViolation {
                channel_id,
                round,
            });
        }

        let ra = expand_seed(seed);
        let hash_ra = ra.hash();
        let mut request = BetRequest {
            channel_id,
            round,
            game_contract: self.config.game_contract,
            bet_mask,
            modulo,
            positive: self.config.address,
            negative: partner,
            hash_ra,
            value,
            signature: Default::default(),
        };
        request.sign(&self.signer);

        let mut bet = Bet {
            channel_id,
            round,
            bet_mask,
            modulo,
            value,
            win_amount: win,
            initiator: self.config.address,
            acceptor: partner,
            ra: Some(ra),
            hash_ra,
            rb: None,
            initiator_signature: request.signature,
            acceptor_signature: Default::default(),
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status: BetStatus::Init,
            deadline_block: None,
            frozen: false,
        };
        self.store.put_bet(bet.clone());

        bet.status = BetStatus::Start;
        bet.deadline_block = Some(self.response_deadline());
        channel.current_round = round;
        self.store.put_bet(bet);
        self.store.put_channel(channel);
        self.transport.send(partner, &Messages::BetRequest(request));
        info!(
            "bet round {} started on channel {} (mask {:#x}, modulo {}, \
             value {})",
            round, channel_id, bet_mask, modulo, value
        );
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round,
            old: BetStatus::Init,
            new: BetStatus::Start,
        });
        Ok(())
    }

    /// Unilateral close with the latest accepted partner balance proof.
    pub fn close_channel(&mut self, partner: Address) -> Result<TxHash, Error> {
        let channel = self.channel_by_partner(partner)?;
        let proof =
            ProofAssembler::new(&self.store).close_proof(channel.channel_id)?;
        let tx = self.chain.close_channel(partner, &proof)?;
        info!(
            "closing channel {} with partner proof nonce {}",
            channel.channel_id, proof.nonce
        );
        Ok(tx)
    }

    /// Proposes a cooperative settlement at the current balances. The
    /// channel settles once the partner counter-signs and the co-signed
    /// proof is submitted.
    pub fn close_channel_cooperative(
        &mut self,
        partner: Address,
    ) -> Result<(), Error> {
        let mut channel = self.channel_by_partner(partner)?;
        let channel_id = channel.channel_id;
        if channel.status != ChannelStatus::Opened {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "close_channel_cooperative",
            });
        }
        if let Some(open) = self.open_bet(&channel) {
            return Err(Error::WrongBetState {
                channel_id,
                round: open.round,
                current: open.status,
                operation: "close_channel_cooperative",
            });
        }
        let ((p1, p1_balance), (p2, p2_balance)) = channel.ordered_balances();
        let mut terms = CooperativeSettle {
            channel_id,
            participant1: p1,
            participant1_balance: p1_balance,
            participant2: p2,
            participant2_balance: p2_balance,
            signature: Default::default(),
        };
        terms.sign(&self.signer);
        channel.coop_local = Some(terms.clone());
        self.store.put_channel(channel);
        self.transport
            .send(partner, &Messages::CooperativeSettleRequest(terms));
        Ok(())
    }

    /// Counter-signs a pending cooperative settle proposal. Only needed
    /// when the `cooperative_settle` auto-respond switch is off.
    pub fn accept_cooperative_settle(
        &mut self,
        partner: Address,
    ) -> Result<(), Error> {
        let mut channel = self.channel_by_partner(partner)?;
        let channel_id = channel.channel_id;
        let remote_terms =
            channel.coop_remote.clone().ok_or(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "accept_cooperative_settle",
            })?;
        let mut terms = remote_terms;
        terms.sign(&self.signer);
        channel.coop_local = Some(terms.clone());
        self.store.put_channel(channel);
        self.transport
            .send(partner, &Messages::CooperativeSettleResponse(terms));
        let proof = ProofAssembler::new(&self.store)
            .cooperative_settle_proof(channel_id)?;
        self.emit(DomainEvent::CooperativeSettleReady(proof));
        Ok(())
    }

    /// Settles a closed channel after the settle window from the close-time
    /// snapshots.
    pub fn settle_channel(&mut self, partner: Address) -> Result<TxHash, Error> {
        let channel = self.channel_by_partner(partner)?;
        let proof = ProofAssembler::new(&self.store)
            .settle_proof(channel.channel_id)?;
        Ok(self.chain.settle(&proof)?)
    }

    /// Submits the latest partner balance proof during the settle window
    /// (non-closing side only).
    pub fn update_balance_proof(
        &mut self,
        partner: Address,
    ) -> Result<TxHash, Error> {
        let channel = self.channel_by_partner(partner)?;
        let proof = ProofAssembler::new(&self.store)
            .update_proof(channel.channel_id)?;
        Ok(self
            .chain
            .update_non_closing_balance_proof(partner, &proof)?)
    }

    /// Releases a resolved or expired lock on-chain.
    pub fn unlock_channel(
        &mut self,
        partner: Address,
        lock_id: SecretHash,
    ) -> Result<TxHash, Error> {
        let channel = self.channel_by_partner(partner)?;
        if channel.status == ChannelStatus::Opened {
            return Err(Error::WrongChannelState {
                channel_id: channel.channel_id,
                current: channel.status,
                operation: "unlock_channel",
            });
        }
        Ok(self.chain.unlock(partner, lock_id)?)
    }

    /// Submits the dispute evidence resolving a frozen round on-chain.
    pub fn initiator_settle(
        &mut self,
        channel_id: ChannelId,
        bet_id: BetId,
    ) -> Result<TxHash, Error> {
        let bet = self
            .store
            .get_bet_by_id(bet_id)
            .ok_or_else(|| Error::UnknownBetId(bet_id.into_inner()))?;
        if bet.channel_id != channel_id {
            return Err(Error::UnknownBet {
                channel_id,
                round: bet.round,
            });
        }
        let proof = ProofAssembler::new(&self.store)
            .initiator_settle_proof(channel_id, bet.round)?;
        Ok(self.chain.initiator_settle(&proof)?)
    }

    pub fn get_all_channels(&self) -> Vec<Channel> {
        self.store.list_channels()
    }

    /// The full channel record shared with `partner`.
    pub fn get_channel(&mut self, partner: Address) -> Result<Channel, Error> {
        self.channel_by_partner(partner)
    }

    pub fn get_all_bets(
        &self,
        filter: &BetFilter,
        offset: usize,
        limit: usize,
    ) -> Vec<Bet> {
        self.store.list_bets(filter, offset, limit)
    }

    pub fn get_bet_by_id(&self, bet_id: BetId) -> Result<Bet, Error> {
        self.store
            .get_bet_by_id(bet_id)
            .ok_or_else(|| Error::UnknownBetId(bet_id.into_inner()))
    }

    // Block ticks and timeouts
    // ========================

    /// Advances the local block clock and freezes rounds whose peer-response
    /// deadline has elapsed.
    pub fn notify_block(&mut self, block_number: u64) {
        self.current_block = self.current_block.max(block_number);
        for channel in self.store.list_channels() {
            let bet = match self.open_bet(&channel) {
                Some(bet) => bet,
                None => continue,
            };
            let expired = !bet.frozen
                && bet
                    .deadline_block
                    .map_or(false, |deadline| self.current_block > deadline);
            if !expired {
                continue;
            }
            let mut bet = bet;
            bet.frozen = true;
            bet.deadline_block = None;
            warn!(
                "round {} on channel {} timed out at block {}; frozen",
                bet.round, channel.channel_id, self.current_block
            );
            self.store.put_bet(bet.clone());
            self.emit(DomainEvent::RoundTimeout {
                channel_id: channel.channel_id,
                round: bet.round,
            });
        }
    }

    // Chain event reconciliation
    // ==========================

    /// Applies one confirmed chain event to local state.
    pub fn on_chain_event(
        &mut self,
        confirmed: ConfirmedEvent,
    ) -> Result<(), Error> {
        self.reconciler.absorb(confirmed.block_number)?;
        self.current_block = self.current_block.max(confirmed.block_number);
        match &confirmed.event {
            ChainEvent::ChannelOpened {
                channel_id,
                participant1,
                participant2,
                settle_window,
            } => {
                let local = self.config.address;
                let remote = if *participant1 == local {
                    *participant2
                } else if *participant2 == local {
                    *participant1
                } else {
                    trace!(
                        "ignoring open event for foreign channel {}",
                        channel_id
                    );
                    return Ok(());
                };
                if self.store.get_channel(*channel_id).is_none() {
                    self.store.put_channel(Channel::with(
                        *channel_id,
                        local,
                        remote,
                        *settle_window,
                    ));
                    info!("channel {} opened with {:?}", channel_id, remote);
                }
                self.channel_ids.insert(remote, *channel_id);
            }
            ChainEvent::ChannelNewDeposit {
                channel_id,
                participant,
                total_deposit,
            } => {
                let mut channel = self.channel(*channel_id)?;
                let (deposit, balance) = if *participant == channel.local {
                    (&mut channel.local_deposit, &mut channel.local_balance)
                } else {
                    (&mut channel.remote_deposit, &mut channel.remote_balance)
                };
                let delta = total_deposit.checked_sub(*deposit).ok_or(
                    Error::BalanceConservationViolation {
                        channel_id: *channel_id,
                        round: 0,
                    },
                )?;
                *deposit = *total_deposit;
                *balance += delta;
                self.store.put_channel(channel);
            }
            ChainEvent::ChannelClosed {
                channel_id,
                closing_participant,
                nonce,
                ..
            } => {
                let mut channel = self.channel(*channel_id)?;
                let old = channel.status;
                channel.status = ChannelStatus::Closed;
                channel.close_snapshots = Some(CloseSnapshots {
                    local: channel.latest_local_proof.clone(),
                    remote: channel.latest_remote_proof.clone(),
                });
                self.store.put_channel(channel);
                info!(
                    "channel {} closed by {:?} at nonce {}",
                    channel_id, closing_participant, nonce
                );
                self.emit(DomainEvent::ChannelStatus {
                    channel_id: *channel_id,
                    old,
                    new: ChannelStatus::Closed,
                });
            }
            ChainEvent::NonClosingBalanceProofUpdated { channel_id, .. } => {
                let mut channel = self.channel(*channel_id)?;
                let old = channel.status;
                channel.status = ChannelStatus::UpdateBalanceProof;
                self.store.put_channel(channel);
                self.emit(DomainEvent::ChannelStatus {
                    channel_id: *channel_id,
                    old,
                    new: ChannelStatus::UpdateBalanceProof,
                });
            }
            ChainEvent::ChannelUnlocked {
                channel_id,
                participant,
                lock_id,
                returned_amount,
            } => {
                debug!(
                    "lock {} of {:?} on channel {} unlocked, returning {}",
                    lock_id, participant, channel_id, returned_amount
                );
            }
            ChainEvent::ChannelSettled { channel_id, .. } => {
                let mut channel = self.channel(*channel_id)?;
                let old = channel.status;
                channel.status = ChannelStatus::Settled;
                self.store.put_channel(channel);
                self.emit(DomainEvent::ChannelStatus {
                    channel_id: *channel_id,
                    old,
                    new: ChannelStatus::Settled,
                });
            }
        }
        self.emit(DomainEvent::Chain(confirmed));
        Ok(())
    }

    // Message dispatch
    // ================

    /// Validates and applies one incoming peer message, sending the
    /// auto-response its switch allows.
    pub fn handle_message(&mut self, message: Messages) -> Result<(), Error> {
        let channel_id = message.channel_id();
        let channel = self
            .store
            .get_channel(channel_id)
            .ok_or(Error::UnknownChannel(channel_id))?;
        message.verify(channel.remote).map_err(|details| {
            warn!(
                "dropping {} on channel {}: {}",
                message.kind(),
                channel_id,
                details
            );
            Error::InvalidSignature {
                channel_id,
                kind: message.kind(),
                details,
            }
        })?;
        match message {
            Messages::BetRequest(request) => {
                self.on_bet_request(channel, request)
            }
            Messages::LockedTransfer(transfer) => {
                self.on_locked_transfer(channel, transfer)
            }
            Messages::LockedTransferR(transfer) => {
                self.on_locked_transfer_r(channel, transfer)
            }
            Messages::BetResponse(response) => {
                self.on_bet_response(channel, response)
            }
            Messages::Preimage(preimage) => {
                self.on_preimage(channel, preimage)
            }
            Messages::DirectTransfer(transfer) => {
                self.on_direct_transfer(channel, transfer)
            }
            Messages::DirectTransferR(transfer) => {
                self.on_direct_transfer_r(channel, transfer)
            }
            Messages::CooperativeSettleRequest(terms) => {
                self.on_cooperative_settle_request(channel, terms)
            }
            Messages::CooperativeSettleResponse(terms) => {
                self.on_cooperative_settle_response(channel, terms)
            }
        }
    }

    // Bet round handlers
    // ------------------

    fn on_bet_request(
        &mut self,
        mut channel: Channel,
        request: BetRequest,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        // in-window retransmission of the accepted request
        if request.round == channel.current_round {
            if let Some(bet) = self.store.get_bet(channel_id, request.round) {
                if bet.initiator_signature == request.signature
                    && bet.status == BetStatus::Start
                {
                    return Ok(());
                }
            }
        }
        if channel.status != ChannelStatus::Opened {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "accept a bet request",
            });
        }
        if let Some(open) = self.open_bet(&channel) {
            return Err(Error::WrongBetState {
                channel_id,
                round: open.round,
                current: open.status,
                operation: "accept a bet request",
            });
        }
        let violation = |reason| Error::ProtocolViolation {
            channel_id,
            round: request.round,
            kind: "BetRequest",
            reason,
        };
        if request.round != channel.current_round + 1 {
            return Err(violation("unexpected round number"));
        }
        if request.positive != channel.remote
            || request.negative != channel.local
        {
            return Err(violation("participants do not match the channel"));
        }
        if request.game_contract != self.config.game_contract {
            return Err(violation("unknown game contract"));
        }
        let win = win_amount(
            channel_id,
            request.round,
            request.bet_mask,
            request.modulo,
            request.value,
        )?;
        // the acceptor risks the payout, the initiator its stake
        if channel.local_balance < win.max(request.value)
            || channel.remote_balance < request.value
        {
            return Err(Error::BalanceConservationViolation {
                channel_id,
                round: request.round,
            });
        }

        let mut bet = Bet {
            channel_id,
            round: request.round,
            bet_mask: request.bet_mask,
            modulo: request.modulo,
            value: request.value,
            win_amount: win,
            initiator: channel.remote,
            acceptor: channel.local,
            ra: None,
            hash_ra: request.hash_ra,
            rb: None,
            initiator_signature: request.signature,
            acceptor_signature: Default::default(),
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status: BetStatus::Start,
            deadline_block: None,
            frozen: false,
        };
        channel.current_round = request.round;
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        self.emit(DomainEvent::Message(Messages::BetRequest(request)));

        if !self.config.auto_respond.locked_transfer {
            return self.freeze_round(&mut bet, "manual locked_transfer");
        }
        self.emit_locked_transfer(channel, bet, false)
    }

    fn on_locked_transfer(
        &mut self,
        mut channel: Channel,
        transfer: LockedTransfer,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let mut bet = self.current_bet(&channel, "LockedTransfer")?;
        if bet.locked_transfer_remote.as_ref() == Some(&transfer)
            && bet.status == BetStatus::LockedTransferSent
        {
            return Ok(());
        }
        channel.accept_remote_nonce(transfer.nonce, "LockedTransfer")?;
        self.ensure_live(&bet)?;
        if bet.status != BetStatus::Start {
            return Err(Error::WrongBetState {
                channel_id,
                round: bet.round,
                current: bet.status,
                operation: "accept the acceptor lock",
            });
        }
        if bet.initiator != channel.local {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: bet.round,
                kind: "LockedTransfer",
                reason: "lock sent in the wrong direction",
            });
        }
        self.validate_lock(&channel, &bet, &transfer, "LockedTransfer")?;
        channel.lock_remote(bet.value)?;
        channel.latest_remote_proof =
            BalanceProof::from_locked_transfer(&transfer);
        bet.locked_transfer_remote = Some(transfer.clone());
        bet.status = BetStatus::LockedTransferSent;
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        self.emit(DomainEvent::Message(Messages::LockedTransfer(transfer)));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old: BetStatus::Start,
            new: BetStatus::LockedTransferSent,
        });

        if !self.config.auto_respond.locked_transfer_r {
            return self.freeze_round(&mut bet, "manual locked_transfer_r");
        }
        self.emit_locked_transfer(channel, bet, true)
    }

    fn on_locked_transfer_r(
        &mut self,
        mut channel: Channel,
        transfer: LockedTransfer,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let mut bet = self.current_bet(&channel, "LockedTransferR")?;
        if bet.locked_transfer_remote.as_ref() == Some(&transfer)
            && bet.status == BetStatus::LockedTransferRSent
        {
            return Ok(());
        }
        channel.accept_remote_nonce(transfer.nonce, "LockedTransferR")?;
        self.ensure_live(&bet)?;
        if bet.status != BetStatus::LockedTransferSent {
            return Err(Error::WrongBetState {
                channel_id,
                round: bet.round,
                current: bet.status,
                operation: "accept the initiator lock",
            });
        }
        if bet.acceptor != channel.local {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: bet.round,
                kind: "LockedTransferR",
                reason: "lock sent in the wrong direction",
            });
        }
        self.validate_lock(&channel, &bet, &transfer, "LockedTransferR")?;
        channel.lock_remote(bet.value)?;
        channel.latest_remote_proof =
            BalanceProof::from_locked_transfer(&transfer);
        bet.locked_transfer_remote = Some(transfer.clone());
        bet.status = BetStatus::LockedTransferRSent;
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        self.emit(DomainEvent::Message(Messages::LockedTransferR(transfer)));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old: BetStatus::LockedTransferSent,
            new: BetStatus::LockedTransferRSent,
        });

        if !self.config.auto_respond.bet_response {
            return self.freeze_round(&mut bet, "manual bet_response");
        }
        self.emit_bet_response(channel, bet)
    }

    fn on_bet_response(
        &mut self,
        channel: Channel,
        response: BetResponse,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let mut bet = self.current_bet(&channel, "BetResponse")?;
        if bet.acceptor_signature == response.signature
            && bet.status >= BetStatus::BetResponseReceived
        {
            return Ok(());
        }
        self.ensure_live(&bet)?;
        if bet.status != BetStatus::LockedTransferRSent {
            return Err(Error::WrongBetState {
                channel_id,
                round: bet.round,
                current: bet.status,
                operation: "accept a bet response",
            });
        }
        let violation = |reason| Error::ProtocolViolation {
            channel_id,
            round: bet.round,
            kind: "BetResponse",
            reason,
        };
        if bet.initiator != channel.local {
            return Err(violation("response sent in the wrong direction"));
        }
        if response.round != bet.round {
            return Err(violation("unexpected round number"));
        }
        if response.hash_ra != bet.hash_ra {
            return Err(violation("commitment echo mismatch"));
        }
        if response.initiator_signature != bet.initiator_signature {
            return Err(violation("commitment signature echo mismatch"));
        }
        bet.rb = Some(response.rb);
        bet.acceptor_signature = response.signature;
        bet.status = BetStatus::BetResponseReceived;
        bet.deadline_block = None;
        self.store.put_bet(bet.clone());
        self.emit(DomainEvent::Message(Messages::BetResponse(response)));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old: BetStatus::LockedTransferRSent,
            new: BetStatus::BetResponseReceived,
        });
        if let Some(wins) = bet.initiator_wins() {
            info!(
                "round {} on channel {} resolved off-chain: initiator {}",
                bet.round,
                channel_id,
                if wins { "wins" } else { "loses" }
            );
        }

        if !self.config.auto_respond.preimage {
            return self.freeze_round(&mut bet, "manual preimage");
        }
        self.emit_preimage_and_transfer(channel, bet)
    }

    fn on_preimage(
        &mut self,
        channel: Channel,
        preimage: Preimage,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let mut bet = self.current_bet(&channel, "Preimage")?;
        if bet.ra == Some(preimage.ra)
            && bet.status >= BetStatus::PreimageSent
        {
            return Ok(());
        }
        self.ensure_live(&bet)?;
        if bet.status != BetStatus::BetResponseReceived {
            return Err(Error::WrongBetState {
                channel_id,
                round: bet.round,
                current: bet.status,
                operation: "accept the preimage",
            });
        }
        let violation = |reason| Error::ProtocolViolation {
            channel_id,
            round: bet.round,
            kind: "Preimage",
            reason,
        };
        if bet.acceptor != channel.local {
            return Err(violation("preimage sent in the wrong direction"));
        }
        if preimage.round != bet.round {
            return Err(violation("unexpected round number"));
        }
        if preimage.ra.hash() != bet.hash_ra {
            return Err(violation("preimage does not match the commitment"));
        }
        bet.ra = Some(preimage.ra);
        bet.status = BetStatus::PreimageSent;
        self.store.put_bet(bet.clone());
        self.emit(DomainEvent::Message(Messages::Preimage(preimage)));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old: BetStatus::BetResponseReceived,
            new: BetStatus::PreimageSent,
        });
        Ok(())
    }

    fn on_direct_transfer(
        &mut self,
        mut channel: Channel,
        transfer: DirectTransfer,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let mut bet = self.current_bet(&channel, "DirectTransfer")?;
        if channel.remote_nonce == transfer.nonce
            && channel.latest_remote_proof
                == BalanceProof::from_direct_transfer(&transfer)
            && bet.status >= BetStatus::DirectTransferSent
        {
            return Ok(());
        }
        channel.accept_remote_nonce(transfer.nonce, "DirectTransfer")?;
        self.ensure_live(&bet)?;
        if bet.status != BetStatus::PreimageSent {
            return Err(Error::WrongBetState {
                channel_id,
                round: bet.round,
                current: bet.status,
                operation: "accept the outcome transfer",
            });
        }
        if bet.acceptor != channel.local {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: bet.round,
                kind: "DirectTransfer",
                reason: "outcome transfer sent in the wrong direction",
            });
        }
        if transfer.payment_contract != self.config.payment_contract {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: bet.round,
                kind: "DirectTransfer",
                reason: "unknown payment contract",
            });
        }
        let wins = match bet.initiator_wins() {
            Some(wins) => wins,
            None => {
                return Err(Error::ProtocolViolation {
                    channel_id,
                    round: bet.round,
                    kind: "DirectTransfer",
                    reason: "outcome transfer before the preimage",
                })
            }
        };
        let owed = if wins { TokenAmount::zero() } else { bet.value };
        let expected = channel
            .latest_remote_proof
            .transferred_amount
            .checked_add(owed)
            .ok_or(Error::BalanceConservationViolation {
                channel_id,
                round: bet.round,
            })?;
        if transfer.transferred_amount != expected {
            self.freeze_round(&mut bet, "outcome transfer amount mismatch")?;
            return Err(Error::BalanceConservationViolation {
                channel_id,
                round: bet.round,
            });
        }
        channel.settle_remote_lock(owed)?;
        channel.latest_remote_proof =
            BalanceProof::from_direct_transfer(&transfer);
        bet.status = BetStatus::DirectTransferSent;
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        self.emit(DomainEvent::Message(Messages::DirectTransfer(transfer)));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old: BetStatus::PreimageSent,
            new: BetStatus::DirectTransferSent,
        });

        if !self.config.auto_respond.direct_transfer_r {
            return self.freeze_round(&mut bet, "manual direct_transfer_r");
        }
        self.emit_direct_transfer(channel, bet, true)
    }

    fn on_direct_transfer_r(
        &mut self,
        mut channel: Channel,
        transfer: DirectTransfer,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let mut bet = self.current_bet(&channel, "DirectTransferR")?;
        if channel.remote_nonce == transfer.nonce
            && channel.latest_remote_proof
                == BalanceProof::from_direct_transfer(&transfer)
            && bet.status == BetStatus::Finish
        {
            return Ok(());
        }
        channel.accept_remote_nonce(transfer.nonce, "DirectTransferR")?;
        self.ensure_live(&bet)?;
        if bet.status != BetStatus::DirectTransferSent {
            return Err(Error::WrongBetState {
                channel_id,
                round: bet.round,
                current: bet.status,
                operation: "accept the closing transfer",
            });
        }
        if bet.initiator != channel.local {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: bet.round,
                kind: "DirectTransferR",
                reason: "closing transfer sent in the wrong direction",
            });
        }
        let wins = bet.initiator_wins().unwrap_or(false);
        let owed = if wins { bet.win_amount } else { TokenAmount::zero() };
        let expected = channel
            .latest_remote_proof
            .transferred_amount
            .checked_add(owed)
            .ok_or(Error::BalanceConservationViolation {
                channel_id,
                round: bet.round,
            })?;
        if transfer.transferred_amount != expected {
            self.freeze_round(&mut bet, "closing transfer amount mismatch")?;
            return Err(Error::BalanceConservationViolation {
                channel_id,
                round: bet.round,
            });
        }
        channel.settle_remote_lock(owed)?;
        channel.latest_remote_proof =
            BalanceProof::from_direct_transfer(&transfer);
        bet.status = BetStatus::Finish;
        bet.deadline_block = None;
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        self.emit(DomainEvent::Message(Messages::DirectTransferR(transfer)));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old: BetStatus::DirectTransferSent,
            new: BetStatus::Finish,
        });
        info!(
            "round {} on channel {} finished; balances {} / {}",
            bet.round, channel_id, channel.local_balance, channel.remote_balance
        );
        Ok(())
    }

    // Cooperative settle handlers
    // ---------------------------

    fn on_cooperative_settle_request(
        &mut self,
        mut channel: Channel,
        terms: CooperativeSettle,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        if channel.coop_remote.as_ref() == Some(&terms) {
            return Ok(());
        }
        if channel.status != ChannelStatus::Opened {
            return Err(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "accept a cooperative settle",
            });
        }
        if let Some(open) = self.open_bet(&channel) {
            return Err(Error::WrongBetState {
                channel_id,
                round: open.round,
                current: open.status,
                operation: "accept a cooperative settle",
            });
        }
        let ((p1, p1_balance), (p2, p2_balance)) = channel.ordered_balances();
        if terms.participant1 != p1
            || terms.participant2 != p2
            || terms.participant1_balance != p1_balance
            || terms.participant2_balance != p2_balance
        {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: channel.current_round,
                kind: "CooperativeSettleRequest",
                reason: "proposed balances do not match the local view",
            });
        }
        channel.coop_remote = Some(terms.clone());
        self.store.put_channel(channel.clone());
        self.emit(DomainEvent::Message(Messages::CooperativeSettleRequest(
            terms,
        )));

        if !self.config.auto_respond.cooperative_settle {
            debug!(
                "cooperative settle on channel {} awaits manual approval",
                channel_id
            );
            return Ok(());
        }
        self.accept_cooperative_settle(channel.remote)
    }

    fn on_cooperative_settle_response(
        &mut self,
        mut channel: Channel,
        terms: CooperativeSettle,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        if channel.coop_remote.as_ref() == Some(&terms) {
            return Ok(());
        }
        let local_terms =
            channel.coop_local.clone().ok_or(Error::WrongChannelState {
                channel_id,
                current: channel.status,
                operation: "accept a cooperative settle response",
            })?;
        if terms.digest() != local_terms.digest() {
            return Err(Error::ProtocolViolation {
                channel_id,
                round: channel.current_round,
                kind: "CooperativeSettleResponse",
                reason: "settlement terms differ from the proposal",
            });
        }
        channel.coop_remote = Some(terms.clone());
        self.store.put_channel(channel);
        self.emit(DomainEvent::Message(Messages::CooperativeSettleResponse(
            terms,
        )));
        let proof = ProofAssembler::new(&self.store)
            .cooperative_settle_proof(channel_id)?;
        self.emit(DomainEvent::CooperativeSettleReady(proof.clone()));
        let tx = self.chain.cooperative_settle(&proof)?;
        info!(
            "cooperative settle of channel {} submitted: {:?}",
            channel_id, tx
        );
        Ok(())
    }

    // Auto-response emission
    // ----------------------

    /// Stakes the round value under its lock and emits the corresponding
    /// locked transfer (`reverse` selects the initiator direction).
    fn emit_locked_transfer(
        &mut self,
        mut channel: Channel,
        mut bet: Bet,
        reverse: bool,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let nonce = channel.next_local_nonce();
        let mut transfer = LockedTransfer {
            channel_id,
            payment_contract: self.config.payment_contract,
            nonce,
            transferred_amount: channel
                .latest_local_proof
                .transferred_amount,
            locked_amount: bet.value,
            lock_id: bet.hash_ra,
            signature: Default::default(),
        };
        transfer.sign(&self.signer);
        channel.lock_local(bet.value)?;
        channel.local_nonce = nonce;
        channel.latest_local_proof =
            BalanceProof::from_locked_transfer(&transfer);
        let old = bet.status;
        bet.locked_transfer_local = Some(transfer.clone());
        bet.status = if reverse {
            BetStatus::LockedTransferRSent
        } else {
            BetStatus::LockedTransferSent
        };
        bet.deadline_block = Some(self.response_deadline());
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        let message = if reverse {
            Messages::LockedTransferR(transfer)
        } else {
            Messages::LockedTransfer(transfer)
        };
        self.transport.send(channel.remote, &message);
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old,
            new: bet.status,
        });
        Ok(())
    }

    /// Acceptor side: reveals `Rb` and commits to the round.
    fn emit_bet_response(
        &mut self,
        channel: Channel,
        mut bet: Bet,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let rb = expand_seed(b"");
        let mut response = BetResponse {
            channel_id,
            round: bet.round,
            game_contract: self.config.game_contract,
            hash_ra: bet.hash_ra,
            rb,
            initiator_signature: bet.initiator_signature,
            signature: Default::default(),
        };
        response.sign(&self.signer);
        let old = bet.status;
        bet.rb = Some(rb);
        bet.acceptor_signature = response.signature;
        bet.status = BetStatus::BetResponseReceived;
        bet.deadline_block = Some(self.response_deadline());
        self.store.put_bet(bet.clone());
        self.transport
            .send(channel.remote, &Messages::BetResponse(response));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old,
            new: BetStatus::BetResponseReceived,
        });
        Ok(())
    }

    /// Initiator side: reveals the preimage and, if allowed, follows with
    /// the outcome transfer.
    fn emit_preimage_and_transfer(
        &mut self,
        channel: Channel,
        mut bet: Bet,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let ra = bet.ra.ok_or(Error::WrongBetState {
            channel_id,
            round: bet.round,
            current: bet.status,
            operation: "reveal the preimage",
        })?;
        let mut preimage = Preimage {
            channel_id,
            round: bet.round,
            ra,
            signature: Default::default(),
        };
        preimage.sign(&self.signer);
        let old = bet.status;
        bet.status = BetStatus::PreimageSent;
        self.store.put_bet(bet.clone());
        self.transport
            .send(channel.remote, &Messages::Preimage(preimage));
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old,
            new: BetStatus::PreimageSent,
        });

        if !self.config.auto_respond.direct_transfer {
            return self.freeze_round(&mut bet, "manual direct_transfer");
        }
        self.emit_direct_transfer(channel, bet, false)
    }

    /// Converts the local lock into the round outcome. `closing` marks the
    /// acceptor's final transfer, which completes the round.
    fn emit_direct_transfer(
        &mut self,
        mut channel: Channel,
        mut bet: Bet,
        closing: bool,
    ) -> Result<(), Error> {
        let channel_id = channel.channel_id;
        let wins = bet.initiator_wins().ok_or(Error::WrongBetState {
            channel_id,
            round: bet.round,
            current: bet.status,
            operation: "settle the round outcome",
        })?;
        // the loser's transfer carries the outcome; the winner's releases
        // its lock unchanged
        let owed = match (closing, wins) {
            (false, false) => bet.value,
            (true, true) => bet.win_amount,
            _ => TokenAmount::zero(),
        };
        let nonce = channel.next_local_nonce();
        let transferred = channel
            .latest_local_proof
            .transferred_amount
            .checked_add(owed)
            .ok_or(Error::BalanceConservationViolation {
                channel_id,
                round: bet.round,
            })?;
        let mut transfer = DirectTransfer {
            channel_id,
            payment_contract: self.config.payment_contract,
            nonce,
            transferred_amount: transferred,
            signature: Default::default(),
        };
        transfer.sign(&self.signer);
        channel.settle_local_lock(owed)?;
        channel.local_nonce = nonce;
        channel.latest_local_proof =
            BalanceProof::from_direct_transfer(&transfer);
        let old = bet.status;
        bet.status = if closing {
            BetStatus::Finish
        } else {
            BetStatus::DirectTransferSent
        };
        bet.deadline_block =
            if closing { None } else { Some(self.response_deadline()) };
        self.store.put_bet(bet.clone());
        self.store.put_channel(channel.clone());
        let message = if closing {
            Messages::DirectTransferR(transfer)
        } else {
            Messages::DirectTransfer(transfer)
        };
        self.transport.send(channel.remote, &message);
        self.emit(DomainEvent::BetStatus {
            channel_id,
            round: bet.round,
            old,
            new: bet.status,
        });
        Ok(())
    }

    // Shared helpers
    // --------------

    fn emit(&mut self, event: DomainEvent) { self.events.emit(&event); }

    fn response_deadline(&self) -> u64 {
        self.current_block + self.config.response_deadline()
    }

    fn channel(&self, channel_id: ChannelId) -> Result<Channel, Error> {
        self.store
            .get_channel(channel_id)
            .ok_or(Error::UnknownChannel(channel_id))
    }

    fn channel_by_partner(
        &mut self,
        partner: Address,
    ) -> Result<Channel, Error> {
        if let Some(&channel_id) = self.channel_ids.get(&partner) {
            return self.channel(channel_id);
        }
        if let Some(channel) = self.store.channel_with_partner(partner) {
            self.channel_ids.insert(partner, channel.channel_id);
            return Ok(channel);
        }
        match self.chain.get_channel_identifier(partner) {
            Ok(channel_id) if !channel_id.is_null() => {
                self.channel_ids.insert(partner, channel_id);
                self.channel(channel_id)
            }
            _ => Err(Error::NoChannelWithPartner(partner)),
        }
    }

    fn open_bet(&self, channel: &Channel) -> Option<Bet> {
        if channel.current_round == 0 {
            return None;
        }
        self.store
            .get_bet(channel.channel_id, channel.current_round)
            .filter(Bet::is_open)
    }

    /// The round an in-flight message must belong to.
    fn current_bet(
        &self,
        channel: &Channel,
        kind: &'static str,
    ) -> Result<Bet, Error> {
        self.store
            .get_bet(channel.channel_id, channel.current_round)
            .ok_or_else(|| {
                debug!(
                    "{} for channel {} arrived with no round open",
                    kind, channel.channel_id
                );
                Error::UnknownBet {
                    channel_id: channel.channel_id,
                    round: channel.current_round,
                }
            })
    }

    /// A frozen round only resolves on-chain; every further peer message
    /// for it is rejected.
    fn ensure_live(&self, bet: &Bet) -> Result<(), Error> {
        if bet.frozen {
            return Err(Error::Timeout {
                channel_id: bet.channel_id,
                round: bet.round,
            });
        }
        Ok(())
    }

    fn freeze_round(
        &mut self,
        bet: &mut Bet,
        reason: &'static str,
    ) -> Result<(), Error> {
        bet.frozen = true;
        bet.deadline_block = None;
        self.store.put_bet(bet.clone());
        warn!(
            "round {} on channel {} frozen: {}",
            bet.round, bet.channel_id, reason
        );
        self.emit(DomainEvent::RoundFrozen {
            channel_id: bet.channel_id,
            round: bet.round,
        });
        Ok(())
    }

    fn validate_lock(
        &self,
        channel: &Channel,
        bet: &Bet,
        transfer: &LockedTransfer,
        kind: &'static str,
    ) -> Result<(), Error> {
        let violation = |reason| Error::ProtocolViolation {
            channel_id: channel.channel_id,
            round: bet.round,
            kind,
            reason,
        };
        if transfer.payment_contract != self.config.payment_contract {
            return Err(violation("unknown payment contract"));
        }
        if transfer.lock_id != bet.hash_ra {
            return Err(violation("lock id does not match the commitment"));
        }
        if transfer.locked_amount != bet.value {
            return Err(Error::BalanceConservationViolation {
                channel_id: channel.channel_id,
                round: bet.round,
            });
        }
        if transfer.transferred_amount
            != channel.latest_remote_proof.transferred_amount
        {
            return Err(Error::BalanceConservationViolation {
                channel_id: channel.channel_id,
                round: bet.round,
            });
        }
        Ok(())
    }
}
