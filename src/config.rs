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

use ethereum_types::Address;
use serde::{Deserialize, Serialize};

/// Blocks between an on-chain close and settle finalisation, unless
/// configured otherwise.
pub const DEFAULT_SETTLE_WINDOW: u64 = 6;

/// Chain events are only consumed this many blocks behind the tip; reorgs
/// shallower than this are invisible to the client.
pub const DEFAULT_CONFIRMATION_DEPTH: u64 = 6;

/// Configuration rejected at client construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ConfigError {
    /// configured participant address {configured} does not match the
    /// signing key address {derived}
    AddressKeyMismatch {
        configured: Address,
        derived: Address,
    },

    /// settle window must be at least 2 blocks, got {0}
    SettleWindowTooShort(u64),

    /// auto-respond for {later} is enabled while {earlier} is manual; the
    /// round always freezes at {earlier}, so {later} could never fire
    UnreachableAutoRespond {
        earlier: &'static str,
        later: &'static str,
    },
}

/// The seven auto-reply switches, one per message kind the engine can send
/// on its own. A switch set to `false` makes that step manual: the engine
/// accepts and persists the triggering message but sends no reply, freezing
/// the round at that point (the caller is notified and may close on-chain).
///
/// Defaults are all `true`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRespond {
    /// Answer an accepted `BetRequest` with the staking `LockedTransfer`.
    pub locked_transfer: bool,

    /// Answer the acceptor's lock with the initiator's `LockedTransferR`.
    pub locked_transfer_r: bool,

    /// Answer the initiator's lock with the `BetResponse`.
    pub bet_response: bool,

    /// Reveal the preimage once the `BetResponse` arrives.
    pub preimage: bool,

    /// Follow the preimage with the outcome `DirectTransfer`.
    pub direct_transfer: bool,

    /// Answer the initiator's outcome transfer with `DirectTransferR`.
    pub direct_transfer_r: bool,

    /// Counter-sign an acceptable `CooperativeSettleRequest`.
    pub cooperative_settle: bool,
}

impl Default for AutoRespond {
    fn default() -> AutoRespond {
        AutoRespond {
            locked_transfer: true,
            locked_transfer_r: true,
            bet_response: true,
            preimage: true,
            direct_transfer: true,
            direct_transfer_r: true,
            cooperative_settle: true,
        }
    }
}

impl AutoRespond {
    /// Manual mode: every switch off.
    pub fn manual() -> AutoRespond {
        AutoRespond {
            locked_transfer: false,
            locked_transfer_r: false,
            bet_response: false,
            preimage: false,
            direct_transfer: false,
            direct_transfer_r: false,
            cooperative_settle: false,
        }
    }

    /// The bet-round switches in protocol order. `cooperative_settle` is
    /// independent of the round ladder and not part of the sequence.
    fn ladder(&self) -> [(&'static str, bool); 6] {
        [
            ("locked_transfer", self.locked_transfer),
            ("locked_transfer_r", self.locked_transfer_r),
            ("bet_response", self.bet_response),
            ("preimage", self.preimage),
            ("direct_transfer", self.direct_transfer),
            ("direct_transfer_r", self.direct_transfer_r),
        ]
    }

    /// Rejects combinations where an automatic step follows a manual one:
    /// the round necessarily freezes at the first manual step, so a later
    /// automatic switch could never take effect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ladder = self.ladder();
        let mut first_manual = None;
        for (name, enabled) in ladder {
            match (first_manual, enabled) {
                (None, false) => first_manual = Some(name),
                (Some(earlier), true) => {
                    return Err(ConfigError::UnreachableAutoRespond {
                        earlier,
                        later: name,
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Client configuration.
///
/// The signing key is deliberately not part of this record: it is passed to
/// the client separately and held exclusively by the signer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The payment contract governing all channels of this client.
    pub payment_contract: Address,

    /// The game contract resolving disputed rounds.
    pub game_contract: Address,

    /// The local participant address; must match the signing key.
    pub address: Address,

    #[serde(default = "default_settle_window")]
    pub settle_window: u64,

    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    #[serde(default)]
    pub auto_respond: AutoRespond,
}

fn default_settle_window() -> u64 { DEFAULT_SETTLE_WINDOW }

fn default_confirmation_depth() -> u64 { DEFAULT_CONFIRMATION_DEPTH }

impl Config {
    pub fn with(
        payment_contract: Address,
        game_contract: Address,
        address: Address,
    ) -> Config {
        Config {
            payment_contract,
            game_contract,
            address,
            settle_window: DEFAULT_SETTLE_WINDOW,
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            auto_respond: AutoRespond::default(),
        }
    }

    /// Deadline for peer responses, in blocks.
    pub fn response_deadline(&self) -> u64 { (self.settle_window / 2).max(1) }

    pub fn validate(&self, signer_address: Address) -> Result<(), ConfigError> {
        if self.address != signer_address {
            return Err(ConfigError::AddressKeyMismatch {
                configured: self.address,
                derived: signer_address,
            });
        }
        if self.settle_window < 2 {
            return Err(ConfigError::SettleWindowTooShort(self.settle_window));
        }
        self.auto_respond.validate()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_full_auto() {
        let auto = AutoRespond::default();
        assert!(auto.validate().is_ok());
        assert!(auto.locked_transfer && auto.direct_transfer_r);
        assert!(AutoRespond::manual().validate().is_ok());
    }

    #[test]
    fn manual_prefix_is_consistent() {
        // turning off a suffix of the ladder is fine
        let auto = AutoRespond {
            direct_transfer: false,
            direct_transfer_r: false,
            ..AutoRespond::default()
        };
        assert!(auto.validate().is_ok());
    }

    #[test]
    fn auto_step_after_manual_step_is_rejected() {
        let auto = AutoRespond {
            locked_transfer_r: false,
            ..AutoRespond::default()
        };
        assert_eq!(
            auto.validate(),
            Err(ConfigError::UnreachableAutoRespond {
                earlier: "locked_transfer_r",
                later: "bet_response",
            })
        );
    }

    #[test]
    fn cooperative_settle_switch_is_independent() {
        let auto = AutoRespond {
            cooperative_settle: false,
            ..AutoRespond::default()
        };
        assert!(auto.validate().is_ok());
    }

    #[test]
    fn config_validates_signer_binding() {
        let config = Config::with(
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0xaa),
        );
        assert!(config.validate(Address::repeat_byte(0xaa)).is_ok());
        assert!(matches!(
            config.validate(Address::repeat_byte(0xbb)),
            Err(ConfigError::AddressKeyMismatch { .. })
        ));
    }

    #[test]
    fn default_deadline_is_half_the_settle_window() {
        let config = Config::with(
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0xaa),
        );
        assert_eq!(config.settle_window, 6);
        assert_eq!(config.response_deadline(), 3);
    }
}
