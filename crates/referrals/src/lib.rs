//! Referral domain module.
//!
//! The referral tree is stored as a materialized path per user; bonuses earned
//! through it mature after a waiting period and are released by the unlock
//! engine in `vaultledger-infra`.

pub mod bonus;
pub mod tree;

pub use bonus::{BonusPolicy, ReferralBonus, ReferralBonusKind};
pub use tree::{UplineLabel, UplinePath, UserAccount};
