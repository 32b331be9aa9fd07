//! `vaultledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    BasketId, EntryId, GrowthEarningId, GrowthJobId, InvestmentId, PurseId, ReferralBonusId,
    UserId, WithdrawalId,
};
pub use money::{ensure_positive, round_money};
