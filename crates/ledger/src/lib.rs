//! Purse ledger (per-user segregated balances, versioned).
//!
//! Pure domain logic only: no IO, no persistence concerns. Storage adapters
//! run the `Purse` aggregate and persist the `LedgerEntry` values it emits.

pub mod entry;
pub mod purse;

pub use entry::{Direction, EntryContext, LedgerEntry, replay_balance};
pub use purse::{Posting, Purse, PurseCommand, PurseKind};
