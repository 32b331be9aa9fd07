//! Withdrawal requests domain module.
//!
//! A request reserves part of the Main purse until the payout job settles it.
//! Status moves from `Pending` to `Processed` or `Failed` exactly once.

pub mod address;
pub mod request;
pub mod schedule;

pub use address::PayoutAddress;
pub use request::{WithdrawalRequest, WithdrawalStatus};
pub use schedule::ResolveSchedule;
