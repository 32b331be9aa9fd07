//! Withdrawal payouts: chain client, single-flight serializer and the payout
//! job service.

pub mod chain;
pub mod serializer;
pub mod service;

pub use chain::{ChainClient, DryRunChainClient, PayoutReceipt};
pub use serializer::PayoutSerializer;
pub use service::{PayoutOutcome, PayoutService};
