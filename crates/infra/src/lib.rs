//! Settlement infrastructure: storage, the purse ledger, growth and unlock
//! engines, payouts and the background job system.

pub mod clock;
pub mod config;
pub mod error;
pub mod growth;
pub mod handlers;
pub mod jobs;
pub mod ledger_store;
pub mod payout;
pub mod services;
pub mod store;
pub mod transfer;
pub mod unlock;


pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SettlementConfig;
pub use error::{ChainError, SettlementError, SettlementResult, StoreError, StoreResult};
pub use growth::{GrowthEngine, GrowthRunReport, GrowthStep};
pub use handlers::register_settlement_handlers;
pub use ledger_store::{CasSnapshot, PurseLedger};
pub use payout::{ChainClient, DryRunChainClient, PayoutOutcome, PayoutSerializer, PayoutService};
pub use services::{InvestOutcome, SettlementService};
pub use store::{InMemorySettlementStore, PgSettlementStore, PurseKey, SettlementStore, StoreTx};
pub use transfer::{TransferCoordinator, TransferReceipt};
pub use unlock::{UnlockEngine, UnlockReport};
