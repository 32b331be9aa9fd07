//! Investments domain module.
//!
//! Baskets, investment positions and the monthly growth computation. Pure,
//! deterministic logic: the growth engine in `vaultledger-infra` pages through
//! investments and persists what these types compute.

pub mod basket;
pub mod growth;
pub mod investment;

pub use basket::Basket;
pub use growth::{
    GrowthEarning, GrowthJob, GrowthJobStatus, GrowthWindow, compute_earning,
    ensure_past_month,
};
pub use investment::{Investment, InvestmentStatus, SUPPORTED_TENURES};
