//! Outbound chain client boundary.

use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use vaultledger_withdrawals::PayoutAddress;

use crate::error::ChainError;

/// What the chain returned for an executed payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub tx_hash: Option<String>,
}

#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn payout(&self, address: &PayoutAddress, amount: Decimal) -> Result<PayoutReceipt, ChainError>;
}

/// Logs payouts instead of sending them and returns a synthetic hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunChainClient;

#[async_trait::async_trait]
impl ChainClient for DryRunChainClient {
    async fn payout(&self, address: &PayoutAddress, amount: Decimal) -> Result<PayoutReceipt, ChainError> {
        let tx_hash = format!("0x{}", Uuid::now_v7().simple());
        info!(%address, %amount, %tx_hash, "dry-run payout");
        Ok(PayoutReceipt {
            tx_hash: Some(tx_hash),
        })
    }
}
