//! Command-line and environment configuration for the settlement worker.

use std::time::Duration;

use clap::Parser;
use vaultledger_infra::SettlementConfig;
use vaultledger_observability::LogFormat;

/// Background settlement worker: growth distribution, bonus unlocks and
/// withdrawal payouts.
#[derive(Parser, Debug, Clone)]
#[command(name = "vaultledger-worker")]
#[command(about = "Runs the settlement jobs of a vaultledger deployment")]
pub struct Args {
    /// Postgres connection string. Without it the worker runs on an
    /// in-memory store that is lost on exit.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "10")]
    pub max_connections: u32,

    /// Apply the schema on startup
    #[arg(long, env = "INIT_SCHEMA", default_value = "false")]
    pub init_schema: bool,

    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// How long the executor waits when no job is ready
    #[arg(long, env = "JOB_POLL_INTERVAL_MS", default_value = "500")]
    pub poll_interval_ms: u64,

    /// Interval between referral bonus unlock passes
    #[arg(long, env = "UNLOCK_INTERVAL_SECS", default_value = "86400")]
    pub unlock_interval_secs: u64,

    /// Investments settled per growth page transaction
    #[arg(long, env = "GROWTH_PAGE_SIZE", default_value = "1")]
    pub growth_page_size: usize,

    /// Day of month the growth reporting window opens
    #[arg(long, env = "GROWTH_START_DAY", default_value = "1")]
    pub growth_start_day: u32,

    /// Users settled per unlock page transaction
    #[arg(long, env = "UNLOCK_PAGE_SIZE", default_value = "25")]
    pub unlock_page_size: usize,

    /// Daily withdrawal batch time, HH:MM UTC
    #[arg(long, env = "WITHDRAWAL_RESOLVE_TIME", default_value = "01:00")]
    pub resolve_time: String,

    /// Requests this close to the batch roll over to the next day
    #[arg(long, env = "WITHDRAWAL_BATCH_CEASE_BEFORE_HOURS", default_value = "12")]
    pub batch_cease_before_hours: i64,

    #[arg(long, env = "PAYOUT_JOB_ATTEMPTS", default_value = "3")]
    pub payout_attempts: u32,

    #[arg(long, env = "GROWTH_JOB_ATTEMPTS", default_value = "10")]
    pub growth_attempts: u32,
}

impl Args {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn unlock_interval(&self) -> Duration {
        Duration::from_secs(self.unlock_interval_secs.max(1))
    }

    /// Settlement settings with the flags applied over the defaults.
    pub fn settlement_config(&self) -> SettlementConfig {
        let mut config = SettlementConfig::default();
        config.growth.page_size = self.growth_page_size.max(1);
        config.growth.start_day = self.growth_start_day;
        config.growth.job_attempts = self.growth_attempts;
        config.referral.unlock_page_size = self.unlock_page_size.max(1);
        config.withdrawal.resolve_time = self.resolve_time.clone();
        config.withdrawal.batch_cease_before_hours = self.batch_cease_before_hours;
        config.payout.job_attempts = self.payout_attempts;
        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=28).contains(&self.growth_start_day) {
            return Err(format!(
                "growth start day must be between 1 and 28, got {}",
                self.growth_start_day
            ));
        }
        if self.payout_attempts == 0 || self.growth_attempts == 0 {
            return Err("job attempts must be at least 1".to_string());
        }
        self.settlement_config()
            .resolve_schedule()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}
