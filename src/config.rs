use clap::Args;
use std::time::Duration;

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Dispatch attempts per leg before it is marked stuck.
    pub max_attempts: u32,
    /// How long one dispatch waits for the participant's acknowledgment.
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Age after which an unfinished transaction is forced into a decision.
    pub tx_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a DONE transaction stays in the operator view before it is
    /// evicted.
    pub done_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            ack_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            tx_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            done_retention: Duration::from_secs(300),
        }
    }
}

impl CoordinatorConfig {
    /// Delay before the attempt following `attempt` (1-based), doubling from
    /// `backoff_base` and capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |delay| delay.min(self.backoff_max))
    }
}

/// Command line and environment surface of [`CoordinatorConfig`].
#[derive(Debug, Clone, Args)]
pub struct CoordinatorArgs {
    /// Dispatch attempts per participant leg before it is marked stuck
    #[arg(long, env = "SAGA_TCC_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Milliseconds to wait for a participant acknowledgment
    #[arg(long, env = "SAGA_TCC_ACK_TIMEOUT_MS", default_value_t = 5_000)]
    pub ack_timeout_ms: u64,

    /// First retry delay in milliseconds
    #[arg(long, env = "SAGA_TCC_BACKOFF_BASE_MS", default_value_t = 200)]
    pub backoff_base_ms: u64,

    /// Upper bound of the retry delay in milliseconds
    #[arg(long, env = "SAGA_TCC_BACKOFF_MAX_MS", default_value_t = 5_000)]
    pub backoff_max_ms: u64,

    /// Seconds after which an unfinished global transaction is cancelled
    #[arg(long, env = "SAGA_TCC_TX_TIMEOUT_SECS", default_value_t = 60)]
    pub tx_timeout_secs: u64,

    /// Seconds between recovery sweeps
    #[arg(long, env = "SAGA_TCC_SWEEP_INTERVAL_SECS", default_value_t = 10)]
    pub sweep_interval_secs: u64,

    /// Seconds a finished global transaction stays in the operator view
    #[arg(long, env = "SAGA_TCC_DONE_RETENTION_SECS", default_value_t = 300)]
    pub done_retention_secs: u64,
}

impl From<&CoordinatorArgs> for CoordinatorConfig {
    fn from(args: &CoordinatorArgs) -> Self {
        Self {
            max_attempts: args.max_attempts.max(1),
            ack_timeout: Duration::from_millis(args.ack_timeout_ms),
            backoff_base: Duration::from_millis(args.backoff_base_ms),
            backoff_max: Duration::from_millis(args.backoff_max_ms),
            tx_timeout: Duration::from_secs(args.tx_timeout_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            done_retention: Duration::from_secs(args.done_retention_secs),
        }
    }
}
