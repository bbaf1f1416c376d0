//! Command-line and environment configuration.

use crate::application::runtime::SettlementConfig;
use chrono::FixedOffset;
use clap::Args;
use std::time::Duration;

/// Engine tunables; every flag can also come from the environment.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Minutes a checkout waits for payment before it expires.
    #[arg(long, env = "SETTLEMENT_TRANSACTION_TTL_MINUTES", default_value_t = 30)]
    pub transaction_ttl_minutes: u64,

    /// Per-call deadline for gateway requests, in milliseconds.
    #[arg(long, env = "SETTLEMENT_GATEWAY_TIMEOUT_MS", default_value_t = 5_000)]
    pub gateway_timeout_ms: u64,

    /// Seconds the circuit breaker stays open before probing the gateway.
    #[arg(long, env = "SETTLEMENT_BREAKER_OPEN_SECS", default_value_t = 10)]
    pub breaker_open_secs: u64,

    #[arg(long, env = "SETTLEMENT_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    /// First retry backoff in milliseconds; doubles on every attempt.
    #[arg(long, env = "SETTLEMENT_RETRY_BASE_MS", default_value_t = 2_000)]
    pub retry_base_ms: u64,

    #[arg(long, env = "SETTLEMENT_SCHEDULER_INTERVAL_SECS", default_value_t = 300)]
    pub scheduler_interval_secs: u64,

    #[arg(long, env = "SETTLEMENT_SCHEDULER_BUDGET_SECS", default_value_t = 240)]
    pub scheduler_budget_secs: u64,

    /// Run the periodic reconciliation scheduler.
    #[arg(
        long,
        env = "SETTLEMENT_SCHEDULER_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub scheduler_enabled: bool,

    /// Minutes after expiry in which a settlement is still honored.
    #[arg(long, env = "SETTLEMENT_GRACE_MINUTES", default_value_t = 5)]
    pub grace_minutes: u64,

    /// UTC offset of gateway-local timestamps, e.g. `+07:00`.
    #[arg(
        long,
        env = "SETTLEMENT_GATEWAY_OFFSET",
        default_value = "+07:00",
        value_parser = parse_offset
    )]
    pub gateway_offset: FixedOffset,
}

impl EngineArgs {
    pub fn settlement_config(&self) -> SettlementConfig {
        let mut config = SettlementConfig {
            transaction_ttl: Duration::from_secs(self.transaction_ttl_minutes * 60),
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
            ..SettlementConfig::default()
        };
        config.breaker.open_timeout = Duration::from_secs(self.breaker_open_secs);
        config.retry.max_attempts = self.retry_attempts;
        config.retry.base_delay = Duration::from_millis(self.retry_base_ms);
        config.scheduler.interval = Duration::from_secs(self.scheduler_interval_secs);
        config.scheduler.budget = Duration::from_secs(self.scheduler_budget_secs);
        config.scheduler.enabled = self.scheduler_enabled;
        config.reconcile.grace_period = Duration::from_secs(self.grace_minutes * 60);
        config.reconcile.gateway_offset = self.gateway_offset;
        config
    }
}

/// Payment gateway and photo service endpoints.
#[derive(Debug, Clone, Args)]
pub struct GatewayArgs {
    #[arg(long, env = "SNAP_URL", default_value = "https://app.sandbox.midtrans.com")]
    pub snap_url: String,

    #[arg(long, env = "GATEWAY_API_URL", default_value = "https://api.sandbox.midtrans.com")]
    pub api_url: String,

    /// Server key for the real gateway. Without it the built-in sandbox gateway is used.
    #[arg(long, env = "GATEWAY_SERVER_KEY", hide_env_values = true)]
    pub server_key: Option<String>,

    /// Server key the sandbox gateway signs with.
    #[arg(long, env = "SANDBOX_SERVER_KEY", default_value = "sandbox-server-key")]
    pub sandbox_key: String,

    #[arg(long, env = "GATEWAY_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Remote photo pricing service. Without it photos are priced from `--catalog`.
    #[arg(long, env = "PHOTO_SERVICE_URL")]
    pub photo_service_url: Option<String>,
}

impl GatewayArgs {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Parses `+HH:MM`, `-HH:MM` or a bare hour count like `7`.
fn parse_offset(raw: &str) -> Result<FixedOffset, String> {
    let raw = raw.trim();
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'-') => (-1, &raw[1..]),
        Some(b'+') => (1, &raw[1..]),
        _ => (1, raw),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((hours, minutes)) => (hours, minutes),
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("invalid offset hours in '{raw}'"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("invalid offset minutes in '{raw}'"))?;
    if !(0..60).contains(&minutes) {
        return Err(format!("invalid offset minutes in '{raw}'"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset '{raw}' out of range"))
}
