//! # Core Configuration & Constants
//!
//! Every tunable of the financial core lives here: the compile-time
//! constants that define how money behaves, and the [`Settings`] struct
//! resolved from the environment at startup.
//!
//! The constants are deliberate defaults, not suggestions. Changing the
//! token price or the refund window on a live deployment changes the
//! meaning of money already in the system, so the operator-facing knobs
//! are validated and logged at startup rather than read lazily.

use std::time::Duration;

use uuid::Uuid;

// ---------------------------------------------------------------------------
// Token Economics
// ---------------------------------------------------------------------------

/// Price of one token in payment-processor minor units (cents).
///
/// 1 token == 1 US cent by default. The conversion between tokens and
/// cents is always a single integer multiply/divide — no floats, ever.
pub const DEFAULT_TOKEN_PRICE_CENTS: u64 = 1;

/// Per-user, per-UTC-day deposit ceiling in tokens.
pub const DEFAULT_DAILY_DEPOSIT_CAP_TOKENS: u64 = 100_000;

/// Maximum age of a deposit lot that is still eligible for an external
/// refund. Older lots stay spendable but can no longer leave as card
/// refunds — the processor would reject them anyway.
pub const DEFAULT_REFUND_WINDOW_DAYS: i64 = 90;

/// Hard ceiling on any single wallet operation, in tokens.
///
/// Well below `i64::MAX` so that signed ledger arithmetic can never
/// overflow even after summing a full history.
pub const MAX_OPERATION_TOKENS: u64 = 1_000_000_000_000;

/// ISO-4217 currency code recorded on every ledger entry.
pub const DEFAULT_CURRENCY: &str = "USD";

// ---------------------------------------------------------------------------
// Timeouts & Tolerances
// ---------------------------------------------------------------------------

/// How long a wallet mutation waits for the per-user advisory lock before
/// giving up with `WalletBusy`. Callers are expected to back off and retry.
pub const WALLET_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Timeout applied to every outbound payment-processor call.
pub const PROCESSOR_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outer timeout for a background settlement job. On expiry the job is
/// re-enqueued; settlement idempotency makes the retry safe.
pub const SETTLEMENT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted skew between a webhook's signed timestamp and our
/// wall clock. Events outside this window are treated as replays.
pub const WEBHOOK_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(300);

/// Delay before a failed settlement job is retried.
pub const SETTLEMENT_RETRY_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Reserved Identities
// ---------------------------------------------------------------------------

/// The platform treasury. Forfeited stakes are credited to this sentinel
/// identity; it is not a real user and never appears in user-facing totals.
pub const PLATFORM_USER_ID: Uuid = Uuid::nil();

// ---------------------------------------------------------------------------
// Withdraw Mode
// ---------------------------------------------------------------------------

/// Global withdrawal feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawMode {
    /// Withdrawals execute as FIFO refunds against the payment processor.
    Refund,
    /// Withdrawals are rejected with `Disabled`. Deposits and stakes
    /// continue to work.
    Disabled,
}

impl WithdrawMode {
    /// Parses a mode string. Accepts `"refund"` or `"disabled"`.
    pub fn parse(s: &str) -> Result<Self, SettingsError> {
        match s.to_ascii_lowercase().as_str() {
            "refund" => Ok(WithdrawMode::Refund),
            "disabled" => Ok(WithdrawMode::Disabled),
            other => Err(SettingsError::InvalidValue {
                key: "CHALLY_WITHDRAW_MODE",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Errors produced while resolving [`Settings`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// An environment variable was present but could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// The offending environment variable.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
}

/// Runtime configuration for the financial core.
///
/// Resolved once at startup via [`Settings::from_env`] and shared
/// immutably afterwards. Unset variables fall back to the documented
/// defaults; malformed values fail fast instead of silently defaulting,
/// because a typo in a money knob should stop the boot, not ship.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Minor units (cents) per token.
    pub token_price_cents: u64,
    /// Per-user per-UTC-day deposit ceiling in tokens.
    pub daily_deposit_cap_tokens: u64,
    /// Refund eligibility window for deposit lots, in days.
    pub refund_window_days: i64,
    /// Global withdrawal feature flag.
    pub withdraw_mode: WithdrawMode,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Secret API key for the payment processor.
    pub processor_api_key: String,
    /// The treasury identity that receives forfeited stakes.
    pub platform_user_id: Uuid,
    /// Currency code stamped on ledger entries.
    pub currency: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token_price_cents: DEFAULT_TOKEN_PRICE_CENTS,
            daily_deposit_cap_tokens: DEFAULT_DAILY_DEPOSIT_CAP_TOKENS,
            refund_window_days: DEFAULT_REFUND_WINDOW_DAYS,
            withdraw_mode: WithdrawMode::Refund,
            webhook_secret: String::new(),
            processor_api_key: String::new(),
            platform_user_id: PLATFORM_USER_ID,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

impl Settings {
    /// Resolves settings from `CHALLY_*` environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CHALLY_TOKEN_PRICE_CENTS` | 1 |
    /// | `CHALLY_DAILY_DEPOSIT_CAP` | 100000 |
    /// | `CHALLY_REFUND_WINDOW_DAYS` | 90 |
    /// | `CHALLY_WITHDRAW_MODE` | `refund` |
    /// | `CHALLY_WEBHOOK_SECRET` | empty (webhooks rejected) |
    /// | `CHALLY_PROCESSOR_API_KEY` | empty |
    /// | `CHALLY_PLATFORM_USER_ID` | all-zero UUID |
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] for any variable that is
    /// present but unparseable.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Settings::default();

        if let Ok(raw) = std::env::var("CHALLY_TOKEN_PRICE_CENTS") {
            settings.token_price_cents = parse_positive(&raw, "CHALLY_TOKEN_PRICE_CENTS")?;
        }
        if let Ok(raw) = std::env::var("CHALLY_DAILY_DEPOSIT_CAP") {
            settings.daily_deposit_cap_tokens = parse_positive(&raw, "CHALLY_DAILY_DEPOSIT_CAP")?;
        }
        if let Ok(raw) = std::env::var("CHALLY_REFUND_WINDOW_DAYS") {
            settings.refund_window_days =
                raw.parse::<i64>()
                    .ok()
                    .filter(|d| *d > 0)
                    .ok_or(SettingsError::InvalidValue {
                        key: "CHALLY_REFUND_WINDOW_DAYS",
                        value: raw,
                    })?;
        }
        if let Ok(raw) = std::env::var("CHALLY_WITHDRAW_MODE") {
            settings.withdraw_mode = WithdrawMode::parse(&raw)?;
        }
        if let Ok(raw) = std::env::var("CHALLY_WEBHOOK_SECRET") {
            settings.webhook_secret = raw;
        }
        if let Ok(raw) = std::env::var("CHALLY_PROCESSOR_API_KEY") {
            settings.processor_api_key = raw;
        }
        if let Ok(raw) = std::env::var("CHALLY_PLATFORM_USER_ID") {
            settings.platform_user_id =
                Uuid::parse_str(&raw).map_err(|_| SettingsError::InvalidValue {
                    key: "CHALLY_PLATFORM_USER_ID",
                    value: raw,
                })?;
        }

        Ok(settings)
    }
}

fn parse_positive(raw: &str, key: &'static str) -> Result<u64, SettingsError> {
    raw.parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or(SettingsError::InvalidValue {
            key,
            value: raw.to_string(),
        })
}
