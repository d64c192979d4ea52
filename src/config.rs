use rust_decimal::Decimal;

/// Study-wide knobs. Money is configured in cents and exposed as `Decimal`.
#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub listen_addr: String,
    pub reward_cents: i64,
    pub max_earnings_cents: i64,
    pub schedule_min: u32,
    pub schedule_max: u32,
    pub schedule_trials_per_threshold: u32,
    pub schedule_margin: usize,
    /// Trial count a freshly generated (or extended) schedule should cover.
    pub schedule_trial_hint: u32,
    pub rng_seed: Option<u64>,
    pub conflict_retries: u32,
    pub conflict_base_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./study.sqlite".to_string(),
            listen_addr: "127.0.0.1:8787".to_string(),
            reward_cents: 5,
            max_earnings_cents: 500,
            schedule_min: 1,
            schedule_max: 8,
            schedule_trials_per_threshold: 4,
            schedule_margin: 50,
            schedule_trial_hint: 200,
            rng_seed: None,
            conflict_retries: 3,
            conflict_base_delay_ms: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(d.listen_addr),
            reward_cents: std::env::var("REWARD_CENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.reward_cents),
            max_earnings_cents: std::env::var("MAX_EARNINGS_CENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_earnings_cents),
            schedule_min: std::env::var("SCHEDULE_MIN").ok().and_then(|v| v.parse().ok()).unwrap_or(d.schedule_min),
            schedule_max: std::env::var("SCHEDULE_MAX").ok().and_then(|v| v.parse().ok()).unwrap_or(d.schedule_max),
            schedule_trials_per_threshold: std::env::var("SCHEDULE_TRIALS_PER_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.schedule_trials_per_threshold),
            schedule_margin: std::env::var("SCHEDULE_MARGIN").ok().and_then(|v| v.parse().ok()).unwrap_or(d.schedule_margin),
            schedule_trial_hint: std::env::var("SCHEDULE_TRIAL_HINT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.schedule_trial_hint),
            rng_seed: std::env::var("RNG_SEED").ok().and_then(|v| v.parse().ok()),
            conflict_retries: std::env::var("CONFLICT_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(d.conflict_retries),
            conflict_base_delay_ms: std::env::var("CONFLICT_BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.conflict_base_delay_ms),
        }
    }

    pub fn reward_amount(&self) -> Decimal {
        Decimal::new(self.reward_cents, 2)
    }

    pub fn max_earnings(&self) -> Decimal {
        Decimal::new(self.max_earnings_cents, 2)
    }
}
