use clap::Parser;
use std::time::Duration;

use crate::engine::EnsembleConfig;
use crate::models::BetSide;
use crate::pipeline::PipelineConfig;
use crate::risk::RiskConfig;
use crate::validation::ValidatorConfig;

/// Ensemble prediction, validation and risk-bounded staking for player props
#[derive(Parser, Debug, Clone)]
#[command(name = "propbet-engine", version, about)]
pub struct Config {
    /// Starting bankroll (USD)
    #[arg(long, env = "BANKROLL", default_value = "10000.0")]
    pub bankroll: f64,

    /// Active risk profile: conservative, moderate or aggressive
    #[arg(long, env = "RISK_PROFILE", default_value = "moderate")]
    pub risk_profile: String,

    /// JSON file mapping profile id to a list of custom risk rules
    #[arg(long, env = "RISK_RULES_FILE")]
    pub risk_rules_file: Option<String>,

    /// Upper bound on the Kelly-style stake fraction of an opportunity
    #[arg(long, env = "KELLY_CEILING", default_value = "0.25")]
    pub kelly_ceiling: f64,

    /// Global multiplier applied to every recommended max stake
    #[arg(long, env = "KELLY_MULTIPLIER", default_value = "1.0")]
    pub kelly_multiplier: f64,

    /// American odds assumed when a market update carries none
    #[arg(
        long,
        env = "DEFAULT_ODDS",
        default_value = "-110",
        allow_negative_numbers = true
    )]
    pub default_odds: i32,

    /// Side reported when a prediction has no market line (over / under)
    #[arg(long, env = "NEUTRAL_SIDE", default_value = "over")]
    pub neutral_side: String,

    /// A failing validation rule at or above this priority stops the chain
    #[arg(long, env = "CRITICAL_RULE_PRIORITY", default_value = "3")]
    pub critical_rule_priority: u32,

    /// Confidence below this produces a validation warning
    #[arg(long, env = "MIN_CONFIDENCE", default_value = "0.6")]
    pub min_confidence: f64,

    /// How long a memoised rule result stays valid (seconds)
    #[arg(long, env = "RULE_CACHE_TTL_SECS", default_value = "5")]
    pub rule_cache_ttl_secs: u64,

    /// Validation results retained for statistics
    #[arg(long, env = "VALIDATION_HISTORY", default_value = "1000")]
    pub validation_history: usize,

    /// Data older than this is considered fully stale (seconds)
    #[arg(long, env = "MAX_DATA_AGE_SECS", default_value = "300")]
    pub max_data_age_secs: u64,

    /// Points of metric history kept per subject and metric
    #[arg(long, env = "HISTORY_WINDOW", default_value = "20")]
    pub history_window: usize,

    /// Identical market updates inside this window are dropped (seconds)
    #[arg(long, env = "DEDUP_WINDOW_SECS", default_value = "60")]
    pub dedup_window_secs: u64,

    /// A model producer slower than this counts as failed (milliseconds)
    #[arg(long, env = "PRODUCER_TIMEOUT_MS", default_value = "2000")]
    pub producer_timeout_ms: u64,

    /// How long an opportunity stays actionable (minutes)
    #[arg(long, env = "OPPORTUNITY_TTL_MINS", default_value = "15")]
    pub opportunity_ttl_mins: i64,

    /// Status API listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// JSON file of inbound events to replay
    #[arg(long, env = "FEED_FILE")]
    pub feed_file: Option<String>,

    /// Feed polling interval (milliseconds)
    #[arg(long, env = "FEED_POLL_INTERVAL_MS", default_value = "1000")]
    pub feed_poll_interval_ms: u64,

    /// Events delivered per feed poll
    #[arg(long, env = "FEED_BATCH_SIZE", default_value = "10")]
    pub feed_batch_size: usize,

    /// JSON file with feature and experiment definitions
    #[arg(long, env = "GATE_FILE")]
    pub gate_file: Option<String>,

    /// Experiment whose variant is stamped on each opportunity
    #[arg(long, env = "EXPERIMENT_ID")]
    pub experiment_id: Option<String>,

    /// Per-subscriber event bus channel capacity
    #[arg(long, env = "BUS_CAPACITY", default_value = "1024")]
    pub bus_capacity: usize,

    /// Interval between ledger snapshots on the bus (seconds)
    #[arg(long, env = "METRICS_INTERVAL_SECS", default_value = "30")]
    pub metrics_interval_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.bankroll.is_finite() && self.bankroll > 0.0) {
            anyhow::bail!("bankroll must be positive");
        }
        if !(0.0..=1.0).contains(&self.kelly_ceiling) {
            anyhow::bail!("kelly_ceiling must be between 0.0 and 1.0");
        }
        if !(0.0..=10.0).contains(&self.kelly_multiplier) {
            anyhow::bail!("kelly_multiplier must be between 0.0 and 10.0");
        }
        if (-100..100).contains(&self.default_odds) {
            anyhow::bail!("default_odds must be American odds (<= -100 or >= 100)");
        }
        self.neutral_side()?;
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("min_confidence must be between 0.0 and 1.0");
        }
        if self.validation_history == 0 || self.history_window == 0 {
            anyhow::bail!("validation_history and history_window must be at least 1");
        }
        if self.producer_timeout_ms == 0 || self.feed_poll_interval_ms == 0 {
            anyhow::bail!("producer_timeout_ms and feed_poll_interval_ms must be positive");
        }
        if self.opportunity_ttl_mins <= 0 {
            anyhow::bail!("opportunity_ttl_mins must be positive");
        }
        if self.bus_capacity == 0 || self.metrics_interval_secs == 0 {
            anyhow::bail!("bus_capacity and metrics_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn neutral_side(&self) -> anyhow::Result<BetSide> {
        match self.neutral_side.to_ascii_lowercase().as_str() {
            "over" => Ok(BetSide::Over),
            "under" => Ok(BetSide::Under),
            other => anyhow::bail!("neutral_side must be 'over' or 'under', got '{}'", other),
        }
    }

    pub fn ensemble(&self) -> anyhow::Result<EnsembleConfig> {
        Ok(EnsembleConfig {
            kelly_ceiling: self.kelly_ceiling,
            default_odds: self.default_odds,
            neutral_side: self.neutral_side()?,
            producer_timeout: Duration::from_millis(self.producer_timeout_ms),
            opportunity_ttl: chrono::Duration::minutes(self.opportunity_ttl_mins),
        })
    }

    pub fn validator(&self) -> ValidatorConfig {
        ValidatorConfig {
            critical_priority: self.critical_rule_priority,
            cache_ttl: chrono::Duration::seconds(self.rule_cache_ttl_secs as i64),
            history_size: self.validation_history,
            min_confidence: self.min_confidence,
            max_data_age_secs: self.max_data_age_secs as f64,
            ..ValidatorConfig::default()
        }
    }

    pub fn risk(&self) -> RiskConfig {
        RiskConfig {
            bankroll: self.bankroll,
            kelly_multiplier: self.kelly_multiplier,
            ..RiskConfig::default()
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            history_window: self.history_window,
            dedup_window: chrono::Duration::seconds(self.dedup_window_secs as i64),
            experiment_id: self.experiment_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["propbet-engine"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.default_odds, -110);
        assert_eq!(config.neutral_side().unwrap(), BetSide::Over);
        assert_eq!(config.ensemble().unwrap().kelly_ceiling, 0.25);
        assert_eq!(config.validator().critical_priority, 3);
    }

    #[test]
    fn negative_odds_parse_from_the_command_line() {
        let config = parse(&["--default-odds", "-135", "--neutral-side", "UNDER"]);
        config.validate().unwrap();
        assert_eq!(config.default_odds, -135);
        assert_eq!(config.neutral_side().unwrap(), BetSide::Under);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--kelly-ceiling", "1.5"]).validate().is_err());
        assert!(parse(&["--default-odds", "50"]).validate().is_err());
        assert!(parse(&["--neutral-side", "push"]).validate().is_err());
        assert!(parse(&["--bankroll", "0"]).validate().is_err());
        assert!(parse(&["--history-window", "0"]).validate().is_err());
    }
}
