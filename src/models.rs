use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Direction the posted line has moved since the previous snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Movement {
    Up,
    Down,
    Stable,
}

impl Movement {
    /// Signed encoding used when the movement is fed to models as a feature.
    pub fn as_signal(self) -> f64 {
        match self {
            Movement::Up => 1.0,
            Movement::Down => -1.0,
            Movement::Stable => 0.0,
        }
    }
}

/// Current market state for a proposition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Posted line (e.g. 20.5 points)
    pub line: f64,
    /// Matched volume in USD
    pub volume: f64,
    pub movement: Movement,
    /// Posted American odds for the side being priced (e.g. -110)
    #[serde(default)]
    pub odds: Option<i32>,
}

/// One observed value of the metric in the past
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Everything a model producer may look at for one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionContext {
    pub subject_id: String,
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub market: Option<MarketSnapshot>,
    /// Oldest first, bounded by the pipeline's history window
    pub history: Vec<HistoricalPoint>,
    pub features: BTreeMap<String, f64>,
    /// Scheduled start of the underlying game, when known
    pub event_time: Option<DateTime<Utc>>,
}

impl PredictionContext {
    pub fn new(subject_id: &str, metric: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            metric: metric.to_string(),
            timestamp: Utc::now(),
            market: None,
            history: Vec::new(),
            features: BTreeMap::new(),
            event_time: None,
        }
    }

    pub fn with_market(mut self, market: MarketSnapshot) -> Self {
        self.market = Some(market);
        self
    }

    pub fn with_history(mut self, history: Vec<HistoricalPoint>) -> Self {
        self.history = history;
        self
    }

    pub fn with_feature(mut self, name: &str, value: f64) -> Self {
        self.features.insert(name.to_string(), value);
        self
    }

    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    pub fn line(&self) -> Option<f64> {
        self.market.as_ref().map(|m| m.line)
    }
}

/// A named, weighted input that drove a prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub weight: f64,
    pub source: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAnalysis {
    /// 0.0 = market badly mispriced, 1.0 = fully efficient
    pub market_efficiency: f64,
    pub subject_id: String,
    pub metric: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub risk_factors: Vec<String>,
    pub meta_analysis: MetaAnalysis,
}

/// Output of a single model producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    /// Forecast of the metric (e.g. projected points)
    pub value: f64,
    pub confidence: f64,
    pub factors: Vec<Factor>,
    pub analysis: Analysis,
}

/// Weight-normalised aggregate of several `ModelPrediction`s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedPrediction {
    pub value: f64,
    pub confidence: f64,
    pub factors: Vec<Factor>,
    pub analysis: Analysis,
    /// Names of the producers that contributed, in registry order
    pub contributors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetSide {
    Over,
    Under,
}

impl std::fmt::Display for BetSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BetSide::Over => write!(f, "OVER"),
            BetSide::Under => write!(f, "UNDER"),
        }
    }
}

/// How many producers backed an opportunity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Ensemble,
    SingleSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityMetadata {
    pub factors: Vec<Factor>,
    pub risk_factors: Vec<String>,
    pub source: Provenance,
    pub contributors: Vec<String>,
    /// Fraction of registered producers that returned a usable prediction
    pub coverage: f64,
    /// Dispersion of the metric's recent history, 0.0–1.0
    pub volatility: f64,
    pub market_efficiency: f64,
    /// Experiment variant the subject was bucketed into, if any
    pub experiment_variant: Option<String>,
}

/// A sized, directional recommendation produced by one pipeline run.
/// Never mutated after emission; a superseding update gets a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BettingOpportunity {
    pub id: String,
    pub subject_id: String,
    pub metric: String,
    pub side: BetSide,
    pub line: Option<f64>,
    /// American odds the edge was computed against
    pub odds: i32,
    /// Combined projection of the metric
    pub projected_value: f64,
    /// Model probability that `side` wins (0.0–1.0)
    pub probability: f64,
    pub confidence: f64,
    pub expected_value: f64,
    /// Capped Kelly-style stake fraction (confidence × EV)
    pub kelly_fraction: f64,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub event_time: Option<DateTime<Utc>>,
    pub metadata: OpportunityMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub confidence: f64,
    pub data_freshness: f64,
    pub signal_quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// AND of every blocking rule that ran
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: ValidationMetrics,
    /// Optional per-rule diagnostics keyed by rule name
    pub rule_context: BTreeMap<String, String>,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Share of the per-bet cap allowed at this risk level.
    pub fn stake_scale(self) -> f64 {
        match self {
            RiskLevel::Low => 1.0,
            RiskLevel::Medium => 0.75,
            RiskLevel::High => 0.5,
        }
    }
}

/// Per-factor risk breakdown, each in [0, 1] (higher = riskier)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskFactors {
    pub exposure: f64,
    pub confidence: f64,
    pub volatility: f64,
    pub correlation: f64,
    pub time_to_event: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_exposure: f64,
    pub max_stake: f64,
    pub min_odds: i32,
    pub max_odds: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub opportunity_id: String,
    pub profile_id: String,
    pub risk_level: RiskLevel,
    /// Weighted overall score the level was derived from
    pub risk_score: f64,
    /// Monetary units, floored, never negative
    pub max_stake: f64,
    /// Copied forward from the opportunity; advisory only
    pub kelly_fraction: f64,
    pub factors: RiskFactors,
    pub limits: RiskLimits,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Aggregate exposure ledger snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_exposure: f64,
    pub exposure_by_player: BTreeMap<String, f64>,
    pub exposure_by_metric: BTreeMap<String, f64>,
    pub active_bets: usize,
    pub bankroll: f64,
    pub profit_loss: f64,
    pub roi: f64,
    pub win_rate: f64,
    pub average_stake: f64,
    pub kelly_multiplier: f64,
}

impl RiskMetrics {
    pub fn new(bankroll: f64, kelly_multiplier: f64) -> Self {
        Self {
            total_exposure: 0.0,
            exposure_by_player: BTreeMap::new(),
            exposure_by_metric: BTreeMap::new(),
            active_bets: 0,
            bankroll,
            profit_loss: 0.0,
            roi: 0.0,
            win_rate: 0.0,
            average_stake: 0.0,
            kelly_multiplier,
        }
    }
}

/// Alert raised when an assessment breaches the active profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskViolation {
    /// "warning" | "critical"
    pub severity: String,
    pub title: String,
    pub message: String,
    pub profile_id: String,
    pub violated_rules: Vec<String>,
    pub opportunity_id: String,
}

// ── Inbound events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub id: String,
    pub subject_id: String,
    pub metric: String,
    pub line: f64,
    pub volume: f64,
    pub movement: Movement,
    #[serde(default)]
    pub odds: Option<i32>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    /// Recently observed values of the metric, any order
    #[serde(default)]
    pub history: Vec<HistoricalPoint>,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetPlacement {
    pub id: String,
    pub subject_id: String,
    pub metric: String,
    pub stake: f64,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetSettlement {
    pub id: String,
    pub won: bool,
    /// Realised profit (negative on a loss), excluding the returned stake
    pub profit_loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BankrollUpdate {
    pub balance: f64,
}
