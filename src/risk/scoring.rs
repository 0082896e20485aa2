//! Risk factor scoring.
//!
//! Every factor maps into [0, 1] (higher = riskier). Step mappings live in
//! named tables so thresholds can be tuned without touching the formula.

use chrono::{DateTime, Utc};

use crate::models::{RiskFactors, RiskLevel};

/// First step whose lower bound the input reaches wins; `otherwise` below all.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTable {
    /// (lower bound, inclusive?, score), ordered by descending lower bound
    pub steps: Vec<(f64, bool, f64)>,
    pub otherwise: f64,
}

impl StepTable {
    pub fn score(&self, x: f64) -> f64 {
        if !x.is_finite() {
            // Unknown input scores as the riskiest step.
            return self
                .steps
                .iter()
                .map(|s| s.2)
                .fold(self.otherwise, f64::max);
        }
        for &(bound, inclusive, score) in &self.steps {
            if x > bound || (inclusive && x == bound) {
                return score;
            }
        }
        self.otherwise
    }
}

/// Weights of the overall score; they sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorWeights {
    pub exposure: f64,
    pub confidence: f64,
    pub volatility: f64,
    pub correlation: f64,
    pub time_to_event: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            exposure: 0.3,
            confidence: 0.2,
            volatility: 0.2,
            correlation: 0.2,
            time_to_event: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskThresholds {
    pub high_confidence: f64,
    pub medium_confidence: f64,
    pub high_volatility: f64,
    pub medium_volatility: f64,
    /// Confidence → risk (high confidence = low risk)
    pub confidence: StepTable,
    /// Volatility → risk (high volatility = high risk)
    pub volatility: StepTable,
    /// Hours until the event → risk
    pub time_to_event: StepTable,
    /// Score used when the event time is unknown
    pub unknown_time_to_event: f64,
    pub weights: FactorWeights,
    /// Overall score at or below → low
    pub low_level: f64,
    /// Overall score at or below → medium, above → high
    pub medium_level: f64,
    // Warning triggers
    pub exposure_warning: f64,
    pub correlation_warning: f64,
    pub time_to_event_warning: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        let high_confidence = 0.8;
        let medium_confidence = 0.6;
        let high_volatility = 0.7;
        let medium_volatility = 0.4;
        Self {
            high_confidence,
            medium_confidence,
            high_volatility,
            medium_volatility,
            confidence: StepTable {
                steps: vec![(high_confidence, true, 0.2), (medium_confidence, true, 0.5)],
                otherwise: 0.8,
            },
            volatility: StepTable {
                steps: vec![(high_volatility, true, 0.8), (medium_volatility, true, 0.5)],
                otherwise: 0.2,
            },
            time_to_event: StepTable {
                steps: vec![(24.0, false, 0.2), (1.0, true, 0.5)],
                otherwise: 0.8,
            },
            unknown_time_to_event: 0.5,
            weights: FactorWeights::default(),
            low_level: 0.3,
            medium_level: 0.6,
            exposure_warning: 0.8,
            correlation_warning: 0.7,
            time_to_event_warning: 0.7,
        }
    }
}

impl RiskThresholds {
    pub fn overall(&self, f: &RiskFactors) -> f64 {
        let w = &self.weights;
        w.exposure * f.exposure
            + w.confidence * f.confidence
            + w.volatility * f.volatility
            + w.correlation * f.correlation
            + w.time_to_event * f.time_to_event
    }

    pub fn level(&self, overall: f64) -> RiskLevel {
        if overall <= self.low_level {
            RiskLevel::Low
        } else if overall <= self.medium_level {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    pub fn time_to_event_score(&self, event_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        match event_time {
            Some(t) => {
                let hours = (t - now).num_seconds() as f64 / 3600.0;
                self.time_to_event.score(hours)
            }
            None => self.unknown_time_to_event,
        }
    }
}

/// Worst of the three exposure utilisations, capped at 1.0. A zero cap with
/// any exposure counts as fully used.
pub fn exposure_score(current: [(f64, f64); 3]) -> f64 {
    current
        .iter()
        .map(|&(used, cap)| {
            if cap <= 0.0 {
                if used > 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                used / cap
            }
        })
        .fold(0.0, f64::max)
        .clamp(0.0, 1.0)
}

/// What the correlation heuristic needs to know about a bet.
#[derive(Debug, Clone, Copy)]
pub struct BetKey<'a> {
    pub subject_id: &'a str,
    pub metric: &'a str,
    pub event_time: Option<DateTime<Utc>>,
}

/// Additive pairwise correlation: +0.3 same subject, +0.3 same metric,
/// +0.4 events under an hour apart or +0.2 under a day apart.
pub fn pairwise_correlation(a: &BetKey<'_>, b: &BetKey<'_>) -> f64 {
    let mut c = 0.0;
    if a.subject_id == b.subject_id {
        c += 0.3;
    }
    if a.metric == b.metric {
        c += 0.3;
    }
    if let (Some(ta), Some(tb)) = (a.event_time, b.event_time) {
        let gap_secs = (ta - tb).num_seconds().abs();
        if gap_secs < 3_600 {
            c += 0.4;
        } else if gap_secs < 86_400 {
            c += 0.2;
        }
    }
    c
}

/// Maximum correlation between `candidate` and any open bet.
pub fn max_correlation<'a>(candidate: &BetKey<'_>, open: impl IntoIterator<Item = BetKey<'a>>) -> f64 {
    open.into_iter()
        .map(|b| pairwise_correlation(candidate, &b))
        .fold(0.0, f64::max)
}
