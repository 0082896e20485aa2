//! Priority-ordered validation of (input, output) prediction pairs.
//!
//! Rules run in ascending priority. Ordinary failures come back as data in
//! the `ValidationResult`; only a rule that itself errors aborts the pass.
//! Once a rule at or above the critical priority fails, later rules are
//! skipped for that pass and contribute neither errors nor warnings.

pub mod rules;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, error};

use crate::bus::{topics, BusPayload, EventBus};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ValidationMetrics, ValidationResult};

pub use rules::{ConfidenceRule, FeatureRule, FnRule, MetadataRule, RangeRule};

/// What the prediction was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionInput {
    pub features: BTreeMap<String, f64>,
    /// When the underlying data was observed
    pub timestamp: DateTime<Utc>,
}

/// What the prediction claims
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutput {
    /// Probability-scaled prediction
    pub value: f64,
    pub confidence: f64,
    /// Overrides the age-derived freshness when present
    pub data_freshness: Option<f64>,
    /// Overrides the feature-derived signal quality when present
    pub signal_quality: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub context: Option<String>,
}

impl RuleOutcome {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            context: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
            context: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

pub trait ValidationRule: Send + Sync {
    /// Also used to attribute errors to the rule in statistics.
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u32;

    /// Deterministic key over (input, output); `Some` enables memoisation.
    fn cache_key(&self, _input: &PredictionInput, _output: &PredictionOutput) -> Option<String> {
        None
    }

    fn evaluate(&self, input: &PredictionInput, output: &PredictionOutput) -> Result<RuleOutcome>;
}

/// Summary metrics for a pair, independent of which rules ran.
pub fn derive_metrics(
    input: &PredictionInput,
    output: &PredictionOutput,
    max_data_age_secs: f64,
    now: DateTime<Utc>,
) -> ValidationMetrics {
    let confidence = if output.confidence.is_finite() {
        output.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let data_freshness = output
        .data_freshness
        .filter(|f| f.is_finite())
        .unwrap_or_else(|| {
            let age = (now - input.timestamp).num_milliseconds().max(0) as f64 / 1000.0;
            if max_data_age_secs <= 0.0 {
                0.0
            } else {
                1.0 - age / max_data_age_secs
            }
        })
        .clamp(0.0, 1.0);

    let signal_quality = output
        .signal_quality
        .filter(|q| q.is_finite())
        .unwrap_or_else(|| {
            if input.features.is_empty() {
                0.0
            } else {
                let finite = input.features.values().filter(|v| v.is_finite()).count();
                finite as f64 / input.features.len() as f64
            }
        })
        .clamp(0.0, 1.0);

    ValidationMetrics {
        confidence,
        data_freshness,
        signal_quality,
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// A failing rule at or above this priority stops the chain
    pub critical_priority: u32,
    pub cache_ttl: Duration,
    pub history_size: usize,
    pub min_confidence: f64,
    pub max_data_age_secs: f64,
    pub min_freshness: f64,
    pub min_signal_quality: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            critical_priority: 3,
            cache_ttl: Duration::seconds(5),
            history_size: 1000,
            min_confidence: 0.6,
            max_data_age_secs: 300.0,
            min_freshness: 0.5,
            min_signal_quality: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationStats {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub validation_rate: f64,
    pub average_confidence: f64,
    pub average_freshness: f64,
    pub average_signal_quality: f64,
    pub rule_stats: BTreeMap<String, RuleStats>,
}

struct CachedOutcome {
    outcome: RuleOutcome,
    stored_at: DateTime<Utc>,
}

pub struct PredictionValidator {
    rules: Vec<Box<dyn ValidationRule>>,
    /// (rule name, cache key) -> outcome
    cache: HashMap<(String, String), CachedOutcome>,
    history: VecDeque<ValidationResult>,
    config: ValidatorConfig,
    bus: EventBus,
}

impl PredictionValidator {
    pub fn new(config: ValidatorConfig, bus: EventBus) -> Self {
        Self {
            rules: Vec::new(),
            cache: HashMap::new(),
            history: VecDeque::with_capacity(config.history_size.min(4096)),
            config,
            bus,
        }
    }

    /// Validator with the four canonical rules registered.
    pub fn with_default_rules(config: ValidatorConfig, bus: EventBus) -> Self {
        let min_confidence = config.min_confidence;
        let max_age = config.max_data_age_secs;
        let min_freshness = config.min_freshness;
        let min_quality = config.min_signal_quality;
        let mut validator = Self::new(config, bus);
        validator.add_rule(Box::new(FeatureRule));
        validator.add_rule(Box::new(RangeRule::default()));
        validator.add_rule(Box::new(ConfidenceRule::new(min_confidence)));
        validator.add_rule(Box::new(MetadataRule::new(
            max_age,
            min_freshness,
            min_quality,
        )));
        validator
    }

    /// Rules with equal priority keep registration order.
    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority());
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn validate(
        &mut self,
        input: &PredictionInput,
        output: &PredictionOutput,
    ) -> PipelineResult<ValidationResult> {
        let now = Utc::now();
        let ttl = self.config.cache_ttl;
        self.cache.retain(|_, c| now - c.stored_at < ttl);

        let mut is_valid = true;
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut rule_context = BTreeMap::new();

        for rule in &self.rules {
            let key = rule
                .cache_key(input, output)
                .map(|k| (rule.name().to_string(), k));
            let cached = key
                .as_ref()
                .and_then(|k| self.cache.get(k))
                .map(|c| c.outcome.clone());

            let outcome = match cached {
                Some(outcome) => outcome,
                None => match rule.evaluate(input, output) {
                    Ok(outcome) => {
                        if let Some(key) = key {
                            self.cache.insert(
                                key,
                                CachedOutcome {
                                    outcome: outcome.clone(),
                                    stored_at: now,
                                },
                            );
                        }
                        outcome
                    }
                    Err(e) => {
                        let err = PipelineError::ValidationPipeline {
                            rule: rule.name().to_string(),
                            message: e.to_string(),
                        };
                        error!("{}", err);
                        self.bus.publish(
                            topics::PIPELINE_ERROR,
                            BusPayload::PipelineError {
                                stage: "validation".into(),
                                message: err.to_string(),
                            },
                        );
                        return Err(err);
                    }
                },
            };

            errors.extend(outcome.errors.iter().map(|e| format!("{}: {}", rule.name(), e)));
            warnings.extend(outcome.warnings.iter().map(|w| format!("{}: {}", rule.name(), w)));
            if let Some(ctx) = outcome.context {
                rule_context.insert(rule.name().to_string(), ctx);
            }

            if !outcome.is_valid {
                is_valid = false;
                if rule.priority() >= self.config.critical_priority {
                    debug!(
                        "Rule {} (priority {}) failed, skipping remaining rules",
                        rule.name(),
                        rule.priority()
                    );
                    break;
                }
            }
        }

        let result = ValidationResult {
            is_valid,
            errors,
            warnings,
            metrics: derive_metrics(input, output, self.config.max_data_age_secs, now),
            rule_context,
            validated_at: now,
        };

        self.history.push_back(result.clone());
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }

        self.bus.publish(
            topics::PREDICTION_VALIDATED,
            BusPayload::Validation(result.clone()),
        );
        Ok(result)
    }

    pub fn history(&self) -> impl Iterator<Item = &ValidationResult> {
        self.history.iter()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Aggregates over the retained history. Per-rule failures are
    /// approximated by looking for the rule's name in recorded errors.
    pub fn stats(&self) -> ValidationStats {
        let total = self.history.len();
        let valid: Vec<&ValidationResult> = self.history.iter().filter(|r| r.is_valid).collect();
        let n_valid = valid.len();
        let avg = |f: fn(&ValidationMetrics) -> f64| {
            if n_valid == 0 {
                0.0
            } else {
                valid.iter().map(|r| f(&r.metrics)).sum::<f64>() / n_valid as f64
            }
        };

        let rule_stats = self
            .rules
            .iter()
            .map(|rule| {
                let failed = self
                    .history
                    .iter()
                    .filter(|r| r.errors.iter().any(|e| e.contains(rule.name())))
                    .count();
                (
                    rule.name().to_string(),
                    RuleStats {
                        passed: total - failed,
                        failed,
                    },
                )
            })
            .collect();

        ValidationStats {
            total,
            valid: n_valid,
            invalid: total - n_valid,
            validation_rate: if total == 0 {
                0.0
            } else {
                n_valid as f64 / total as f64
            },
            average_confidence: avg(|m| m.confidence),
            average_freshness: avg(|m| m.data_freshness),
            average_signal_quality: avg(|m| m.signal_quality),
            rule_stats,
        }
    }
}
