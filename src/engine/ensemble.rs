use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{topics, BusPayload, EventBus};
use crate::error::{PipelineError, PipelineResult};
use crate::gate::{FeatureGate, UserContext};
use crate::models::{
    Analysis, BetSide, BettingOpportunity, CombinedPrediction, Factor, MetaAnalysis,
    ModelPrediction, OpportunityMetadata, PredictionContext, Provenance,
};

use super::odds::{
    expected_value, implied_probability, kelly_fraction, side_for, side_probability,
    DEFAULT_AMERICAN_ODDS,
};
use super::producers::{coefficient_of_variation, ModelProducer};

#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Upper bound on the Kelly-style stake fraction
    pub kelly_ceiling: f64,
    /// Price used when the market snapshot carries no odds
    pub default_odds: i32,
    /// Side reported when the context has no market line
    pub neutral_side: BetSide,
    /// A producer slower than this counts as failed
    pub producer_timeout: Duration,
    /// How long an emitted opportunity stays actionable
    pub opportunity_ttl: ChronoDuration,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            kelly_ceiling: 0.25,
            default_odds: DEFAULT_AMERICAN_ODDS,
            neutral_side: BetSide::Over,
            producer_timeout: Duration::from_secs(2),
            opportunity_ttl: ChronoDuration::minutes(15),
        }
    }
}

struct RegisteredProducer {
    producer: Arc<dyn ModelProducer>,
    weight: f64,
    /// Skip this producer for subjects where the feature is off
    feature_flag: Option<String>,
}

/// One surviving producer output, ready for combination.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub model: String,
    pub weight: f64,
    pub prediction: ModelPrediction,
}

/// Weighted combination of producer outputs. Returns `None` for an empty
/// slice or a non-positive total weight.
pub fn combine(contributions: &[Contribution]) -> Option<CombinedPrediction> {
    let total_weight: f64 = contributions.iter().map(|c| c.weight).sum();
    if contributions.is_empty() || total_weight <= 0.0 {
        return None;
    }

    let mut value = 0.0;
    let mut confidence = 0.0;
    let mut efficiency = 0.0;
    let mut factors: Vec<Factor> = Vec::new();
    let mut risk_factors: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for c in contributions {
        let share = c.weight / total_weight;
        let p = &c.prediction;
        value += p.value * share;
        confidence += p.confidence * share;
        efficiency += p.analysis.meta_analysis.market_efficiency * share;

        // Keep each model's factor weights within its own share of 1.0.
        let own_sum: f64 = p.factors.iter().map(|f| f.weight.max(0.0)).sum();
        let normaliser = if own_sum > 1.0 { own_sum } else { 1.0 };
        factors.extend(p.factors.iter().map(|f| Factor {
            weight: f.weight.max(0.0) / normaliser * share,
            ..f.clone()
        }));

        for rf in &p.analysis.risk_factors {
            if seen.insert(rf.clone()) {
                risk_factors.push(rf.clone());
            }
        }
    }

    let first = &contributions[0].prediction.analysis.meta_analysis;
    Some(CombinedPrediction {
        value,
        confidence,
        factors,
        analysis: Analysis {
            risk_factors,
            meta_analysis: MetaAnalysis {
                market_efficiency: efficiency,
                subject_id: first.subject_id.clone(),
                metric: first.metric.clone(),
            },
        },
        contributors: contributions.iter().map(|c| c.model.clone()).collect(),
    })
}

/// Dispersion of the context's history mapped into [0, 1]; 0.5 when unknown.
pub fn history_volatility(ctx: &PredictionContext) -> f64 {
    if ctx.history.len() < 2 {
        return 0.5;
    }
    let values: Vec<f64> = ctx.history.iter().map(|p| p.value).collect();
    coefficient_of_variation(&values).clamp(0.0, 1.0)
}

/// Registry of weighted model producers plus the combination and sizing
/// logic that turns their outputs into a `BettingOpportunity`.
pub struct EnsembleEngine {
    producers: Vec<RegisteredProducer>,
    config: EnsembleConfig,
    bus: EventBus,
}

impl EnsembleEngine {
    pub fn new(config: EnsembleConfig, bus: EventBus) -> Self {
        Self {
            producers: Vec::new(),
            config,
            bus,
        }
    }

    /// Register a producer with a static weight (normalised at combination).
    pub fn register(&mut self, producer: Arc<dyn ModelProducer>, weight: f64) -> &mut Self {
        self.register_inner(producer, weight, None)
    }

    /// Register a producer that only runs where `feature_id` is enabled.
    pub fn register_gated(
        &mut self,
        producer: Arc<dyn ModelProducer>,
        weight: f64,
        feature_id: &str,
    ) -> &mut Self {
        self.register_inner(producer, weight, Some(feature_id.to_string()))
    }

    fn register_inner(
        &mut self,
        producer: Arc<dyn ModelProducer>,
        weight: f64,
        feature_flag: Option<String>,
    ) -> &mut Self {
        if !(weight.is_finite() && weight > 0.0) {
            warn!(
                "Ignoring producer {} with non-positive weight {}",
                producer.name(),
                weight
            );
            return self;
        }
        info!("Registered model producer {} (weight {:.2})", producer.name(), weight);
        self.producers.push(RegisteredProducer {
            producer,
            weight,
            feature_flag,
        });
        self
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Run every registered producer and combine the survivors.
    pub async fn generate(&self, ctx: &PredictionContext) -> PipelineResult<BettingOpportunity> {
        let active: Vec<&RegisteredProducer> = self.producers.iter().collect();
        self.run(ctx, active).await
    }

    /// Like `generate`, skipping gated producers whose feature is disabled
    /// for this subject. Unknown feature ids count as disabled.
    pub async fn generate_gated(
        &self,
        ctx: &PredictionContext,
        gate: &FeatureGate,
    ) -> PipelineResult<BettingOpportunity> {
        let user = UserContext::new(&ctx.subject_id).with_attribute("metric", &ctx.metric);
        let active: Vec<&RegisteredProducer> = self
            .producers
            .iter()
            .filter(|p| match p.feature_flag.as_deref() {
                None => true,
                Some(flag) => gate.is_enabled(flag, &user).unwrap_or_else(|e| {
                    warn!("Gate check for {} failed: {}", p.producer.name(), e);
                    false
                }),
            })
            .collect();
        self.run(ctx, active).await
    }

    async fn run(
        &self,
        ctx: &PredictionContext,
        active: Vec<&RegisteredProducer>,
    ) -> PipelineResult<BettingOpportunity> {
        let timeout = self.config.producer_timeout;
        let futures: Vec<_> = active
            .iter()
            .map(|rp| {
                let producer = Arc::clone(&rp.producer);
                async move {
                    let res = tokio::time::timeout(timeout, producer.predict(ctx)).await;
                    let out = match res {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
                    };
                    (producer.name().to_string(), out)
                }
            })
            .collect();

        let results = futures_util::future::join_all(futures).await;

        let mut contributions = Vec::new();
        for (rp, (name, result)) in active.iter().zip(results) {
            match result {
                Ok(Some(prediction))
                    if prediction.value.is_finite() && prediction.confidence.is_finite() =>
                {
                    contributions.push(Contribution {
                        model: name,
                        weight: rp.weight,
                        prediction,
                    });
                }
                Ok(Some(prediction)) => warn!(
                    "Producer '{}' returned non-finite output (value={}, confidence={})",
                    name, prediction.value, prediction.confidence
                ),
                Ok(None) => debug!("Producer '{}' had no prediction for {}", name, ctx.subject_id),
                Err(e) => warn!("Producer '{}' failed: {}", name, e),
            }
        }

        let combined = combine(&contributions).ok_or_else(|| PipelineError::NoPredictionsAvailable {
            subject_id: ctx.subject_id.clone(),
            metric: ctx.metric.clone(),
            attempted: active.len(),
        })?;

        // Producers gated off for this subject are not counted as missing.
        let coverage = contributions.len() as f64 / active.len() as f64;
        let opportunity = self.build_opportunity(ctx, combined, coverage);

        info!(
            "Prediction {}/{}: {} {:.2} vs line {:?} (p={:.3}, conf={:.3}, ev={:.4}, kelly={:.4}, {:?})",
            opportunity.subject_id,
            opportunity.metric,
            opportunity.side,
            opportunity.projected_value,
            opportunity.line,
            opportunity.probability,
            opportunity.confidence,
            opportunity.expected_value,
            opportunity.kelly_fraction,
            opportunity.metadata.source,
        );
        self.bus.publish(
            topics::PREDICTION_GENERATED,
            BusPayload::Opportunity(opportunity.clone()),
        );
        Ok(opportunity)
    }

    fn build_opportunity(
        &self,
        ctx: &PredictionContext,
        combined: CombinedPrediction,
        coverage: f64,
    ) -> BettingOpportunity {
        let line = ctx.line();
        let side = match line {
            Some(line) => side_for(combined.value, line),
            None => self.config.neutral_side,
        };
        let odds = ctx
            .market
            .as_ref()
            .and_then(|m| m.odds)
            .unwrap_or(self.config.default_odds);

        let probability = side_probability(combined.value, line, side);
        let ev = expected_value(probability, implied_probability(odds));
        let confidence = combined.confidence.clamp(0.0, 1.0);
        let kelly = kelly_fraction(confidence, ev, self.config.kelly_ceiling);

        let source = if combined.contributors.len() > 1 {
            Provenance::Ensemble
        } else {
            Provenance::SingleSource
        };
        let now = Utc::now();

        BettingOpportunity {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: ctx.subject_id.clone(),
            metric: ctx.metric.clone(),
            side,
            line,
            odds,
            projected_value: combined.value,
            probability,
            confidence,
            expected_value: ev,
            kelly_fraction: kelly,
            timestamp: now,
            expires_at: now + self.config.opportunity_ttl,
            event_time: ctx.event_time,
            metadata: OpportunityMetadata {
                factors: combined.factors,
                risk_factors: combined.analysis.risk_factors,
                source,
                contributors: combined.contributors,
                coverage,
                volatility: history_volatility(ctx),
                market_efficiency: combined.analysis.meta_analysis.market_efficiency,
                experiment_variant: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Feature;
    use crate::models::{MarketSnapshot, Movement};
    use anyhow::Result;
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Returns a fixed prediction, fails, or stays silent.
    struct Fixed {
        name: String,
        outcome: Option<(f64, f64, Vec<&'static str>)>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl Fixed {
        fn ok(name: &str, value: f64, confidence: f64, risks: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                outcome: Some((value, confidence, risks)),
                fail: false,
                delay: None,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                outcome: None,
                fail: true,
                delay: None,
            })
        }

        fn silent(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                outcome: None,
                fail: false,
                delay: None,
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                outcome: Some((30.0, 0.9, vec![])),
                fail: false,
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl ModelProducer for Fixed {
        async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.fail {
                anyhow::bail!("model exploded");
            }
            Ok(self.outcome.as_ref().map(|(value, confidence, risks)| ModelPrediction {
                value: *value,
                confidence: *confidence,
                factors: vec![Factor {
                    name: format!("{}_signal", self.name),
                    weight: 1.0,
                    source: self.name.clone(),
                    confidence: *confidence,
                }],
                analysis: Analysis {
                    risk_factors: risks.iter().map(|r| r.to_string()).collect(),
                    meta_analysis: MetaAnalysis {
                        market_efficiency: 0.6,
                        subject_id: ctx.subject_id.clone(),
                        metric: ctx.metric.clone(),
                    },
                },
            }))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn ctx_with_line(line: f64) -> PredictionContext {
        PredictionContext::new("P1", "points").with_market(MarketSnapshot {
            line,
            volume: 50_000.0,
            movement: Movement::Stable,
            odds: None,
        })
    }

    #[tokio::test]
    async fn two_equal_models_average_to_the_line_and_tie_goes_over() {
        let bus = EventBus::new(16);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus);
        engine
            .register(Fixed::ok("a", 22.0, 0.8, vec![]), 1.0)
            .register(Fixed::ok("b", 18.0, 0.6, vec![]), 1.0);

        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        assert_relative_eq!(opp.projected_value, 20.0, epsilon = 1e-9);
        assert_relative_eq!(opp.confidence, 0.7, epsilon = 1e-9);
        assert_eq!(opp.side, BetSide::Over);
        assert_eq!(opp.metadata.source, Provenance::Ensemble);
        // Coin flip against -110 juice has no edge.
        assert_relative_eq!(opp.expected_value, 0.0, epsilon = 1e-12);
        assert_relative_eq!(opp.kelly_fraction, 0.0, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn failing_and_silent_producers_are_isolated() {
        let bus = EventBus::new(16);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus);
        engine
            .register(Fixed::failing("boom"), 5.0)
            .register(Fixed::silent("quiet"), 5.0)
            .register(Fixed::ok("ok", 25.0, 0.9, vec!["thin_history"]), 1.0);

        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        assert_relative_eq!(opp.projected_value, 25.0, epsilon = 1e-9);
        assert_eq!(opp.metadata.source, Provenance::SingleSource);
        assert_eq!(opp.metadata.contributors, vec!["ok".to_string()]);
        assert_relative_eq!(opp.metadata.coverage, 1.0 / 3.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn all_failures_is_no_predictions_available() {
        let bus = EventBus::new(16);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus);
        engine
            .register(Fixed::failing("x"), 1.0)
            .register(Fixed::silent("y"), 1.0);

        let err = engine.generate(&ctx_with_line(20.0)).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::NoPredictionsAvailable {
                subject_id: "P1".into(),
                metric: "points".into(),
                attempted: 2,
            }
        );
    }

    #[tokio::test]
    async fn slow_producer_times_out() {
        let bus = EventBus::new(16);
        let config = EnsembleConfig {
            producer_timeout: Duration::from_millis(20),
            ..EnsembleConfig::default()
        };
        let mut engine = EnsembleEngine::new(config, bus);
        engine
            .register(Fixed::slow("slow", Duration::from_millis(500)), 1.0)
            .register(Fixed::ok("fast", 21.0, 0.7, vec![]), 1.0);

        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        assert_eq!(opp.metadata.contributors, vec!["fast".to_string()]);
    }

    #[tokio::test]
    async fn combined_values_stay_inside_contributor_range() {
        let bus = EventBus::new(16);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus);
        engine
            .register(Fixed::ok("a", 12.0, 0.3, vec!["x"]), 0.7)
            .register(Fixed::ok("b", 31.0, 0.95, vec!["x", "y"]), 2.3)
            .register(Fixed::ok("c", 19.0, 0.55, vec!["y", "z"]), 1.1);

        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        assert!((12.0..=31.0).contains(&opp.projected_value));
        assert!((0.3..=0.95).contains(&opp.confidence));
        assert_eq!(
            opp.metadata.risk_factors,
            vec!["x".to_string(), "y".to_string(), "z".to_string()]
        );
        let factor_sum: f64 = opp.metadata.factors.iter().map(|f| f.weight).sum();
        assert!(factor_sum <= 1.0 + 1e-9);
    }

    #[tokio::test]
    async fn missing_line_uses_neutral_side() {
        let bus = EventBus::new(16);
        let config = EnsembleConfig {
            neutral_side: BetSide::Under,
            ..EnsembleConfig::default()
        };
        let mut engine = EnsembleEngine::new(config, bus);
        engine.register(Fixed::ok("a", 22.0, 0.8, vec![]), 1.0);
        let opp = engine
            .generate(&PredictionContext::new("P1", "points"))
            .await
            .unwrap();
        assert_eq!(opp.side, BetSide::Under);
        assert_eq!(opp.line, None);
    }

    #[tokio::test]
    async fn strong_edge_is_capped_by_kelly_ceiling() {
        let bus = EventBus::new(16);
        let config = EnsembleConfig {
            kelly_ceiling: 0.05,
            ..EnsembleConfig::default()
        };
        let mut engine = EnsembleEngine::new(config, bus);
        engine.register(Fixed::ok("a", 35.0, 0.95, vec![]), 1.0);
        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        assert!(opp.expected_value > 0.3);
        assert_relative_eq!(opp.kelly_fraction, 0.05, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn publishes_generated_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe(topics::PREDICTION_GENERATED);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus);
        engine.register(Fixed::ok("a", 22.0, 0.8, vec![]), 1.0);
        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, BusPayload::Opportunity(opp));
    }

    #[tokio::test]
    async fn gated_producer_skipped_when_feature_off() {
        let bus = EventBus::new(16);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus);
        engine
            .register(Fixed::ok("base", 20.0, 0.6, vec![]), 1.0)
            .register_gated(Fixed::ok("beta", 40.0, 0.9, vec![]), 1.0, "beta_model");

        let mut gate = FeatureGate::new();
        gate.register_feature(Feature {
            id: "beta_model".into(),
            enabled: false,
            rollout_percentage: 100.0,
            dependencies: vec![],
            tags: vec![],
            metadata: BTreeMap::new(),
        })
        .unwrap();
        let opp = engine.generate_gated(&ctx_with_line(20.0), &gate).await.unwrap();
        assert_eq!(opp.metadata.contributors, vec!["base".to_string()]);
        assert_relative_eq!(opp.metadata.coverage, 1.0);

        // Ungated path runs both.
        let opp = engine.generate(&ctx_with_line(20.0)).await.unwrap();
        assert_eq!(opp.metadata.contributors.len(), 2);
    }

    #[test]
    fn combine_rejects_empty_input() {
        assert!(combine(&[]).is_none());
    }
}
