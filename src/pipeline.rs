//! Drives one market update through generate → validate → assess.
//!
//! A single task owns the `Pipeline`, so every exposure read-modify-write
//! (assessment sizing, placement, settlement) is serialised through it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{topics, BusMessage, BusPayload, EventBus};
use crate::engine::EnsembleEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::{FeatureGate, UserContext};
use crate::models::{
    BankrollUpdate, BetPlacement, BetSettlement, BettingOpportunity, HistoricalPoint,
    MarketSnapshot, MarketUpdate, PredictionContext, RiskAssessment, ValidationResult,
};
use crate::risk::{RiskManager, RiskProfile};
use crate::validation::{PredictionInput, PredictionOutput, PredictionValidator};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Points of metric history kept per (subject, metric)
    pub history_window: usize,
    /// Identical updates inside this window are dropped
    pub dedup_window: ChronoDuration,
    /// Experiment whose variant is stamped on each opportunity
    pub experiment_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            dedup_window: ChronoDuration::seconds(60),
            experiment_id: None,
        }
    }
}

/// Everything one market update produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub opportunity: BettingOpportunity,
    pub validation: ValidationResult,
    /// Absent when validation failed
    pub assessment: Option<RiskAssessment>,
}

pub struct Pipeline {
    engine: EnsembleEngine,
    validator: PredictionValidator,
    risk: RiskManager,
    gate: FeatureGate,
    bus: EventBus,
    config: PipelineConfig,
    recent_update_keys: HashMap<String, DateTime<Utc>>,
    histories: HashMap<(String, String), VecDeque<HistoricalPoint>>,
    published_profile: Option<RiskProfile>,
}

impl Pipeline {
    pub fn new(
        engine: EnsembleEngine,
        validator: PredictionValidator,
        risk: RiskManager,
        gate: FeatureGate,
        bus: EventBus,
        config: PipelineConfig,
    ) -> Self {
        Self {
            engine,
            validator,
            risk,
            gate,
            bus,
            config,
            recent_update_keys: HashMap::new(),
            histories: HashMap::new(),
            published_profile: None,
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn history(&self, subject_id: &str, metric: &str) -> Vec<HistoricalPoint> {
        self.histories
            .get(&(subject_id.to_string(), metric.to_string()))
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Consume bus messages until the channel closes, publishing a metrics
    /// snapshot every `metrics_interval`.
    pub async fn run(mut self, mut rx: mpsc::Receiver<BusMessage>, metrics_interval: Duration) {
        let mut metrics_tick = tokio::time::interval(metrics_interval);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => {
                        info!("Pipeline input closed, stopping");
                        break;
                    }
                },
                _ = metrics_tick.tick() => {
                    self.publish_metrics();
                    self.log_validation_stats();
                }
            }
        }
    }

    /// Dispatch one inbound bus message. Failures are logged, never fatal.
    pub async fn handle(&mut self, msg: BusMessage) {
        let result = match &msg.payload {
            BusPayload::MarketUpdate(update) => self.on_market_update(update).await.map(|_| ()),
            BusPayload::BetPlaced(bet) => self.on_bet_placed(bet),
            BusPayload::BetSettled(settlement) => self.on_bet_settled(settlement),
            BusPayload::BankrollUpdate(update) => {
                self.on_bankroll_update(update);
                Ok(())
            }
            other => {
                debug!("Pipeline ignoring '{}' message ({:?})", msg.topic, other);
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(e @ PipelineError::NoPredictionsAvailable { .. }) => {
                error!("Error processing '{}': {}", msg.topic, e)
            }
            Err(e) if e.is_configuration() => {
                error!("Configuration error processing '{}': {}", msg.topic, e)
            }
            Err(e) => warn!("Error processing '{}': {}", msg.topic, e),
        }
    }

    /// Returns `Ok(None)` for a duplicate update.
    pub async fn on_market_update(
        &mut self,
        update: &MarketUpdate,
    ) -> PipelineResult<Option<PipelineOutcome>> {
        if self.should_skip_update(update) {
            return Ok(None);
        }
        let result = self.process_update(update).await;
        if result.is_err() {
            // Let a resend of the same update be retried inside the window.
            self.recent_update_keys.remove(&Self::update_dedup_key(update));
        }
        result.map(Some)
    }

    async fn process_update(&mut self, update: &MarketUpdate) -> PipelineResult<PipelineOutcome> {
        let history = self.merge_history(update);
        let ctx = Self::build_context(update, history);

        let mut opportunity = match self.engine.generate_gated(&ctx, &self.gate).await {
            Ok(opp) => opp,
            Err(e) => {
                self.bus.publish(
                    topics::PIPELINE_ERROR,
                    BusPayload::PipelineError {
                        stage: "ensemble".to_string(),
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };
        opportunity.metadata.experiment_variant = self.experiment_variant(&ctx);

        let input = PredictionInput {
            features: ctx.features.clone(),
            timestamp: update.timestamp,
        };
        let output = PredictionOutput {
            value: opportunity.probability,
            confidence: opportunity.confidence,
            data_freshness: None,
            signal_quality: Some(opportunity.metadata.coverage),
        };
        let validation = self.validator.validate(&input, &output)?;

        self.bus.publish(
            topics::PREDICTION_UPDATE,
            BusPayload::Opportunity(opportunity.clone()),
        );

        let assessment = if validation.is_valid {
            Some(self.risk.assess_validated(&opportunity, &validation)?)
        } else {
            info!(
                "Not sizing {}/{}: {}",
                opportunity.subject_id,
                opportunity.metric,
                validation.errors.join("; ")
            );
            None
        };

        self.publish_metrics();
        Ok(PipelineOutcome {
            opportunity,
            validation,
            assessment,
        })
    }

    pub fn on_bet_placed(&mut self, bet: &BetPlacement) -> PipelineResult<()> {
        self.risk.record_placement(bet)?;
        self.publish_metrics();
        Ok(())
    }

    pub fn on_bet_settled(&mut self, settlement: &BetSettlement) -> PipelineResult<()> {
        self.risk.record_settlement(settlement)?;
        self.publish_metrics();
        Ok(())
    }

    pub fn on_bankroll_update(&mut self, update: &BankrollUpdate) {
        self.risk.set_bankroll(update.balance);
        self.publish_metrics();
    }

    /// Publish a ledger snapshot, plus the active risk profile whenever it
    /// differs from the last one published.
    pub fn publish_metrics(&mut self) {
        self.bus.publish(
            topics::METRICS_UPDATE,
            BusPayload::Metrics(self.risk.metrics().clone()),
        );
        let profile = self.risk.profiles().active();
        if self.published_profile.as_ref() != Some(profile) {
            let profile = profile.clone();
            info!("Publishing active risk profile '{}'", profile.id);
            self.published_profile = Some(profile.clone());
            self.bus.publish(topics::RISK_PROFILE, BusPayload::Profile(profile));
        }
    }

    fn log_validation_stats(&self) {
        let stats = self.validator.stats();
        if stats.total == 0 {
            return;
        }
        info!(
            "Validation: {} checked, {} valid ({:.1}%), avg confidence {:.3}, avg freshness {:.3}",
            stats.total,
            stats.valid,
            stats.validation_rate * 100.0,
            stats.average_confidence,
            stats.average_freshness
        );
        for (rule, rs) in stats.rule_stats.iter().filter(|(_, rs)| rs.failed > 0) {
            debug!("  {}: {} passed, {} failed", rule, rs.passed, rs.failed);
        }
    }

    fn build_context(update: &MarketUpdate, history: Vec<HistoricalPoint>) -> PredictionContext {
        let mut ctx = PredictionContext::new(&update.subject_id, &update.metric)
            .with_market(MarketSnapshot {
                line: update.line,
                volume: update.volume,
                movement: update.movement,
                odds: update.odds,
            })
            .with_history(history);
        ctx.timestamp = update.timestamp;
        ctx.features = update.features.clone();
        ctx = ctx
            .with_feature("line", update.line)
            .with_feature("volume", update.volume)
            .with_feature("movement", update.movement.as_signal());
        if let Some(event_time) = update.event_time {
            ctx = ctx.with_event_time(event_time);
        }
        ctx
    }

    fn experiment_variant(&mut self, ctx: &PredictionContext) -> Option<String> {
        let experiment_id = self.config.experiment_id.as_deref()?;
        let user = UserContext::new(&ctx.subject_id).with_attribute("metric", &ctx.metric);
        match self.gate.variant_for(experiment_id, &user, Utc::now()) {
            Ok(variant) => variant,
            Err(e) => {
                warn!("Experiment lookup failed: {}", e);
                None
            }
        }
    }

    /// Fold the update's history points into the bounded per-(subject,
    /// metric) window, oldest first, one point per timestamp.
    fn merge_history(&mut self, update: &MarketUpdate) -> Vec<HistoricalPoint> {
        let window = self.config.history_window.max(1);
        let history = self
            .histories
            .entry((update.subject_id.clone(), update.metric.clone()))
            .or_default();

        // Only the newest `window` incoming points can survive the merge.
        let mut incoming: Vec<HistoricalPoint> = update
            .history
            .iter()
            .filter(|p| p.value.is_finite())
            .copied()
            .collect();
        incoming.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let skip = incoming.len().saturating_sub(window);

        for point in &incoming[skip..] {
            match history.iter_mut().find(|h| h.timestamp == point.timestamp) {
                Some(existing) => existing.value = point.value,
                None => history.push_back(*point),
            }
        }
        history
            .make_contiguous()
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        while history.len() > window {
            history.pop_front();
        }
        history.iter().copied().collect()
    }

    fn update_dedup_key(update: &MarketUpdate) -> String {
        format!(
            "{}|{:016x}|{:016x}|{:?}|{:?}",
            update.id,
            update.line.to_bits(),
            update.volume.to_bits(),
            update.movement,
            update.odds
        )
    }

    fn cleanup_update_keys(&mut self) {
        let cutoff = Utc::now() - self.config.dedup_window;
        self.recent_update_keys.retain(|_, ts| *ts >= cutoff);
        if self.recent_update_keys.len() > 100_000 {
            self.recent_update_keys.clear();
        }
    }

    fn should_skip_update(&mut self, update: &MarketUpdate) -> bool {
        self.cleanup_update_keys();
        let now = Utc::now();
        let key = Self::update_dedup_key(update);
        if let Some(prev) = self.recent_update_keys.get(&key) {
            if *prev + self.config.dedup_window >= now {
                info!("Skipping duplicate market update within dedup window: {}", key);
                return true;
            }
        }
        self.recent_update_keys.insert(key, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EnsembleConfig, ModelProducer};
    use crate::gate::{Experiment, ExperimentStatus, GateDefinitions, Variant, Audience};
    use crate::models::{Analysis, MetaAnalysis, ModelPrediction, Movement};
    use crate::risk::profile::ProfileRegistry;
    use crate::risk::RiskConfig;
    use crate::validation::ValidatorConfig;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Projects `line + offset` with fixed confidence.
    struct Offset {
        offset: f64,
        confidence: f64,
    }

    #[async_trait]
    impl ModelProducer for Offset {
        async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
            let Some(line) = ctx.line() else {
                return Ok(None);
            };
            Ok(Some(ModelPrediction {
                value: line + self.offset,
                confidence: self.confidence,
                factors: vec![],
                analysis: Analysis {
                    risk_factors: vec![],
                    meta_analysis: MetaAnalysis {
                        market_efficiency: 0.6,
                        subject_id: ctx.subject_id.clone(),
                        metric: ctx.metric.clone(),
                    },
                },
            }))
        }

        fn name(&self) -> &str {
            "offset"
        }
    }

    struct Broken;

    #[async_trait]
    impl ModelProducer for Broken {
        async fn predict(&self, _ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
            anyhow::bail!("no data")
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    /// Fails its first call, then behaves like `Offset`.
    struct FlakyOnce {
        calls: AtomicUsize,
        inner: Offset,
    }

    #[async_trait]
    impl ModelProducer for FlakyOnce {
        async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("upstream timed out");
            }
            self.inner.predict(ctx).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn pipeline(producers: Vec<Arc<dyn ModelProducer>>, config: PipelineConfig) -> (Pipeline, EventBus) {
        let bus = EventBus::new(256);
        let mut engine = EnsembleEngine::new(EnsembleConfig::default(), bus.clone());
        for p in producers {
            engine.register(p, 1.0);
        }
        let validator = PredictionValidator::with_default_rules(ValidatorConfig::default(), bus.clone());
        let risk = RiskManager::new(
            ProfileRegistry::with_defaults("moderate").unwrap(),
            RiskConfig::default(),
            bus.clone(),
        );
        let gate = FeatureGate::from_definitions(GateDefinitions {
            features: vec![],
            experiments: vec![Experiment {
                id: "stake_sizing".into(),
                status: ExperimentStatus::Active,
                variants: vec![Variant {
                    id: "control".into(),
                    weight: 1.0,
                }],
                audience: Audience {
                    percentage: 100.0,
                    filters: BTreeMap::new(),
                },
                starts_at: None,
                ends_at: None,
            }],
        })
        .unwrap();
        (
            Pipeline::new(engine, validator, risk, gate, bus.clone(), config),
            bus,
        )
    }

    fn update(id: &str, line: f64) -> MarketUpdate {
        MarketUpdate {
            id: id.into(),
            subject_id: "P1".into(),
            metric: "points".into(),
            line,
            volume: 50_000.0,
            movement: Movement::Up,
            odds: Some(-110),
            event_time: Some(Utc::now() + ChronoDuration::hours(30)),
            timestamp: Utc::now(),
            history: vec![],
            features: BTreeMap::new(),
        }
    }

    fn drain_topics(rx: &mut mpsc::Receiver<BusMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.topic);
        }
        out
    }

    #[tokio::test]
    async fn update_flows_through_every_stage() {
        let (mut p, bus) = pipeline(
            vec![
                Arc::new(Offset { offset: 3.0, confidence: 0.85 }),
                Arc::new(Broken),
            ],
            PipelineConfig {
                experiment_id: Some("stake_sizing".into()),
                ..PipelineConfig::default()
            },
        );
        let mut all = bus.subscribe(topics::WILDCARD);

        let outcome = p.on_market_update(&update("u1", 20.0)).await.unwrap().unwrap();
        assert!(outcome.validation.is_valid, "{:?}", outcome.validation.errors);
        let assessment = outcome.assessment.expect("valid prediction is sized");
        assert_eq!(assessment.opportunity_id, outcome.opportunity.id);
        assert_eq!(
            outcome.opportunity.metadata.experiment_variant.as_deref(),
            Some("control")
        );
        assert!(outcome.opportunity.probability > 0.5);

        let seen = drain_topics(&mut all);
        for topic in [
            topics::PREDICTION_GENERATED,
            topics::PREDICTION_VALIDATED,
            topics::PREDICTION_UPDATE,
            topics::RISK_ASSESSMENT,
            topics::METRICS_UPDATE,
        ] {
            assert!(seen.iter().any(|t| t == topic), "missing {}", topic);
        }
    }

    #[tokio::test]
    async fn duplicate_updates_are_dropped_but_revisions_are_not() {
        let (mut p, _bus) = pipeline(
            vec![Arc::new(Offset { offset: 1.0, confidence: 0.8 })],
            PipelineConfig::default(),
        );
        assert!(p.on_market_update(&update("u1", 20.0)).await.unwrap().is_some());
        assert!(p.on_market_update(&update("u1", 20.0)).await.unwrap().is_none());
        // Same id, new line: a revision, not a duplicate.
        assert!(p.on_market_update(&update("u1", 21.5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn all_producers_failing_surfaces_an_error() {
        let (mut p, bus) = pipeline(vec![Arc::new(Broken)], PipelineConfig::default());
        let mut errors = bus.subscribe(topics::PIPELINE_ERROR);
        let err = p.on_market_update(&update("u1", 20.0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoPredictionsAvailable { .. }));
        assert_eq!(drain_topics(&mut errors), vec![topics::PIPELINE_ERROR.to_string()]);
    }

    #[tokio::test]
    async fn history_is_merged_sorted_and_bounded() {
        let (mut p, _bus) = pipeline(
            vec![Arc::new(Offset { offset: 0.0, confidence: 0.8 })],
            PipelineConfig {
                history_window: 3,
                ..PipelineConfig::default()
            },
        );
        let base = Utc::now() - ChronoDuration::days(10);
        let point = |day: i64, value: f64| HistoricalPoint {
            timestamp: base + ChronoDuration::days(day),
            value,
        };

        let mut first = update("u1", 20.0);
        first.history = vec![point(2, 22.0), point(0, 18.0), point(1, 19.0)];
        p.on_market_update(&first).await.unwrap();

        let mut second = update("u2", 20.5);
        second.history = vec![point(3, 25.0), point(2, 23.0)];
        p.on_market_update(&second).await.unwrap();

        let values: Vec<f64> = p.history("P1", "points").iter().map(|h| h.value).collect();
        assert_eq!(values, vec![19.0, 23.0, 25.0]);
    }

    #[tokio::test]
    async fn bet_lifecycle_updates_metrics() {
        let (mut p, bus) = pipeline(
            vec![Arc::new(Offset { offset: 1.0, confidence: 0.8 })],
            PipelineConfig::default(),
        );
        let mut metrics = bus.subscribe(topics::METRICS_UPDATE);
        p.handle(BusMessage {
            topic: topics::BET_PLACED.into(),
            payload: BusPayload::BetPlaced(BetPlacement {
                id: "b1".into(),
                subject_id: "P1".into(),
                metric: "points".into(),
                stake: 200.0,
                event_time: None,
            }),
            published_at: Utc::now(),
        })
        .await;
        assert_eq!(p.risk().metrics().active_bets, 1);

        p.handle(BusMessage {
            topic: topics::BET_SETTLED.into(),
            payload: BusPayload::BetSettled(BetSettlement {
                id: "b1".into(),
                won: true,
                profit_loss: 180.0,
            }),
            published_at: Utc::now(),
        })
        .await;
        p.on_bankroll_update(&BankrollUpdate { balance: 12_000.0 });

        let m = p.risk().metrics();
        assert_eq!(m.active_bets, 0);
        assert_eq!(m.win_rate, 1.0);
        assert_eq!(m.bankroll, 12_000.0);
        assert_eq!(drain_topics(&mut metrics).len(), 3);
    }

    #[tokio::test]
    async fn failed_update_can_be_resent_inside_dedup_window() {
        let flaky = FlakyOnce {
            calls: AtomicUsize::new(0),
            inner: Offset { offset: 1.0, confidence: 0.8 },
        };
        let (mut p, _bus) = pipeline(vec![Arc::new(flaky)], PipelineConfig::default());

        let err = p.on_market_update(&update("u1", 20.0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoPredictionsAvailable { .. }));
        assert!(p.on_market_update(&update("u1", 20.0)).await.unwrap().is_some());
        // Once processed, the same update is a duplicate again.
        assert!(p.on_market_update(&update("u1", 20.0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_incoming_history_keeps_only_the_newest_points() {
        let (mut p, _bus) = pipeline(
            vec![Arc::new(Offset { offset: 0.0, confidence: 0.8 })],
            PipelineConfig {
                history_window: 3,
                ..PipelineConfig::default()
            },
        );
        let base = Utc::now() - ChronoDuration::days(30);
        let mut big = update("u1", 20.0);
        big.history = (0..5_000)
            .rev()
            .map(|i| HistoricalPoint {
                timestamp: base + ChronoDuration::minutes(i),
                value: i as f64,
            })
            .collect();
        p.on_market_update(&big).await.unwrap();

        let values: Vec<f64> = p.history("P1", "points").iter().map(|h| h.value).collect();
        assert_eq!(values, vec![4_997.0, 4_998.0, 4_999.0]);
    }

    #[tokio::test]
    async fn active_profile_is_published_when_it_changes() {
        let (mut p, bus) = pipeline(
            vec![Arc::new(Offset { offset: 1.0, confidence: 0.8 })],
            PipelineConfig::default(),
        );
        let mut profiles = bus.subscribe(topics::RISK_PROFILE);

        p.publish_metrics();
        p.publish_metrics();
        p.risk.profiles_mut().set_active("aggressive").unwrap();
        p.publish_metrics();

        let ids: Vec<String> = std::iter::from_fn(|| profiles.try_recv().ok())
            .filter_map(|msg| match msg.payload {
                BusPayload::Profile(profile) => Some(profile.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["moderate".to_string(), "aggressive".to_string()]);
    }
}
