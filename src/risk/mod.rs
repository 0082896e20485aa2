//! Turns validated opportunities into bounded stake recommendations against
//! the active profile and the exposure ledger.

pub mod ledger;
pub mod profile;
pub mod rules;
pub mod scoring;

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};

use crate::bus::{topics, BusPayload, EventBus};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    BetPlacement, BetSettlement, BettingOpportunity, RiskAssessment, RiskFactors, RiskLevel,
    RiskLimits, RiskMetrics, RiskViolation, ValidationResult,
};

pub use ledger::{ActiveBet, ExposureLedger};
pub use profile::{ProfileRegistry, RiskProfile};
pub use rules::{CustomRule, RuleAction, RuleScope};
pub use scoring::RiskThresholds;

use scoring::{exposure_score, max_correlation};

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub bankroll: f64,
    /// Global scalar applied to every max stake
    pub kelly_multiplier: f64,
    /// Assessments retained for lookup by id
    pub assessment_history: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            bankroll: 10_000.0,
            kelly_multiplier: 1.0,
            assessment_history: 1_000,
        }
    }
}

/// Stake after every cap, plus what the custom rules said about it.
struct Sizing {
    stake: f64,
    warnings: Vec<String>,
    recommendations: Vec<String>,
    violated: Vec<String>,
    blocked: bool,
}

pub struct RiskManager {
    registry: ProfileRegistry,
    ledger: ExposureLedger,
    thresholds: RiskThresholds,
    bus: EventBus,
    starting_bankroll: f64,
    assessments: HashMap<String, RiskAssessment>,
    assessment_order: VecDeque<String>,
    max_assessments: usize,
}

impl RiskManager {
    pub fn new(registry: ProfileRegistry, config: RiskConfig, bus: EventBus) -> Self {
        info!(
            "Risk manager: profile={} bankroll=${:.2} kelly_multiplier={:.2}",
            registry.active().id,
            config.bankroll,
            config.kelly_multiplier
        );
        Self {
            registry,
            ledger: ExposureLedger::new(config.bankroll, config.kelly_multiplier),
            thresholds: RiskThresholds::default(),
            bus,
            starting_bankroll: config.bankroll,
            assessments: HashMap::new(),
            assessment_order: VecDeque::new(),
            max_assessments: config.assessment_history.max(1),
        }
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn profiles_mut(&mut self) -> &mut ProfileRegistry {
        &mut self.registry
    }

    pub fn metrics(&self) -> &RiskMetrics {
        self.ledger.metrics()
    }

    pub fn assessment(&self, id: &str) -> Option<&RiskAssessment> {
        self.assessments.get(id)
    }

    /// Size an opportunity only if its validation passed.
    pub fn assess_validated(
        &mut self,
        opportunity: &BettingOpportunity,
        validation: &ValidationResult,
    ) -> PipelineResult<RiskAssessment> {
        if !validation.is_valid {
            return Err(PipelineError::InvalidPrediction {
                opportunity_id: opportunity.id.clone(),
                errors: validation.errors.len(),
            });
        }
        Ok(self.assess(opportunity))
    }

    pub fn assess(&mut self, opportunity: &BettingOpportunity) -> RiskAssessment {
        let profile = self.registry.active().clone();
        let factors = self.score_factors(opportunity, &profile);
        let risk_score = self.thresholds.overall(&factors);
        let risk_level = self.thresholds.level(risk_score);

        let mut sizing = self.size_stake(opportunity, &profile, risk_level);
        self.apply_custom_rules(opportunity, &profile, &factors, risk_score, &mut sizing);

        let mut warnings = self.threshold_warnings(opportunity, &profile, &factors);
        warnings.append(&mut sizing.warnings);
        let mut recommendations = self.recommendations(opportunity, &profile, &factors, risk_level, &sizing);
        recommendations.append(&mut sizing.recommendations);

        let assessment = RiskAssessment {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            opportunity_id: opportunity.id.clone(),
            profile_id: profile.id.clone(),
            risk_level,
            risk_score,
            max_stake: sizing.stake,
            kelly_fraction: opportunity.kelly_fraction,
            factors,
            limits: RiskLimits {
                max_exposure: profile.max_exposure,
                max_stake: profile.max_exposure_per_bet,
                min_odds: profile.min_odds,
                max_odds: profile.max_odds,
            },
            warnings,
            recommendations,
        };

        info!(
            "Risk {}/{} {}: level={:?} score={:.3} max_stake=${:.0} ({} warning(s))",
            opportunity.subject_id,
            opportunity.metric,
            opportunity.side,
            risk_level,
            risk_score,
            assessment.max_stake,
            assessment.warnings.len()
        );

        if risk_level == RiskLevel::High || sizing.blocked {
            self.raise_violation(opportunity, &profile, &assessment, sizing.blocked, sizing.violated);
        }

        self.remember(assessment.clone());
        self.bus.publish(
            topics::RISK_ASSESSMENT,
            BusPayload::Assessment(assessment.clone()),
        );
        assessment
    }

    pub fn record_placement(&mut self, bet: &BetPlacement) -> PipelineResult<()> {
        self.ledger.record_placement(bet)
    }

    pub fn record_settlement(&mut self, settlement: &BetSettlement) -> PipelineResult<ActiveBet> {
        self.ledger.record_settlement(settlement)
    }

    pub fn set_bankroll(&mut self, balance: f64) {
        self.ledger.set_bankroll(balance);
    }

    fn score_factors(&self, opp: &BettingOpportunity, profile: &RiskProfile) -> RiskFactors {
        let m = self.ledger.metrics();
        let exposure = exposure_score([
            (self.ledger.subject_exposure(&opp.subject_id), profile.max_exposure_per_player),
            (self.ledger.metric_exposure(&opp.metric), profile.max_exposure_per_metric),
            (m.total_exposure, profile.max_exposure),
        ]);
        let candidate = scoring::BetKey {
            subject_id: &opp.subject_id,
            metric: &opp.metric,
            event_time: opp.event_time,
        };
        RiskFactors {
            exposure,
            confidence: self.thresholds.confidence.score(opp.confidence),
            volatility: self.thresholds.volatility.score(opp.metadata.volatility),
            correlation: max_correlation(&candidate, self.ledger.active_bets().map(ActiveBet::key))
                .clamp(0.0, 1.0),
            time_to_event: self
                .thresholds
                .time_to_event_score(opp.event_time, Utc::now()),
        }
    }

    fn size_stake(&self, opp: &BettingOpportunity, profile: &RiskProfile, level: RiskLevel) -> Sizing {
        let m = self.ledger.metrics();
        let per_bet = profile.max_exposure_per_bet;

        let mut stake = per_bet * level.stake_scale();
        stake = stake.min(m.bankroll.max(0.0) * profile.bankroll_percentage);
        stake = stake
            .min(profile.max_exposure - m.total_exposure)
            .min(profile.max_exposure_per_player - self.ledger.subject_exposure(&opp.subject_id))
            .min(profile.max_exposure_per_metric - self.ledger.metric_exposure(&opp.metric));
        stake *= m.kelly_multiplier;
        stake = stake.min(per_bet);
        let stake = if stake.is_finite() { stake.floor().max(0.0) } else { 0.0 };

        let mut sizing = Sizing {
            stake,
            warnings: Vec::new(),
            recommendations: Vec::new(),
            violated: Vec::new(),
            blocked: false,
        };

        if opp.odds < profile.min_odds || opp.odds > profile.max_odds {
            sizing.stake = 0.0;
            sizing.blocked = true;
            sizing.violated.push("odds_range".to_string());
            sizing.warnings.push(format!(
                "Odds {:+} outside profile range [{:+}, {:+}]",
                opp.odds, profile.min_odds, profile.max_odds
            ));
        }
        sizing
    }

    fn rule_scope(
        &self,
        opp: &BettingOpportunity,
        factors: &RiskFactors,
        risk_score: f64,
        stake: f64,
    ) -> RuleScope {
        let m = self.ledger.metrics();
        let mut scope = RuleScope::new();
        scope
            .set("exposure", factors.exposure)
            .set("confidence", factors.confidence)
            .set("volatility", factors.volatility)
            .set("correlation", factors.correlation)
            .set("time_to_event", factors.time_to_event)
            .set("risk_score", risk_score)
            .set("stake", stake)
            .set("prediction_confidence", opp.confidence)
            .set("probability", opp.probability)
            .set("expected_value", opp.expected_value)
            .set("kelly_fraction", opp.kelly_fraction)
            .set("odds", f64::from(opp.odds))
            .set("coverage", opp.metadata.coverage)
            .set("bankroll", m.bankroll)
            .set("total_exposure", m.total_exposure)
            .set("subject_exposure", self.ledger.subject_exposure(&opp.subject_id))
            .set("metric_exposure", self.ledger.metric_exposure(&opp.metric))
            .set("active_bets", m.active_bets as f64)
            .set("profit_loss", m.profit_loss)
            .set("roi", m.roi)
            .set("win_rate", m.win_rate);
        scope
    }

    /// Each rule is evaluated on its own; a broken rule becomes a warning and
    /// the remaining rules still run.
    fn apply_custom_rules(
        &self,
        opp: &BettingOpportunity,
        profile: &RiskProfile,
        factors: &RiskFactors,
        risk_score: f64,
        sizing: &mut Sizing,
    ) {
        for rule in profile.custom_rules.iter().filter(|r| r.enabled) {
            let scope = self.rule_scope(opp, factors, risk_score, sizing.stake);
            let fired = match rules::evaluate(&rule.condition, &scope) {
                Ok(fired) => fired,
                Err(e) => {
                    warn!("Custom rule '{}' on profile {} failed: {}", rule.name, profile.id, e);
                    sizing
                        .warnings
                        .push(format!("Custom rule '{}' skipped: {}", rule.name, e));
                    continue;
                }
            };
            if !fired {
                continue;
            }
            match &rule.action {
                RuleAction::Warn { message } => {
                    sizing.warnings.push(format!("{}: {}", rule.name, message));
                }
                RuleAction::Recommend { message } => {
                    sizing.recommendations.push(message.clone());
                }
                RuleAction::CapStake { amount } => {
                    let capped = sizing.stake.min(amount.max(0.0)).floor();
                    if capped < sizing.stake {
                        sizing
                            .warnings
                            .push(format!("{}: stake capped at ${:.0}", rule.name, capped));
                        sizing.stake = capped;
                    }
                }
                RuleAction::Block { message } => {
                    sizing.stake = 0.0;
                    sizing.blocked = true;
                    sizing.violated.push(rule.name.clone());
                    sizing.warnings.push(format!("{}: {}", rule.name, message));
                }
            }
        }
    }

    fn threshold_warnings(
        &self,
        opp: &BettingOpportunity,
        profile: &RiskProfile,
        factors: &RiskFactors,
    ) -> Vec<String> {
        let t = &self.thresholds;
        let m = self.ledger.metrics();
        let mut warnings = Vec::new();

        if factors.exposure > t.exposure_warning {
            warnings.push(format!(
                "High exposure: {:.0}% of the tightest limit in use",
                factors.exposure * 100.0
            ));
        }
        if opp.confidence < t.medium_confidence {
            warnings.push(format!("Low prediction confidence ({:.2})", opp.confidence));
        }
        if opp.metadata.volatility >= t.high_volatility {
            warnings.push(format!(
                "High volatility in recent {} history ({:.2})",
                opp.metric, opp.metadata.volatility
            ));
        }
        if factors.correlation > t.correlation_warning {
            warnings.push(format!(
                "Highly correlated with an open bet ({:.2})",
                factors.correlation
            ));
        }
        if factors.time_to_event > t.time_to_event_warning {
            warnings.push("Event starts within the hour".to_string());
        }
        if m.active_bets >= profile.diversification.max_positions_total {
            warnings.push(format!(
                "Open positions at limit ({}/{})",
                m.active_bets, profile.diversification.max_positions_total
            ));
        }
        let on_subject = self
            .ledger
            .active_bets()
            .filter(|b| b.subject_id == opp.subject_id)
            .count();
        if on_subject >= profile.diversification.max_positions_per_market {
            warnings.push(format!(
                "Already {} open position(s) on {}",
                on_subject, opp.subject_id
            ));
        }
        if m.bankroll < profile.min_bankroll {
            warnings.push(format!(
                "Bankroll ${:.2} below minimum ${:.2}",
                m.bankroll, profile.min_bankroll
            ));
        }
        if self.starting_bankroll > 0.0 && m.profit_loss < 0.0 {
            let drawdown = -m.profit_loss / self.starting_bankroll;
            if drawdown >= profile.max_drawdown {
                warnings.push(format!(
                    "Drawdown {:.1}% exceeds profile maximum {:.1}%",
                    drawdown * 100.0,
                    profile.max_drawdown * 100.0
                ));
            }
        }
        warnings
    }

    fn recommendations(
        &self,
        opp: &BettingOpportunity,
        profile: &RiskProfile,
        factors: &RiskFactors,
        level: RiskLevel,
        sizing: &Sizing,
    ) -> Vec<String> {
        let t = &self.thresholds;
        let mut recs = Vec::new();

        if sizing.stake > 0.0 {
            recs.push(format!("Maximum recommended stake: ${:.0}", sizing.stake));
        } else {
            recs.push("Do not place this bet".to_string());
        }
        if level == RiskLevel::High {
            recs.push("Reduce position size".to_string());
            recs.push(format!(
                "Tighten stop loss to {:.0}%",
                profile.stop_loss * 100.0
            ));
        }
        if factors.correlation > t.correlation_warning {
            if profile.hedging_enabled {
                recs.push("Consider hedging correlated positions".to_string());
            } else {
                recs.push("Avoid adding correlated exposure".to_string());
            }
        }
        if opp.metadata.volatility >= t.medium_volatility {
            recs.push(format!("Monitor the {} market closely", opp.metric));
        }
        recs
    }

    fn raise_violation(
        &self,
        opp: &BettingOpportunity,
        profile: &RiskProfile,
        assessment: &RiskAssessment,
        blocked: bool,
        mut violated: Vec<String>,
    ) {
        if assessment.risk_level == RiskLevel::High {
            violated.push("risk_level".to_string());
        }
        let (severity, title) = if blocked {
            ("critical", "Bet blocked by risk profile")
        } else {
            ("warning", "High risk opportunity")
        };
        let violation = RiskViolation {
            severity: severity.to_string(),
            title: title.to_string(),
            message: format!(
                "{}/{} {} scored {:.2} under profile {}",
                opp.subject_id, opp.metric, opp.side, assessment.risk_score, profile.id
            ),
            profile_id: profile.id.clone(),
            violated_rules: violated,
            opportunity_id: opp.id.clone(),
        };
        warn!(
            "Risk violation [{}] {}: {} ({})",
            violation.severity,
            violation.title,
            violation.message,
            violation.violated_rules.join(", ")
        );
        self.bus
            .publish(topics::RISK_VIOLATION, BusPayload::RiskViolation(violation));
    }

    fn remember(&mut self, assessment: RiskAssessment) {
        self.assessment_order.push_back(assessment.id.clone());
        self.assessments.insert(assessment.id.clone(), assessment);
        while self.assessment_order.len() > self.max_assessments {
            if let Some(old) = self.assessment_order.pop_front() {
                self.assessments.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::models::{BetSide, OpportunityMetadata, Provenance, ValidationMetrics};
    use approx::assert_relative_eq;
    use chrono::Duration;
    use rules::{CmpOp, Condition};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn opportunity(subject: &str, metric: &str, confidence: f64, volatility: f64) -> BettingOpportunity {
        let now = Utc::now();
        BettingOpportunity {
            id: format!("opp-{}-{}", subject, metric),
            subject_id: subject.into(),
            metric: metric.into(),
            side: BetSide::Over,
            line: Some(20.0),
            odds: -110,
            projected_value: 22.0,
            probability: 0.6,
            confidence,
            expected_value: 0.076,
            kelly_fraction: 0.05,
            timestamp: now,
            expires_at: now + Duration::minutes(15),
            event_time: Some(now + Duration::hours(48)),
            metadata: OpportunityMetadata {
                factors: vec![],
                risk_factors: vec![],
                source: Provenance::Ensemble,
                contributors: vec!["a".into(), "b".into()],
                coverage: 1.0,
                volatility,
                market_efficiency: 0.7,
                experiment_variant: None,
            },
        }
    }

    fn manager(profile: &str, bankroll: f64) -> (RiskManager, EventBus) {
        let bus = EventBus::new(64);
        let registry = ProfileRegistry::with_defaults(profile).unwrap();
        let config = RiskConfig {
            bankroll,
            ..RiskConfig::default()
        };
        (RiskManager::new(registry, config, bus.clone()), bus)
    }

    fn drain(rx: &mut mpsc::Receiver<BusMessage>) -> Vec<BusMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn conservative_low_risk_is_capped_by_bankroll() {
        let (mut rm, _bus) = manager("conservative", 5_000.0);
        let a = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert!(a.max_stake <= 500.0);
        assert_relative_eq!(a.max_stake, 500.0);
        assert_eq!(a.recommendations[0], "Maximum recommended stake: $500");
    }

    #[test]
    fn stake_never_exceeds_per_bet_cap_or_goes_negative() {
        let bus = EventBus::new(8);
        let registry = ProfileRegistry::with_defaults("aggressive").unwrap();
        let mut rm = RiskManager::new(
            registry,
            RiskConfig {
                bankroll: 1_000_000.0,
                kelly_multiplier: 4.0,
                assessment_history: 10,
            },
            bus,
        );
        let a = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        assert_relative_eq!(a.max_stake, 5_000.0);

        // Exhaust the per-player cap; headroom goes negative, stake floors at 0.
        for i in 0..4 {
            rm.record_placement(&BetPlacement {
                id: format!("b{}", i),
                subject_id: "P1".into(),
                metric: "assists".into(),
                stake: 1_000.0,
                event_time: None,
            })
            .unwrap();
        }
        let a = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        assert_relative_eq!(a.max_stake, 0.0);
        assert!(a.recommendations.iter().any(|r| r == "Do not place this bet"));
    }

    #[test]
    fn headroom_shrinks_stake() {
        let (mut rm, _bus) = manager("moderate", 100_000.0);
        rm.record_placement(&BetPlacement {
            id: "b1".into(),
            subject_id: "P1".into(),
            metric: "rebounds".into(),
            stake: 1_200.0,
            event_time: None,
        })
        .unwrap();
        let a = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        // Per-player cap 1500 minus 1200 already on P1.
        assert_relative_eq!(a.max_stake, 300.0);
        assert!(a.factors.exposure > 0.79);
    }

    #[test]
    fn risky_opportunity_scales_down_and_raises_violation() {
        let (mut rm, bus) = manager("moderate", 100_000.0);
        let mut violations = bus.subscribe(topics::RISK_VIOLATION);
        rm.record_placement(&BetPlacement {
            id: "b1".into(),
            subject_id: "P1".into(),
            metric: "points".into(),
            stake: 1_400.0,
            event_time: Some(Utc::now() + Duration::minutes(30)),
        })
        .unwrap();

        let mut opp = opportunity("P1", "points", 0.3, 0.9);
        opp.event_time = Some(Utc::now() + Duration::minutes(20));
        let a = rm.assess(&opp);

        assert_eq!(a.risk_level, RiskLevel::High);
        assert_relative_eq!(a.factors.correlation, 1.0);
        assert!(a.max_stake <= 100.0);
        assert!(a.warnings.iter().any(|w| w.contains("Low prediction confidence")));
        assert!(a.warnings.iter().any(|w| w.contains("correlated")));
        assert!(a.recommendations.iter().any(|r| r == "Reduce position size"));
        assert!(a.recommendations.iter().any(|r| r.contains("hedging")));

        let msgs = drain(&mut violations);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].payload {
            BusPayload::RiskViolation(v) => {
                assert_eq!(v.severity, "warning");
                assert_eq!(v.profile_id, "moderate");
                assert!(v.violated_rules.contains(&"risk_level".to_string()));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn custom_rules_cap_block_and_survive_errors() {
        let (mut rm, bus) = manager("moderate", 100_000.0);
        let mut violations = bus.subscribe(topics::RISK_VIOLATION);
        rm.profiles_mut()
            .replace_rules(
                "moderate",
                vec![
                    CustomRule {
                        name: "broken".into(),
                        enabled: true,
                        condition: Condition::Compare {
                            field: "no_such_field".into(),
                            op: CmpOp::Gt,
                            value: 0.0,
                        },
                        action: RuleAction::Block {
                            message: "never".into(),
                        },
                    },
                    CustomRule {
                        name: "small_bets_only".into(),
                        enabled: true,
                        condition: Condition::Threshold {
                            field: "stake".into(),
                            limit: 250.0,
                        },
                        action: RuleAction::CapStake { amount: 250.0 },
                    },
                ],
            )
            .unwrap();

        let a = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        assert_relative_eq!(a.max_stake, 250.0);
        assert!(a.warnings.iter().any(|w| w.contains("'broken' skipped")));
        assert!(drain(&mut violations).is_empty());

        rm.profiles_mut()
            .replace_rules(
                "moderate",
                vec![CustomRule {
                    name: "block_standard_juice".into(),
                    enabled: true,
                    condition: Condition::Compare {
                        field: "odds".into(),
                        op: CmpOp::Eq,
                        value: -110.0,
                    },
                    action: RuleAction::Block {
                        message: "no -110 rebounds props".into(),
                    },
                }],
            )
            .unwrap();
        let a = rm.assess(&opportunity("P1", "rebounds", 0.9, 0.1));
        assert_relative_eq!(a.max_stake, 0.0);
        let msgs = drain(&mut violations);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].payload {
            BusPayload::RiskViolation(v) => {
                assert_eq!(v.severity, "critical");
                assert_eq!(v.violated_rules, vec!["block_standard_juice".to_string()]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn custom_rules_add_warnings_and_recommendations_when_fired() {
        let (mut rm, _bus) = manager("moderate", 100_000.0);
        let rule = |name: &str, field: &str, op: CmpOp, value: f64, action: RuleAction| CustomRule {
            name: name.into(),
            enabled: true,
            condition: Condition::Compare {
                field: field.into(),
                op,
                value,
            },
            action,
        };
        rm.profiles_mut()
            .replace_rules(
                "moderate",
                vec![
                    rule(
                        "calm_market_note",
                        "prediction_confidence",
                        CmpOp::Ge,
                        0.8,
                        RuleAction::Warn {
                            message: "confident call, check for stale lines".into(),
                        },
                    ),
                    rule(
                        "ladder_entries",
                        "odds",
                        CmpOp::Lt,
                        0.0,
                        RuleAction::Recommend {
                            message: "Split the stake across two entries".into(),
                        },
                    ),
                    rule(
                        "never_fires",
                        "prediction_confidence",
                        CmpOp::Lt,
                        0.1,
                        RuleAction::Warn {
                            message: "unreachable".into(),
                        },
                    ),
                ],
            )
            .unwrap();

        let a = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        assert!(a
            .warnings
            .iter()
            .any(|w| w == "calm_market_note: confident call, check for stale lines"));
        assert!(a
            .recommendations
            .iter()
            .any(|r| r == "Split the stake across two entries"));
        assert!(!a.warnings.iter().any(|w| w.starts_with("never_fires")));
        assert!(a.max_stake > 0.0);
    }

    #[test]
    fn odds_outside_profile_block_the_bet() {
        let (mut rm, _bus) = manager("conservative", 5_000.0);
        let mut opp = opportunity("P1", "points", 0.9, 0.1);
        opp.odds = 350;
        let a = rm.assess(&opp);
        assert_relative_eq!(a.max_stake, 0.0);
        assert!(a.warnings.iter().any(|w| w.contains("outside profile range")));
    }

    #[test]
    fn invalid_predictions_are_not_sized() {
        let (mut rm, _bus) = manager("moderate", 5_000.0);
        let opp = opportunity("P1", "points", 0.9, 0.1);
        let invalid = ValidationResult {
            is_valid: false,
            errors: vec!["value_range: out of range".into()],
            warnings: vec![],
            metrics: ValidationMetrics::default(),
            rule_context: BTreeMap::new(),
            validated_at: Utc::now(),
        };
        assert_eq!(
            rm.assess_validated(&opp, &invalid).unwrap_err(),
            PipelineError::InvalidPrediction {
                opportunity_id: opp.id.clone(),
                errors: 1
            }
        );
        let valid = ValidationResult {
            is_valid: true,
            errors: vec![],
            ..invalid
        };
        let a = rm.assess_validated(&opp, &valid).unwrap();
        assert!(rm.assessment(&a.id).is_some());
    }

    #[test]
    fn assessments_are_published_and_bounded() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe(topics::RISK_ASSESSMENT);
        let mut rm = RiskManager::new(
            ProfileRegistry::with_defaults("moderate").unwrap(),
            RiskConfig {
                assessment_history: 2,
                ..RiskConfig::default()
            },
            bus,
        );
        let first = rm.assess(&opportunity("P1", "points", 0.9, 0.1));
        rm.assess(&opportunity("P2", "points", 0.9, 0.1));
        rm.assess(&opportunity("P3", "points", 0.9, 0.1));
        assert!(rm.assessment(&first.id).is_none());
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn settlement_flows_through_the_ledger() {
        let (mut rm, _bus) = manager("moderate", 5_000.0);
        rm.record_placement(&BetPlacement {
            id: "b1".into(),
            subject_id: "P1".into(),
            metric: "points".into(),
            stake: 100.0,
            event_time: None,
        })
        .unwrap();
        rm.record_settlement(&BetSettlement {
            id: "b1".into(),
            won: false,
            profit_loss: -50.0,
        })
        .unwrap();
        let m = rm.metrics();
        assert_relative_eq!(m.total_exposure, 0.0);
        assert_relative_eq!(m.profit_loss, -50.0);
        assert_eq!(m.active_bets, 0);
    }
}
