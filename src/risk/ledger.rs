use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{BetPlacement, BetSettlement, RiskMetrics};

use super::scoring::BetKey;

/// A placed bet that has not settled yet
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveBet {
    pub id: String,
    pub subject_id: String,
    pub metric: String,
    pub stake: f64,
    pub event_time: Option<DateTime<Utc>>,
    pub placed_at: DateTime<Utc>,
}

impl ActiveBet {
    pub fn key(&self) -> BetKey<'_> {
        BetKey {
            subject_id: &self.subject_id,
            metric: &self.metric,
            event_time: self.event_time,
        }
    }
}

/// Exposure ledger. Every mutation keeps `total_exposure` and both exposure
/// maps equal to the sums over `active` for their dimension.
#[derive(Debug, Clone)]
pub struct ExposureLedger {
    metrics: RiskMetrics,
    active: BTreeMap<String, ActiveBet>,
    placed_count: u64,
    placed_stake: f64,
    settled_count: u64,
    settled_stake: f64,
    wins: u64,
}

fn add_exposure(map: &mut BTreeMap<String, f64>, key: &str, delta: f64) {
    let entry = map.entry(key.to_string()).or_insert(0.0);
    *entry += delta;
    if entry.abs() < 1e-9 {
        map.remove(key);
    }
}

impl ExposureLedger {
    pub fn new(bankroll: f64, kelly_multiplier: f64) -> Self {
        Self {
            metrics: RiskMetrics::new(bankroll, kelly_multiplier),
            active: BTreeMap::new(),
            placed_count: 0,
            placed_stake: 0.0,
            settled_count: 0,
            settled_stake: 0.0,
            wins: 0,
        }
    }

    pub fn metrics(&self) -> &RiskMetrics {
        &self.metrics
    }

    pub fn active_bets(&self) -> impl Iterator<Item = &ActiveBet> {
        self.active.values()
    }

    pub fn subject_exposure(&self, subject_id: &str) -> f64 {
        self.metrics
            .exposure_by_player
            .get(subject_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn metric_exposure(&self, metric: &str) -> f64 {
        self.metrics
            .exposure_by_metric
            .get(metric)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn record_placement(&mut self, bet: &BetPlacement) -> PipelineResult<()> {
        if self.active.contains_key(&bet.id) {
            return Err(PipelineError::DuplicateBet(bet.id.clone()));
        }
        if !bet.stake.is_finite() || bet.stake <= 0.0 {
            return Err(PipelineError::InvalidDefinition(format!(
                "bet {} has non-positive stake {}",
                bet.id, bet.stake
            )));
        }

        let m = &mut self.metrics;
        m.total_exposure += bet.stake;
        add_exposure(&mut m.exposure_by_player, &bet.subject_id, bet.stake);
        add_exposure(&mut m.exposure_by_metric, &bet.metric, bet.stake);
        m.bankroll -= bet.stake;

        self.active.insert(
            bet.id.clone(),
            ActiveBet {
                id: bet.id.clone(),
                subject_id: bet.subject_id.clone(),
                metric: bet.metric.clone(),
                stake: bet.stake,
                event_time: bet.event_time,
                placed_at: Utc::now(),
            },
        );
        self.placed_count += 1;
        self.placed_stake += bet.stake;
        self.recompute();

        info!(
            "Bet placed: {} {}/{} stake=${:.2} | exposure=${:.2} active={} bankroll=${:.2}",
            bet.id,
            bet.subject_id,
            bet.metric,
            bet.stake,
            self.metrics.total_exposure,
            self.metrics.active_bets,
            self.metrics.bankroll
        );
        Ok(())
    }

    pub fn record_settlement(&mut self, settlement: &BetSettlement) -> PipelineResult<ActiveBet> {
        let bet = self
            .active
            .remove(&settlement.id)
            .ok_or_else(|| PipelineError::UnknownBet(settlement.id.clone()))?;

        let m = &mut self.metrics;
        m.total_exposure -= bet.stake;
        if m.total_exposure.abs() < 1e-9 {
            m.total_exposure = 0.0;
        }
        add_exposure(&mut m.exposure_by_player, &bet.subject_id, -bet.stake);
        add_exposure(&mut m.exposure_by_metric, &bet.metric, -bet.stake);
        m.profit_loss += settlement.profit_loss;
        // Stake comes back along with the realised result.
        m.bankroll += bet.stake + settlement.profit_loss;

        self.settled_count += 1;
        self.settled_stake += bet.stake;
        if settlement.won {
            self.wins += 1;
        }
        self.recompute();

        info!(
            "Bet settled: {} {} pnl=${:+.2} | exposure=${:.2} active={} P&L=${:+.2}",
            bet.id,
            if settlement.won { "WON" } else { "LOST" },
            settlement.profit_loss,
            self.metrics.total_exposure,
            self.metrics.active_bets,
            self.metrics.profit_loss
        );
        Ok(bet)
    }

    pub fn set_bankroll(&mut self, balance: f64) {
        info!("Bankroll: ${:.2} -> ${:.2}", self.metrics.bankroll, balance);
        self.metrics.bankroll = balance;
    }

    fn recompute(&mut self) {
        let m = &mut self.metrics;
        m.active_bets = self.active.len();
        m.roi = if self.settled_stake > 0.0 {
            m.profit_loss / self.settled_stake
        } else {
            0.0
        };
        m.win_rate = if self.settled_count > 0 {
            self.wins as f64 / self.settled_count as f64
        } else {
            0.0
        };
        m.average_stake = if self.placed_count > 0 {
            self.placed_stake / self.placed_count as f64
        } else {
            0.0
        };
    }
}
