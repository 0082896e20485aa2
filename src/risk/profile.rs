use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};

use super::rules::CustomRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiversificationLimits {
    /// Open bets allowed on a single subject
    pub max_positions_per_market: usize,
    pub max_positions_total: usize,
    pub min_diversification_score: f64,
}

/// Limits and preferences the risk manager sizes against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub id: String,
    pub name: String,
    /// Cap on total open exposure (USD)
    pub max_exposure: f64,
    /// Cap on a single stake (USD)
    pub max_exposure_per_bet: f64,
    /// Cap on open exposure to one subject (USD)
    pub max_exposure_per_player: f64,
    /// Cap on open exposure to one metric (USD)
    pub max_exposure_per_metric: f64,
    /// Cap on a single stake as a fraction of bankroll
    pub bankroll_percentage: f64,
    /// Warn when the bankroll drops below this (USD)
    pub min_bankroll: f64,
    pub max_drawdown: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub min_odds: i32,
    pub max_odds: i32,
    pub tolerance: ToleranceLevel,
    pub hedging_enabled: bool,
    pub diversification: DiversificationLimits,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
}

impl RiskProfile {
    pub fn conservative() -> Self {
        Self {
            id: "conservative".into(),
            name: "Conservative".into(),
            max_exposure: 2_500.0,
            max_exposure_per_bet: 1_000.0,
            max_exposure_per_player: 750.0,
            max_exposure_per_metric: 1_000.0,
            bankroll_percentage: 0.1,
            min_bankroll: 1_000.0,
            max_drawdown: 0.1,
            stop_loss: 0.05,
            take_profit: 0.1,
            min_odds: -200,
            max_odds: 200,
            tolerance: ToleranceLevel::Low,
            hedging_enabled: true,
            diversification: DiversificationLimits {
                max_positions_per_market: 2,
                max_positions_total: 10,
                min_diversification_score: 0.6,
            },
            custom_rules: Vec::new(),
        }
    }

    pub fn moderate() -> Self {
        Self {
            id: "moderate".into(),
            name: "Moderate".into(),
            max_exposure: 5_000.0,
            max_exposure_per_bet: 2_500.0,
            max_exposure_per_player: 1_500.0,
            max_exposure_per_metric: 2_000.0,
            bankroll_percentage: 0.15,
            min_bankroll: 500.0,
            max_drawdown: 0.2,
            stop_loss: 0.1,
            take_profit: 0.2,
            min_odds: -300,
            max_odds: 300,
            tolerance: ToleranceLevel::Medium,
            hedging_enabled: true,
            diversification: DiversificationLimits {
                max_positions_per_market: 3,
                max_positions_total: 20,
                min_diversification_score: 0.4,
            },
            custom_rules: Vec::new(),
        }
    }

    pub fn aggressive() -> Self {
        Self {
            id: "aggressive".into(),
            name: "Aggressive".into(),
            max_exposure: 10_000.0,
            max_exposure_per_bet: 5_000.0,
            max_exposure_per_player: 3_000.0,
            max_exposure_per_metric: 4_000.0,
            bankroll_percentage: 0.25,
            min_bankroll: 250.0,
            max_drawdown: 0.3,
            stop_loss: 0.2,
            take_profit: 0.4,
            min_odds: -500,
            max_odds: 500,
            tolerance: ToleranceLevel::High,
            hedging_enabled: false,
            diversification: DiversificationLimits {
                max_positions_per_market: 5,
                max_positions_total: 40,
                min_diversification_score: 0.2,
            },
            custom_rules: Vec::new(),
        }
    }

    fn check(&self) -> PipelineResult<()> {
        let caps = [
            self.max_exposure,
            self.max_exposure_per_bet,
            self.max_exposure_per_player,
            self.max_exposure_per_metric,
        ];
        if caps.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(PipelineError::InvalidDefinition(format!(
                "profile {} has a negative or non-finite exposure cap",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.bankroll_percentage) {
            return Err(PipelineError::InvalidDefinition(format!(
                "profile {} bankroll_percentage {} outside 0–1",
                self.id, self.bankroll_percentage
            )));
        }
        if self.min_odds > self.max_odds {
            return Err(PipelineError::InvalidDefinition(format!(
                "profile {} min_odds {} above max_odds {}",
                self.id, self.min_odds, self.max_odds
            )));
        }
        Ok(())
    }
}

/// Profiles keyed by id, one of which is active.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, RiskProfile>,
    active: String,
}

impl ProfileRegistry {
    /// Registry seeded with the three built-in profiles.
    pub fn with_defaults(active: &str) -> PipelineResult<Self> {
        let mut profiles = BTreeMap::new();
        for p in [
            RiskProfile::conservative(),
            RiskProfile::moderate(),
            RiskProfile::aggressive(),
        ] {
            profiles.insert(p.id.clone(), p);
        }
        if !profiles.contains_key(active) {
            return Err(PipelineError::UnknownProfile(active.to_string()));
        }
        Ok(Self {
            profiles,
            active: active.to_string(),
        })
    }

    pub fn active(&self) -> &RiskProfile {
        // `active` is only ever set to an id present in the map and the active
        // profile cannot be deleted.
        &self.profiles[&self.active]
    }

    pub fn get(&self, id: &str) -> PipelineResult<&RiskProfile> {
        self.profiles
            .get(id)
            .ok_or_else(|| PipelineError::UnknownProfile(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn set_active(&mut self, id: &str) -> PipelineResult<()> {
        if !self.profiles.contains_key(id) {
            return Err(PipelineError::UnknownProfile(id.to_string()));
        }
        info!("Active risk profile: {} -> {}", self.active, id);
        self.active = id.to_string();
        Ok(())
    }

    pub fn create(&mut self, profile: RiskProfile) -> PipelineResult<()> {
        if self.profiles.contains_key(&profile.id) {
            return Err(PipelineError::DuplicateProfile(profile.id));
        }
        profile.check()?;
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Replace an existing profile wholesale (custom rules included).
    pub fn update(&mut self, profile: RiskProfile) -> PipelineResult<()> {
        if !self.profiles.contains_key(&profile.id) {
            return Err(PipelineError::UnknownProfile(profile.id));
        }
        profile.check()?;
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> PipelineResult<RiskProfile> {
        if id == self.active {
            return Err(PipelineError::ActiveProfileDeletion(id.to_string()));
        }
        self.profiles
            .remove(id)
            .ok_or_else(|| PipelineError::UnknownProfile(id.to_string()))
    }

    /// Swap in a new rule set for one profile without touching its limits.
    pub fn replace_rules(&mut self, id: &str, rules: Vec<CustomRule>) -> PipelineResult<()> {
        let profile = self
            .profiles
            .get_mut(id)
            .ok_or_else(|| PipelineError::UnknownProfile(id.to_string()))?;
        info!("Profile {}: {} custom rule(s) installed", id, rules.len());
        profile.custom_rules = rules;
        Ok(())
    }
}
