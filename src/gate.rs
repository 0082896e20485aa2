//! Feature rollout and experiment assignment.
//!
//! Bucketing is a pure function of an identity string: the same subject always
//! lands in the same bucket for the same feature or experiment, so rollouts are
//! reproducible without persisted state. Experiment assignments are additionally
//! cached (sticky) for the lifetime of the gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// 32-bit string hash: `h = h * 31 + c` over UTF-16 code units, wrapping.
pub fn hash_identity(identity: &str) -> i32 {
    identity.encode_utf16().fold(0i32, |h, c| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(c))
    })
}

/// Bucket in [0, 100).
pub fn bucket(identity: &str) -> u32 {
    hash_identity(identity).unsigned_abs() % 100
}

pub fn in_rollout(identity: &str, percentage: f64) -> bool {
    f64::from(bucket(identity)) < percentage
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl UserContext {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub enabled: bool,
    /// 0–100
    pub rollout_percentage: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Active,
    Inactive,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audience {
    /// 0–100
    pub percentage: f64,
    /// Every listed attribute must match the user's attribute exactly
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub audience: Audience,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

/// Serialized form of a gate, loaded from the `--gate-file` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateDefinitions {
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Default)]
pub struct FeatureGate {
    features: HashMap<String, Feature>,
    experiments: HashMap<String, Experiment>,
    /// (user_id, experiment_id) -> variant_id
    assignments: HashMap<(String, String), String>,
}

impl FeatureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(defs: GateDefinitions) -> PipelineResult<Self> {
        let mut gate = Self::new();
        for feature in defs.features {
            gate.register_feature(feature)?;
        }
        for experiment in defs.experiments {
            gate.register_experiment(experiment)?;
        }
        Ok(gate)
    }

    pub fn register_feature(&mut self, feature: Feature) -> PipelineResult<()> {
        if !(0.0..=100.0).contains(&feature.rollout_percentage) {
            return Err(PipelineError::InvalidDefinition(format!(
                "feature {} rollout_percentage {} outside 0–100",
                feature.id, feature.rollout_percentage
            )));
        }
        self.features.insert(feature.id.clone(), feature);
        Ok(())
    }

    pub fn register_experiment(&mut self, experiment: Experiment) -> PipelineResult<()> {
        if experiment.variants.is_empty() {
            return Err(PipelineError::InvalidDefinition(format!(
                "experiment {} has no variants",
                experiment.id
            )));
        }
        if let Some(v) = experiment
            .variants
            .iter()
            .find(|v| !(v.weight.is_finite() && v.weight > 0.0))
        {
            return Err(PipelineError::InvalidDefinition(format!(
                "experiment {} variant {} has non-positive weight {}",
                experiment.id, v.id, v.weight
            )));
        }
        // Re-registering may change variants, so stale sticky assignments go.
        self.assignments.retain(|(_, exp), _| exp != &experiment.id);
        self.experiments.insert(experiment.id.clone(), experiment);
        Ok(())
    }

    pub fn has_feature(&self, feature_id: &str) -> bool {
        self.features.contains_key(feature_id)
    }

    /// Whether `feature_id` is on for this user: globally enabled, every
    /// dependency enabled for the same user, and the user inside the rollout.
    pub fn is_enabled(&self, feature_id: &str, ctx: &UserContext) -> PipelineResult<bool> {
        let mut visiting = HashSet::new();
        self.is_enabled_inner(feature_id, ctx, &mut visiting)
    }

    fn is_enabled_inner<'a>(
        &'a self,
        feature_id: &'a str,
        ctx: &UserContext,
        visiting: &mut HashSet<&'a str>,
    ) -> PipelineResult<bool> {
        let feature = self
            .features
            .get(feature_id)
            .ok_or_else(|| PipelineError::UnknownFeature(feature_id.to_string()))?;

        if !feature.enabled {
            return Ok(false);
        }
        // A dependency cycle can never be satisfied.
        if !visiting.insert(feature.id.as_str()) {
            debug!("Dependency cycle through feature {}", feature.id);
            return Ok(false);
        }
        for dep in &feature.dependencies {
            if !self.is_enabled_inner(dep, ctx, visiting)? {
                visiting.remove(feature.id.as_str());
                return Ok(false);
            }
        }
        visiting.remove(feature.id.as_str());

        let identity = format!("{}:{}", ctx.user_id, feature.id);
        Ok(in_rollout(&identity, feature.rollout_percentage))
    }

    /// Variant for this user, or `None` when the experiment is not running
    /// or the user is outside its audience. The first answer is sticky.
    pub fn variant_for(
        &mut self,
        experiment_id: &str,
        ctx: &UserContext,
        now: DateTime<Utc>,
    ) -> PipelineResult<Option<String>> {
        let experiment = self
            .experiments
            .get(experiment_id)
            .ok_or_else(|| PipelineError::UnknownExperiment(experiment_id.to_string()))?;

        if experiment.status != ExperimentStatus::Active {
            return Ok(None);
        }
        if experiment.starts_at.is_some_and(|start| now < start)
            || experiment.ends_at.is_some_and(|end| now >= end)
        {
            return Ok(None);
        }

        let key = (ctx.user_id.clone(), experiment.id.clone());
        if let Some(variant) = self.assignments.get(&key) {
            return Ok(Some(variant.clone()));
        }

        if !Self::in_audience(experiment, ctx) {
            return Ok(None);
        }

        let identity = format!("{}:{}", ctx.user_id, experiment.id);
        let chosen = Self::pick_variant(&experiment.variants, &identity);
        if let Some(variant) = &chosen {
            debug!(
                "Assigned {} to variant {} of {}",
                ctx.user_id, variant, experiment.id
            );
            self.assignments.insert(key, variant.clone());
        }
        Ok(chosen)
    }

    fn in_audience(experiment: &Experiment, ctx: &UserContext) -> bool {
        let filters_match = experiment
            .audience
            .filters
            .iter()
            .all(|(k, v)| ctx.attributes.get(k) == Some(v));
        let identity = format!("{}:{}", ctx.user_id, experiment.id);
        filters_match && in_rollout(&identity, experiment.audience.percentage)
    }

    /// Map the identity hash into the cumulative-weight space of `variants`.
    fn pick_variant(variants: &[Variant], identity: &str) -> Option<String> {
        let total: f64 = variants.iter().map(|v| v.weight).sum();
        if total <= 0.0 {
            return None;
        }
        let point = f64::from(hash_identity(identity).unsigned_abs() % 10_000) / 10_000.0 * total;
        let mut cumulative = 0.0;
        for v in variants {
            cumulative += v.weight;
            if point < cumulative {
                return Some(v.id.clone());
            }
        }
        variants.last().map(|v| v.id.clone())
    }
}
