//! Built-in model producers.
//!
//! Each producer looks at a different slice of the context:
//! - **Line momentum**: the posted line, nudged by movement and liquidity
//! - **Historical trend**: recency-weighted mean of the metric's history
//! - **Feature blend**: an externally supplied projection feature
//!
//! A producer returns `Ok(None)` when the context simply lacks what it needs,
//! and `Err` when something is actually wrong. The ensemble treats both as
//! "no contribution".

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Analysis, Factor, MetaAnalysis, ModelPrediction, Movement, PredictionContext,
};

/// Trait that every model producer must implement.
#[async_trait]
pub trait ModelProducer: Send + Sync {
    /// Forecast the context's metric, or `None` if this model has no opinion.
    async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>>;

    /// Human-readable name for logging and provenance.
    fn name(&self) -> &str;
}

fn factor(name: &str, weight: f64, source: &str, confidence: f64) -> Factor {
    Factor {
        name: name.to_string(),
        weight,
        source: source.to_string(),
        confidence,
    }
}

fn analysis(ctx: &PredictionContext, risk_factors: Vec<String>, efficiency: f64) -> Analysis {
    Analysis {
        risk_factors,
        meta_analysis: MetaAnalysis {
            market_efficiency: efficiency.clamp(0.0, 1.0),
            subject_id: ctx.subject_id.clone(),
            metric: ctx.metric.clone(),
        },
    }
}

// ── Line momentum ────────────────────────────────────────────────────────────
//
// Sharp money moves lines before it moves results. A line that ticks up on
// real volume is a (weak) signal the over is being bought.

/// Volume at which the market is considered fully liquid.
const LIQUID_VOLUME: f64 = 100_000.0;
/// Volume under which the line is flagged as thin.
const THIN_VOLUME: f64 = 10_000.0;

pub struct LineMomentumModel {
    name: String,
}

impl LineMomentumModel {
    pub fn new() -> Self {
        Self {
            name: "line_momentum".into(),
        }
    }
}

impl Default for LineMomentumModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProducer for LineMomentumModel {
    async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
        let Some(market) = ctx.market.as_ref() else {
            return Ok(None);
        };
        if !market.line.is_finite() || market.line < 0.0 {
            anyhow::bail!("invalid line {} for {}", market.line, ctx.subject_id);
        }

        let liquidity = (market.volume / LIQUID_VOLUME).clamp(0.0, 1.0);
        // Half a step per movement tick, scaled by how much money is behind it.
        let step = (0.05 * market.line).max(0.5);
        let value = market.line + 0.5 * step * market.movement.as_signal() * liquidity;
        let confidence = 0.55 + 0.25 * liquidity;

        let mut risk_factors = Vec::new();
        if market.volume < THIN_VOLUME {
            risk_factors.push("low_volume".to_string());
        }
        if market.movement != Movement::Stable && liquidity < 0.25 {
            risk_factors.push("unconfirmed_line_move".to_string());
        }

        Ok(Some(ModelPrediction {
            value,
            confidence,
            factors: vec![
                factor("posted_line", 0.7, &self.name, 0.9),
                factor("line_movement", 0.3, &self.name, liquidity),
            ],
            analysis: analysis(ctx, risk_factors, 0.5 + 0.4 * liquidity),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ── Historical trend ─────────────────────────────────────────────────────────
//
// Most recent game weighs 1.0, the one before 0.85, then 0.85², ...
// Confidence falls as the history gets noisier (coefficient of variation).

const TREND_DECAY: f64 = 0.85;
const TREND_MIN_POINTS: usize = 3;
const TREND_THIN_POINTS: usize = 5;
const TREND_HIGH_VARIANCE_CV: f64 = 0.35;

pub struct HistoricalTrendModel {
    name: String,
}

impl HistoricalTrendModel {
    pub fn new() -> Self {
        Self {
            name: "historical_trend".into(),
        }
    }
}

impl Default for HistoricalTrendModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Coefficient of variation of `values`, 0.0 when undefined.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean.abs() < 1e-9 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean.abs()
}

#[async_trait]
impl ModelProducer for HistoricalTrendModel {
    async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
        if ctx.history.len() < TREND_MIN_POINTS {
            return Ok(None);
        }
        let values: Vec<f64> = ctx.history.iter().map(|p| p.value).collect();
        if values.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("non-finite history value for {}", ctx.subject_id);
        }

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        let mut w = 1.0;
        for v in values.iter().rev() {
            weighted += v * w;
            weight_sum += w;
            w *= TREND_DECAY;
        }
        let value = weighted / weight_sum;

        let cv = coefficient_of_variation(&values);
        let confidence = (1.0 / (1.0 + cv)).clamp(0.1, 0.95);

        let mut risk_factors = Vec::new();
        if values.len() < TREND_THIN_POINTS {
            risk_factors.push("thin_history".to_string());
        }
        if cv > TREND_HIGH_VARIANCE_CV {
            risk_factors.push("high_variance".to_string());
        }
        if let Some(line) = ctx.line() {
            // Market and history disagreeing by more than 20% of the line.
            if line > 0.0 && ((value - line) / line).abs() > 0.2 {
                risk_factors.push("line_divergence".to_string());
            }
        }

        Ok(Some(ModelPrediction {
            value,
            confidence,
            factors: vec![
                factor("recent_form", 0.6, &self.name, confidence),
                factor("sample_size", 0.4, &self.name, (values.len() as f64 / 10.0).min(1.0)),
            ],
            analysis: analysis(ctx, risk_factors, 0.5),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ── Feature blend ────────────────────────────────────────────────────────────

pub struct FeatureBlendModel {
    name: String,
}

impl FeatureBlendModel {
    pub fn new() -> Self {
        Self {
            name: "feature_blend".into(),
        }
    }
}

impl Default for FeatureBlendModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProducer for FeatureBlendModel {
    async fn predict(&self, ctx: &PredictionContext) -> Result<Option<ModelPrediction>> {
        let projection = ctx.features.get("projection").copied();
        let season_avg = ctx.features.get("season_avg").copied();
        let value = match (projection, season_avg) {
            (Some(p), Some(s)) => 0.7 * p + 0.3 * s,
            (Some(p), None) => p,
            (None, Some(s)) => s,
            (None, None) => anyhow::bail!(
                "no projection or season_avg feature for {}/{}",
                ctx.subject_id,
                ctx.metric
            ),
        };
        let confidence = ctx
            .features
            .get("projection_confidence")
            .copied()
            .unwrap_or(0.6)
            .clamp(0.0, 1.0);

        let mut risk_factors = Vec::new();
        if projection.is_none() {
            risk_factors.push("season_average_only".to_string());
        }
        if ctx.features.get("injury_flag").is_some_and(|f| *f > 0.0) {
            risk_factors.push("injury_concern".to_string());
        }

        Ok(Some(ModelPrediction {
            value,
            confidence,
            factors: vec![factor("external_projection", 1.0, &self.name, confidence)],
            analysis: analysis(ctx, risk_factors, 0.6),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
