//! Canonical validation rules, cheapest and most structural first.

use anyhow::Result;

use super::{derive_metrics, PredictionInput, PredictionOutput, RuleOutcome, ValidationRule};

fn bits_key(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:016x}", v.to_bits()))
        .collect::<Vec<_>>()
        .join(":")
}

/// Priority 1: the feature map is non-empty and every value is finite.
pub struct FeatureRule;

impl ValidationRule for FeatureRule {
    fn name(&self) -> &str {
        "feature_check"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn cache_key(&self, input: &PredictionInput, _output: &PredictionOutput) -> Option<String> {
        Some(
            input
                .features
                .iter()
                .map(|(k, v)| format!("{}={:016x}", k, v.to_bits()))
                .collect::<Vec<_>>()
                .join(";"),
        )
    }

    fn evaluate(&self, input: &PredictionInput, _output: &PredictionOutput) -> Result<RuleOutcome> {
        if input.features.is_empty() {
            return Ok(RuleOutcome::invalid("feature map is empty"));
        }
        let bad: Vec<String> = input
            .features
            .iter()
            .filter(|(_, v)| !v.is_finite())
            .map(|(k, v)| format!("feature '{}' is not a finite number ({})", k, v))
            .collect();
        if bad.is_empty() {
            Ok(RuleOutcome::valid()
                .with_context(format!("{} feature(s) checked", input.features.len())))
        } else {
            Ok(RuleOutcome {
                is_valid: false,
                errors: bad,
                warnings: Vec::new(),
                context: None,
            })
        }
    }
}

/// Priority 2: the predicted value is finite and inside the domain range.
pub struct RangeRule {
    min: f64,
    max: f64,
}

impl RangeRule {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Default for RangeRule {
    fn default() -> Self {
        Self::new(0.0, 1.0)
    }
}

impl ValidationRule for RangeRule {
    fn name(&self) -> &str {
        "value_range"
    }

    fn priority(&self) -> u32 {
        2
    }

    fn cache_key(&self, _input: &PredictionInput, output: &PredictionOutput) -> Option<String> {
        Some(bits_key(&[output.value]))
    }

    fn evaluate(&self, _input: &PredictionInput, output: &PredictionOutput) -> Result<RuleOutcome> {
        if !output.value.is_finite() {
            return Ok(RuleOutcome::invalid(format!(
                "predicted value is not a finite number ({})",
                output.value
            )));
        }
        if output.value < self.min || output.value > self.max {
            return Ok(RuleOutcome::invalid(format!(
                "predicted value {:.4} outside [{}, {}]",
                output.value, self.min, self.max
            )));
        }
        Ok(RuleOutcome::valid())
    }
}

/// Priority 3: confidence is a finite probability; low confidence only warns.
pub struct ConfidenceRule {
    min_confidence: f64,
}

impl ConfidenceRule {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }
}

impl ValidationRule for ConfidenceRule {
    fn name(&self) -> &str {
        "confidence_check"
    }

    fn priority(&self) -> u32 {
        3
    }

    fn cache_key(&self, _input: &PredictionInput, output: &PredictionOutput) -> Option<String> {
        Some(bits_key(&[output.confidence]))
    }

    fn evaluate(&self, _input: &PredictionInput, output: &PredictionOutput) -> Result<RuleOutcome> {
        let c = output.confidence;
        if !c.is_finite() || !(0.0..=1.0).contains(&c) {
            return Ok(RuleOutcome::invalid(format!(
                "confidence {} is not a probability",
                c
            )));
        }
        if c < self.min_confidence {
            return Ok(RuleOutcome::valid().with_warning(format!(
                "confidence {:.3} below minimum {:.3}",
                c, self.min_confidence
            )));
        }
        Ok(RuleOutcome::valid())
    }
}

/// Priority 4: advisory freshness and signal-quality checks. Never blocks.
pub struct MetadataRule {
    max_data_age_secs: f64,
    min_freshness: f64,
    min_signal_quality: f64,
}

impl MetadataRule {
    pub fn new(max_data_age_secs: f64, min_freshness: f64, min_signal_quality: f64) -> Self {
        Self {
            max_data_age_secs,
            min_freshness,
            min_signal_quality,
        }
    }
}

impl ValidationRule for MetadataRule {
    fn name(&self) -> &str {
        "metadata_advisory"
    }

    fn priority(&self) -> u32 {
        4
    }

    fn evaluate(&self, input: &PredictionInput, output: &PredictionOutput) -> Result<RuleOutcome> {
        let m = derive_metrics(input, output, self.max_data_age_secs, chrono::Utc::now());
        let mut outcome = RuleOutcome::valid().with_context(format!(
            "freshness={:.3} signal_quality={:.3}",
            m.data_freshness, m.signal_quality
        ));
        if m.data_freshness < self.min_freshness {
            outcome = outcome.with_warning(format!(
                "data freshness {:.2} below {:.2}",
                m.data_freshness, self.min_freshness
            ));
        }
        if m.signal_quality < self.min_signal_quality {
            outcome = outcome.with_warning(format!(
                "signal quality {:.2} below {:.2}",
                m.signal_quality, self.min_signal_quality
            ));
        }
        Ok(outcome)
    }
}

/// Ad-hoc rule built from a closure.
pub struct FnRule<F> {
    name: String,
    priority: u32,
    check: F,
}

impl<F> FnRule<F>
where
    F: Fn(&PredictionInput, &PredictionOutput) -> Result<RuleOutcome> + Send + Sync,
{
    pub fn new(name: &str, priority: u32, check: F) -> Self {
        Self {
            name: name.to_string(),
            priority,
            check,
        }
    }
}

impl<F> ValidationRule for FnRule<F>
where
    F: Fn(&PredictionInput, &PredictionOutput) -> Result<RuleOutcome> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn evaluate(&self, input: &PredictionInput, output: &PredictionOutput) -> Result<RuleOutcome> {
        (self.check)(input, output)
    }
}
