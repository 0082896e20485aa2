/// Odds conversion, edge and capped Kelly-style sizing.
///
/// American odds → decimal odds:
///   +150 → 1 + 150/100 = 2.50
///   −110 → 1 + 100/110 ≈ 1.909
/// Implied probability is the reciprocal of decimal odds (vig included).
///
/// Stake sizing here is deliberately not the textbook Kelly optimum: the
/// fraction is `confidence · EV`, clamped to a ceiling.
use crate::models::BetSide;

/// Standard price when the market snapshot carries no odds.
pub const DEFAULT_AMERICAN_ODDS: i32 = -110;

/// Convert American odds to decimal odds. `0` is not a valid American price
/// and is treated as even money.
pub fn american_to_decimal(odds: i32) -> f64 {
    match odds {
        0 => 2.0,
        o if o > 0 => 1.0 + f64::from(o) / 100.0,
        o => 1.0 + 100.0 / f64::from(o).abs(),
    }
}

/// Market-implied probability of the posted price.
pub fn implied_probability(odds: i32) -> f64 {
    1.0 / american_to_decimal(odds)
}

/// Positive edge of the model over the market, else 0.
pub fn expected_value(model_probability: f64, market_probability: f64) -> f64 {
    (model_probability - market_probability).max(0.0)
}

/// Stake fraction `confidence · EV`, clamped to `[0, ceiling]`.
pub fn kelly_fraction(confidence: f64, expected_value: f64, ceiling: f64) -> f64 {
    if !confidence.is_finite() || !expected_value.is_finite() {
        return 0.0;
    }
    (confidence * expected_value).clamp(0.0, ceiling.max(0.0))
}

/// OVER when the projection reaches the line (ties go OVER).
pub fn side_for(projection: f64, line: f64) -> BetSide {
    if projection >= line {
        BetSide::Over
    } else {
        BetSide::Under
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Probability that `side` wins given a projection of the metric.
///
/// Projections already expressed as probabilities (inside [0, 1]) are used
/// as-is for OVER. Otherwise the distance to the line is scaled by a spread
/// of 10% of the line (at least one unit) and squashed through a logistic.
pub fn side_probability(projection: f64, line: Option<f64>, side: BetSide) -> f64 {
    let p_over = match line {
        _ if (0.0..=1.0).contains(&projection) => projection,
        Some(line) => {
            let spread = (0.1 * line.abs()).max(1.0);
            sigmoid((projection - line) / spread)
        }
        None => 0.5,
    };
    match side {
        BetSide::Over => p_over,
        BetSide::Under => 1.0 - p_over,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_american_to_decimal() {
        assert_relative_eq!(american_to_decimal(150), 2.5, epsilon = 1e-9);
        assert_relative_eq!(american_to_decimal(-200), 1.5, epsilon = 1e-9);
        assert_relative_eq!(american_to_decimal(100), 2.0, epsilon = 1e-9);
        assert_relative_eq!(american_to_decimal(0), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_implied_probability_standard_juice() {
        // -110 → 110/210
        assert_relative_eq!(implied_probability(-110), 110.0 / 210.0, epsilon = 1e-9);
        assert_relative_eq!(implied_probability(100), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_expected_value_only_positive() {
        assert_relative_eq!(expected_value(0.6, 0.5), 0.1, epsilon = 1e-9);
        assert_relative_eq!(expected_value(0.4, 0.5), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_kelly_fraction_clamped_to_ceiling() {
        assert_relative_eq!(kelly_fraction(0.8, 0.1, 0.25), 0.08, epsilon = 1e-9);
        assert_relative_eq!(kelly_fraction(1.0, 0.9, 0.25), 0.25, epsilon = 1e-9);
        assert_relative_eq!(kelly_fraction(0.5, 0.0, 0.25), 0.0, epsilon = 1e-9);
        assert_relative_eq!(kelly_fraction(f64::NAN, 0.2, 0.25), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_side_tie_goes_over() {
        assert_eq!(side_for(20.0, 20.0), BetSide::Over);
        assert_eq!(side_for(19.9, 20.0), BetSide::Under);
    }

    #[test]
    fn test_side_probability() {
        // On the line → coin flip
        assert_relative_eq!(
            side_probability(20.0, Some(20.0), BetSide::Over),
            0.5,
            epsilon = 1e-9
        );
        let over = side_probability(24.0, Some(20.0), BetSide::Over);
        let under = side_probability(24.0, Some(20.0), BetSide::Under);
        assert!(over > 0.5);
        assert_relative_eq!(over + under, 1.0, epsilon = 1e-9);
        // Probability-valued projection passes straight through
        assert_relative_eq!(side_probability(0.62, None, BetSide::Over), 0.62, epsilon = 1e-9);
    }
}
