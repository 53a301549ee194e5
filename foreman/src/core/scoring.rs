//! Weighted combination of quality signal scores.

/// Score reported by one quality signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalScore {
    /// In [0, 1]; out-of-range values are clamped when combined.
    pub score: f64,
    /// Shortfalls worth telling the agent about.
    pub gaps: Vec<String>,
}

impl SignalScore {
    pub fn perfect() -> Self {
        Self {
            score: 1.0,
            gaps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScore {
    pub quality: f64,
    pub gaps: Vec<String>,
}

/// `Σ wᵢ·sᵢ / Σ wᵢ` over `(weight, score)` pairs, clamped to [0, 1].
///
/// Non-positive weights are ignored. With nothing to weigh the quality is 0.
pub fn combine(scores: Vec<(f64, SignalScore)>) -> WeightedScore {
    let mut weighted = 0.0;
    let mut total = 0.0;
    let mut gaps = Vec::new();
    for (weight, signal) in scores {
        if weight.is_nan() || weight <= 0.0 {
            continue;
        }
        weighted += weight * clamp_unit(signal.score);
        total += weight;
        gaps.extend(signal.gaps);
    }
    let quality = if total > 0.0 {
        clamp_unit(weighted / total)
    } else {
        0.0
    };
    WeightedScore { quality, gaps }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
