use serde::Serialize;

/// One lane feeding a combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreComponent {
    pub name: &'static str,
    pub weight: f64,
    pub value: Option<f64>,
}

impl ScoreComponent {
    pub fn new(name: &'static str, weight: f64, value: Option<f64>) -> Self {
        Self {
            name,
            weight,
            value,
        }
    }
}

/// Weighted mean over the components that carry a value. Absent components are
/// excluded and the remaining weights renormalized to sum to one. Returns `None`
/// when nothing is present or every present weight is zero.
pub fn combine(components: &[ScoreComponent]) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for component in components {
        let Some(value) = component.value else {
            continue;
        };
        if !value.is_finite() || !component.weight.is_finite() || component.weight <= 0.0 {
            continue;
        }
        weighted_sum += value * component.weight;
        total_weight += component.weight;
    }

    if total_weight <= 0.0 {
        return None;
    }

    Some(round2(weighted_sum / total_weight))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
