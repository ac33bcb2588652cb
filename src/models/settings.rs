use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Weights for the employee final score. Lanes that are absent are dropped and the
/// remaining weights renormalized. `manager_kpi` only applies to manager records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringWeights {
    pub rule_based: f64,
    pub llm: f64,
    pub hr: f64,
    pub supervisor: f64,
    pub manager_kpi: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            rule_based: 0.20,
            llm: 0.20,
            hr: 0.30,
            supervisor: 0.30,
            manager_kpi: 0.30,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> AppResult<()> {
        ensure_weights(&[
            ("rule_based", self.rule_based),
            ("llm", self.llm),
            ("hr", self.hr),
            ("supervisor", self.supervisor),
            ("manager_kpi", self.manager_kpi),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerKpiWeights {
    pub team_average: f64,
    pub productivity: f64,
    pub supervision: f64,
}

impl Default for ManagerKpiWeights {
    fn default() -> Self {
        Self {
            team_average: 0.50,
            productivity: 0.30,
            supervision: 0.20,
        }
    }
}

impl ManagerKpiWeights {
    pub fn validate(&self) -> AppResult<()> {
        ensure_weights(&[
            ("team_average", self.team_average),
            ("productivity", self.productivity),
            ("supervision", self.supervision),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_attempts: usize,
    pub http_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            concurrency: 4,
            max_attempts: 3,
            http_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineSettings {
    pub dispatch: DispatchSettings,
    pub scoring: ScoringWeights,
    pub manager_kpi: ManagerKpiWeights,
}

fn ensure_weights(weights: &[(&str, f64)]) -> AppResult<()> {
    for (name, weight) in weights {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(AppError::validation(format!(
                "weight {name} must be a non-negative number"
            )));
        }
    }
    if weights.iter().all(|(_, weight)| *weight == 0.0) {
        return Err(AppError::validation("at least one weight must be positive"));
    }
    Ok(())
}
