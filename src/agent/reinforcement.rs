use rand::Rng;

/// Adjusts an agent's running relevance after it serves a query.
///
/// Toy reinforcement: the policy is pluggable and carries no quality guarantees.
pub trait ReinforcementPolicy: Send + Sync {
    fn adjust(&self, current: f64, observed: f64) -> f64;
}

/// Running relevance simply tracks the latest observation.
#[derive(Debug, Clone, Default)]
pub struct NoReinforcement;

impl ReinforcementPolicy for NoReinforcement {
    fn adjust(&self, _current: f64, observed: f64) -> f64 {
        observed
    }
}

/// Adds a uniform random reward or penalty of at most `step`.
#[derive(Debug, Clone)]
pub struct RandomReinforcement {
    pub step: f64,
}

impl Default for RandomReinforcement {
    fn default() -> Self {
        Self { step: 0.1 }
    }
}

impl ReinforcementPolicy for RandomReinforcement {
    fn adjust(&self, _current: f64, observed: f64) -> f64 {
        if !self.step.is_finite() || self.step <= 0.0 {
            return observed;
        }
        observed + rand::thread_rng().gen_range(-self.step..=self.step)
    }
}

/// Exponential moving average of observations.
#[derive(Debug, Clone)]
pub struct SmoothedReinforcement {
    pub learning_rate: f64,
}

impl Default for SmoothedReinforcement {
    fn default() -> Self {
        Self { learning_rate: 0.1 }
    }
}

impl ReinforcementPolicy for SmoothedReinforcement {
    fn adjust(&self, current: f64, observed: f64) -> f64 {
        current + self.learning_rate * (observed - current)
    }
}
