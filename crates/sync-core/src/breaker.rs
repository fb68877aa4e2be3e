//! Per-model health tracking for the analysis backend.
//!
//! A model starts `Unknown`, becomes `Healthy` on its first successful call,
//! and becomes `Unavailable` on a permanent error (rejected key, unknown
//! model). An unavailable model is not called again for the rest of the
//! process lifetime; transient failures and rate limits leave the state
//! unchanged.

use std::collections::HashMap;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelStatus {
    #[default]
    Unknown,
    Healthy,
    Unavailable,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    models: HashMap<String, ModelStatus>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, model: &str) -> ModelStatus {
        self.models.get(model).copied().unwrap_or_default()
    }

    /// Whether a call to `model` may be attempted.
    pub fn allows(&self, model: &str) -> bool {
        self.status(model) != ModelStatus::Unavailable
    }

    pub fn record_success(&mut self, model: &str) {
        let status = self.models.entry(model.to_string()).or_default();
        if *status == ModelStatus::Unknown {
            *status = ModelStatus::Healthy;
        }
    }

    pub fn record_permanent_failure(&mut self, model: &str, reason: &str) {
        let status = self.models.entry(model.to_string()).or_default();
        if *status != ModelStatus::Unavailable {
            warn!("Model {} marked unavailable: {}", model, reason);
            *status = ModelStatus::Unavailable;
        }
    }
}
