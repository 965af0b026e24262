//! Per-job progress tracking

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Step index, step name and free-form details for a running job
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressTracker {
    pub current_step: u32,
    pub total_steps: u32,
    pub step_name: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ProgressTracker {
    pub fn new(total_steps: u32) -> Self {
        Self {
            total_steps,
            step_name: "queued".to_string(),
            ..Default::default()
        }
    }

    /// Percentage derived from the step index
    pub fn percentage(&self) -> f32 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.current_step.min(self.total_steps) as f32 / self.total_steps as f32) * 100.0
    }

    /// Move to a step
    pub fn advance(&mut self, step: u32, name: impl Into<String>) {
        self.current_step = step;
        self.step_name = name.into();
    }

    pub fn set_detail(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.details.insert(key.into(), value);
    }

    /// Force 100%
    pub fn complete(&mut self) {
        if self.total_steps == 0 {
            self.total_steps = 1;
        }
        self.current_step = self.total_steps;
        self.step_name = "complete".to_string();
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.total_steps);
    }
}
