//! Fluent assembly of a [`Pipeline`].

use super::Pipeline;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::steps::Step;
use std::collections::HashSet;
use std::sync::Arc;

/// Collects steps in execution order and validates them on [`build`].
///
/// [`build`]: PipelineBuilder::build
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of steps added so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Appends a shared step.
    #[must_use]
    pub fn add_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn step(self, step: impl Step + 'static) -> Self {
        self.add_step(Arc::new(step))
    }

    /// Appends `step` only when `enabled`.
    #[must_use]
    pub fn step_if(self, enabled: bool, step: impl Step + 'static) -> Self {
        if enabled {
            self.step(step)
        } else {
            self
        }
    }

    /// Appends the steps of `other` after this builder's steps.
    #[must_use]
    pub fn compose(mut self, other: Self) -> Self {
        self.name = format!("{}+{}", self.name, other.name);
        self.steps.extend(other.steps);
        self
    }

    /// Validates the steps and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Fails if there are no steps or two steps share a name.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.steps.is_empty() {
            return Err(PipelineValidationError::new("Cannot build an empty pipeline")
                .with_error_info(
                    ContractErrorInfo::new(
                        "PIPELINE-EMPTY",
                        "Cannot build an empty pipeline",
                    )
                    .with_fix_hint("Add at least one step before calling build()"),
                ));
        }

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for step in &self.steps {
            if !seen.insert(step.name()) && !duplicates.iter().any(|d| d == step.name()) {
                duplicates.push(step.name().to_string());
            }
        }
        if !duplicates.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "duplicate step names: {}",
                duplicates.join(", ")
            ))
            .with_steps(duplicates)
            .with_error_info(
                ContractErrorInfo::new("PIPELINE-DUPLICATE-STEP", "Step names must be unique")
                    .with_fix_hint("Give every step instance a distinct name"),
            ));
        }

        Ok(Pipeline::new(self.name, self.steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallLog, RecordingStep};

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("iso");
        assert_eq!(builder.name(), "iso");
        assert_eq!(builder.step_count(), 0);
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("iso").build().unwrap_err();
        assert_eq!(err.error_info.unwrap().code, "PIPELINE-EMPTY");
    }

    #[test]
    fn test_builder_rejects_duplicate_names() {
        let log = CallLog::new();
        let err = PipelineBuilder::new("iso")
            .step(RecordingStep::new("connect", &log))
            .step(RecordingStep::new("power_on", &log))
            .step(RecordingStep::new("connect", &log))
            .build()
            .unwrap_err();

        assert_eq!(err.steps, vec!["connect"]);
        assert_eq!(err.error_info.unwrap().code, "PIPELINE-DUPLICATE-STEP");
    }

    #[test]
    fn test_step_if_and_compose() {
        let log = CallLog::new();
        let first = PipelineBuilder::new("a")
            .step(RecordingStep::new("one", &log))
            .step_if(false, RecordingStep::new("skipped", &log));
        let second = PipelineBuilder::new("b").step(RecordingStep::new("two", &log));

        let pipeline = first.compose(second).build().unwrap();

        assert_eq!(pipeline.name(), "a+b");
        assert_eq!(pipeline.step_names(), vec!["one", "two"]);
    }
}
