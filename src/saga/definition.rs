use crate::saga::error::{SagaError, SagaResult};
use crate::saga::step::{SagaData, SagaStep};
use std::collections::HashSet;
use std::sync::Arc;

/// Named, ordered list of steps
pub struct SagaDefinition<D: SagaData> {
    name: String,
    steps: Vec<Arc<dyn SagaStep<D>>>,
}

impl<D: SagaData> SagaDefinition<D> {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder<D> {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep<D>>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<D: SagaData> std::fmt::Debug for SagaDefinition<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`SagaDefinition`]
pub struct SagaDefinitionBuilder<D: SagaData> {
    name: String,
    steps: Vec<Arc<dyn SagaStep<D>>>,
}

impl<D: SagaData> SagaDefinitionBuilder<D> {
    /// Append a step; steps run in the order they are added
    pub fn step(mut self, step: impl SagaStep<D> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn SagaStep<D>>) -> Self {
        self.steps.push(step);
        self
    }

    /// Step names must be unique; checkpoints refer to steps by name
    pub fn build(self) -> SagaResult<SagaDefinition<D>> {
        if self.name.is_empty() {
            return Err(SagaError::InvalidDefinition("saga name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name().to_string()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{}' has duplicate step '{}'",
                    self.name,
                    step.name()
                )));
            }
        }

        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
        })
    }
}
