//! Ordered, named registry of step functions.
//!
//! Position in the registry is a step's index; "last step" is simply
//! `len() - 1`. Names are unique and map back to indices so redirects can
//! target a step by either.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepchain_types::error::RegistryError;
use stepchain_types::task::StepRef;

use super::handle::TaskHandle;
use super::outcome::StepOutcome;

/// Type-erased async step: `(input, task) -> outcome`.
pub type StepFn = Arc<dyn Fn(Value, TaskHandle) -> BoxFuture<'static, StepOutcome> + Send + Sync>;

pub struct StepRegistry {
    steps: Vec<(String, StepFn)>,
    index: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder { steps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a built registry.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(|(name, _)| name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Resolve a redirect target to an index within the registry.
    pub fn resolve(&self, step: &StepRef) -> Option<usize> {
        match step {
            StepRef::Index(i) if *i < self.steps.len() => Some(*i),
            StepRef::Index(_) => None,
            StepRef::Name(name) => self.index_of(name),
        }
    }

    pub fn get(&self, index: usize) -> Option<&StepFn> {
        self.steps.get(index).map(|(_, f)| f)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

pub struct StepRegistryBuilder {
    steps: Vec<(String, StepFn)>,
}

impl StepRegistryBuilder {
    /// Append a step. Order of calls is execution order.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, TaskHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutcome> + Send + 'static,
    {
        let step: StepFn = Arc::new(move |input, task| f(input, task).boxed());
        self.steps.push((name.into(), step));
        self
    }

    pub fn build(self) -> Result<StepRegistry, RegistryError> {
        if self.steps.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut index = HashMap::with_capacity(self.steps.len());
        for (i, (name, _)) in self.steps.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateStep(name.clone()));
            }
        }

        Ok(StepRegistry {
            steps: self.steps,
            index,
        })
    }
}
