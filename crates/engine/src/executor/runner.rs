use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value};
use stepflow_types::CapabilityResult;

/// A named unit of work invoked by workflow steps.
///
/// Capabilities receive the step's rendered `args` as an ordered mapping and
/// are responsible for validating them. Returning `Err` is treated the same
/// as an unsuccessful result whose output is the error text, so it counts as
/// a failed attempt and is subject to the step's retry policy.
pub trait Capability: Send + Sync {
    /// Short description shown by tooling that lists capabilities.
    fn description(&self) -> &str {
        ""
    }

    /// Invoke the capability with rendered arguments.
    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult>;
}

/// Adapter turning a closure into a [`Capability`].
pub struct FnCapability<F> {
    description: String,
    function: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&JsonMap<String, Value>) -> Result<CapabilityResult> + Send + Sync,
{
    pub fn new(description: impl Into<String>, function: F) -> Self {
        Self {
            description: description.into(),
            function,
        }
    }
}

impl<F> Capability for FnCapability<F>
where
    F: Fn(&JsonMap<String, Value>) -> Result<CapabilityResult> + Send + Sync,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn invoke(&self, args: &JsonMap<String, Value>) -> Result<CapabilityResult> {
        (self.function)(args)
    }
}

/// Name-keyed collection of capabilities available to a workflow run.
///
/// Iteration follows registration order.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: IndexMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `capability` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) -> &mut Self {
        self.capabilities.insert(name.into(), capability);
        self
    }

    /// Registers a closure-backed capability.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, description: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&JsonMap<String, Value>) -> Result<CapabilityResult> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnCapability::new(description, function)))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Capability>)> {
        self.capabilities.iter().map(|(name, capability)| (name.as_str(), capability))
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_list().entries(self.capabilities.keys()).finish()
    }
}
