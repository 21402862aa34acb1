// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Module factory registry.
//!
//! A name-keyed map from module kind to factory. Built-in modules register
//! through `castflow_modules::register_modules`; applications may add their
//! own before building pipelines.

use crate::error::{CastflowError, Result};
use crate::module::{Host, Module};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A factory function that creates a new module instance from an optional
/// JSON configuration. Wrapped in an Arc to make it cloneable.
pub type ModuleFactory =
    Arc<dyn Fn(Arc<dyn Host>, Option<&serde_json::Value>) -> Result<Box<dyn Module>> + Send + Sync>;

/// A serializable description of a registered module kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub kind: String,
    /// Human-readable description of what this module does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the module's configuration struct.
    pub param_schema: serde_json::Value,
}

#[derive(Clone)]
struct ModuleInfo {
    factory: ModuleFactory,
    param_schema: serde_json::Value,
    description: Option<String>,
}

/// Holds every module kind a pipeline can instantiate by name.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    info: HashMap<String, ModuleInfo>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module kind.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if the name is already taken.
    pub fn register<F>(&mut self, name: &str, param_schema: serde_json::Value, factory: F) -> Result<()>
    where
        F: Fn(Arc<dyn Host>, Option<&serde_json::Value>) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.register_info(name, ModuleInfo { factory: Arc::new(factory), param_schema, description: None })
    }

    /// Register a module kind with a description.
    pub fn register_with_description<F>(
        &mut self,
        name: &str,
        param_schema: serde_json::Value,
        description: impl Into<String>,
        factory: F,
    ) -> Result<()>
    where
        F: Fn(Arc<dyn Host>, Option<&serde_json::Value>) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.register_info(
            name,
            ModuleInfo { factory: Arc::new(factory), param_schema, description: Some(description.into()) },
        )
    }

    fn register_info(&mut self, name: &str, info: ModuleInfo) -> Result<()> {
        if self.info.contains_key(name) {
            return Err(CastflowError::DuplicateRegistration(name.to_string()));
        }
        self.info.insert(name.to_string(), info);
        Ok(())
    }

    /// Create an instance of a module by its registered name.
    ///
    /// # Errors
    ///
    /// `UnknownModule` if the name is not registered; whatever the factory
    /// returns otherwise (typically `InvalidConfig`).
    pub fn instantiate(
        &self,
        name: &str,
        host: Arc<dyn Host>,
        params: Option<&serde_json::Value>,
    ) -> Result<Box<dyn Module>> {
        self.info
            .get(name)
            .ok_or_else(|| CastflowError::UnknownModule(name.to_string()))
            .and_then(|info| (info.factory)(host, params))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.info.contains_key(name)
    }

    /// Remove a module kind. Returns true if it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.info.remove(name).is_some()
    }

    /// Definitions for all registered module kinds.
    pub fn definitions(&self) -> Vec<ModuleDefinition> {
        let mut defs: Vec<ModuleDefinition> = self
            .info
            .iter()
            .map(|(kind, info)| ModuleDefinition {
                kind: kind.clone(),
                description: info.description.clone(),
                param_schema: info.param_schema.clone(),
            })
            .collect();
        defs.sort_by(|a, b| a.kind.cmp(&b.kind));
        defs
    }
}
