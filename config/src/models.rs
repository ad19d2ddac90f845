//! Model catalog: the models a request may name and their context windows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct ModelSpec {
    #[validate(length(min = 1))]
    pub name: String,

    /// Maximum tokens the model accepts for a single request.
    #[validate(range(min = 1))]
    pub context_window: u32
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, context_window: u32) -> Self {
        Self {
            name: name.into(),
            context_window
        }
    }
}

pub(crate) fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("gpt-4o", 128000),
        ModelSpec::new("gpt-4o-mini", 128000),
        ModelSpec::new("gpt-4-turbo", 128000),
        ModelSpec::new("gpt-4", 8192),
        ModelSpec::new("gpt-3.5-turbo", 16385),
    ]
}

/// Lookup table over [`ModelSpec`]s. Later entries win on duplicate names.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, u32>
}

impl ModelCatalog {
    pub fn new(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: specs
                .into_iter()
                .map(|spec| (spec.name, spec.context_window))
                .collect()
        }
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn context_window(&self, model: &str) -> Option<u32> {
        self.models.get(model).copied()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for crate::config::ModelsConfig {
    fn default() -> Self {
        Self {
            catalog: default_models()
        }
    }
}
