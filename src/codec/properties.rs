//! # Property Registry
//!
//! Ordered registry of property providers merged into every event:
//! preset properties first, then registered providers in registration
//! order, then the caller's own properties.
//!
//! Each provider declares a [`MergePolicy`]. Caller properties always
//! override. Every override of an existing key is logged at debug level so
//! no key is replaced silently.

use crate::types::{LIB_NAME, LIB_VERSION};
use log::debug;
use serde_json::{Map, Value};

/// How a provider's keys interact with keys already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Replace existing values
    Override,
    /// Only fill keys that are not set yet
    KeepExisting,
}

/// A property provider, invoked once per event on the ingestion worker.
pub type PropertyProvider = Box<dyn Fn() -> Map<String, Value> + Send + Sync>;

struct Registration {
    name: String,
    provider: PropertyProvider,
    policy: MergePolicy,
}

pub struct PropertyRegistry {
    presets: Map<String, Value>,
    providers: Vec<Registration>,
}

impl std::fmt::Debug for PropertyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyRegistry")
            .field("presets", &self.presets)
            .field(
                "providers",
                &self.providers.iter().map(|r| &r.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for PropertyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyRegistry {
    /// Registry seeded with the agent's preset properties.
    pub fn new() -> Self {
        Self {
            presets: preset_properties(),
            providers: Vec::new(),
        }
    }

    /// Registry without presets.
    pub fn empty() -> Self {
        Self {
            presets: Map::new(),
            providers: Vec::new(),
        }
    }

    /// Add or replace a preset (device-level) property.
    pub fn insert_preset(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.presets.insert(key.into(), value.into());
    }

    pub fn presets(&self) -> &Map<String, Value> {
        &self.presets
    }

    /// Append a provider. Providers run in registration order.
    pub fn register<F>(&mut self, name: impl Into<String>, policy: MergePolicy, provider: F)
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        self.providers.push(Registration {
            name: name.into(),
            provider: Box::new(provider),
            policy,
        });
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Merge presets, providers and the caller's properties.
    pub fn merge(&self, caller: Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.presets.clone();

        for registration in &self.providers {
            let contributed = (registration.provider)();
            merge_into(
                &mut merged,
                contributed,
                registration.policy,
                &registration.name,
            );
        }

        merge_into(&mut merged, caller, MergePolicy::Override, "caller");
        merged
    }
}

fn merge_into(
    target: &mut Map<String, Value>,
    source: Map<String, Value>,
    policy: MergePolicy,
    origin: &str,
) {
    for (key, value) in source {
        if target.contains_key(&key) {
            match policy {
                MergePolicy::KeepExisting => continue,
                MergePolicy::Override => {
                    debug!("property '{}' overridden by {}", key, origin);
                }
            }
        }
        target.insert(key, value);
    }
}

fn preset_properties() -> Map<String, Value> {
    let mut presets = Map::new();
    presets.insert("$lib".to_string(), Value::from(LIB_NAME));
    presets.insert("$lib_version".to_string(), Value::from(LIB_VERSION));
    presets.insert("$os".to_string(), Value::from(std::env::consts::OS));
    presets.insert("$arch".to_string(), Value::from(std::env::consts::ARCH));
    presets
}
