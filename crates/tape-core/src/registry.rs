use std::collections::BTreeMap;

use crate::capability::{DatasetFactory, Metric, ModelFamily, SaveCallback};
use crate::error::{CapabilityClass, RegistryError};

pub type Result<T> = std::result::Result<T, RegistryError>;

struct Table<V> {
    class: CapabilityClass,
    entries: BTreeMap<String, V>,
}

impl<V> Table<V> {
    fn new(class: CapabilityClass) -> Self {
        Self {
            class,
            entries: BTreeMap::new(),
        }
    }

    fn register(&mut self, name: String, value: V) -> Result<()> {
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateName {
                class: self.class,
                name,
            });
        }
        self.entries.insert(name, value);
        Ok(())
    }

    fn get(&self, name: &str) -> Result<&V> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownName {
                class: self.class,
                name: name.to_string(),
                known: self.entries.keys().cloned().collect(),
            })
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn model_key(model_type: &str, task: &str) -> String {
    format!("{}/{}", model_type, task)
}

/// Name → implementation tables for every capability class.
///
/// Populated once at startup; lookups of unknown names and repeated
/// registrations fail without touching existing entries.
pub struct Registry {
    models: Table<Box<dyn ModelFamily>>,
    datasets: Table<Box<dyn DatasetFactory>>,
    metrics: Table<Box<dyn Metric>>,
    callbacks: Table<Box<dyn SaveCallback>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            models: Table::new(CapabilityClass::Model),
            datasets: Table::new(CapabilityClass::Dataset),
            metrics: Table::new(CapabilityClass::Metric),
            callbacks: Table::new(CapabilityClass::SaveCallback),
        }
    }

    pub fn register_model(
        &mut self,
        model_type: &str,
        task: &str,
        family: impl ModelFamily + 'static,
    ) -> Result<()> {
        self.models
            .register(model_key(model_type, task), Box::new(family))
    }

    pub fn register_dataset(
        &mut self,
        task: &str,
        factory: impl DatasetFactory + 'static,
    ) -> Result<()> {
        self.datasets.register(task.to_string(), Box::new(factory))
    }

    pub fn register_metric(&mut self, name: &str, metric: impl Metric + 'static) -> Result<()> {
        self.metrics.register(name.to_string(), Box::new(metric))
    }

    pub fn register_callback(
        &mut self,
        name: &str,
        callback: impl SaveCallback + 'static,
    ) -> Result<()> {
        self.callbacks.register(name.to_string(), Box::new(callback))
    }

    pub fn model(&self, model_type: &str, task: &str) -> Result<&dyn ModelFamily> {
        self.models
            .get(&model_key(model_type, task))
            .map(|m| &**m)
    }

    pub fn dataset(&self, task: &str) -> Result<&dyn DatasetFactory> {
        self.datasets.get(task).map(|d| &**d)
    }

    pub fn metric(&self, name: &str) -> Result<&dyn Metric> {
        self.metrics.get(name).map(|m| &**m)
    }

    pub fn callback(&self, name: &str) -> Result<&dyn SaveCallback> {
        self.callbacks.get(name).map(|c| &**c)
    }

    /// Distinct model families, in name order.
    pub fn model_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .models
            .names()
            .filter_map(|key| key.split('/').next())
            .map(str::to_string)
            .collect();
        types.dedup();
        types
    }

    pub fn tasks(&self) -> Vec<String> {
        self.datasets.names().map(str::to_string).collect()
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.names().map(str::to_string).collect()
    }

    pub fn callback_names(&self) -> Vec<String> {
        self.callbacks.names().map(str::to_string).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
