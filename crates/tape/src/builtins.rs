use std::sync::OnceLock;

use tape_core::{Registry, RegistryError};

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// A fresh registry holding every built-in model family, dataset, metric
/// and save callback.
pub fn build_registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    models::register(&mut registry)?;
    datasets::register(&mut registry)?;
    trainer::register(&mut registry)?;
    Ok(registry)
}

/// The process-wide registry, populated on first use and read-only after.
pub fn registry() -> Result<&'static Registry, RegistryError> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(registry);
    }
    let built = build_registry()?;
    Ok(REGISTRY.get_or_init(|| built))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_every_capability_class() {
        let registry = registry().unwrap();
        assert_eq!(registry.model_types(), vec!["lstm", "onehot"]);
        assert!(registry.tasks().contains(&"embed".to_string()));
        assert!(registry.model("lstm", "masked_language_modeling").is_ok());
        assert!(registry.model("onehot", "masked_language_modeling").is_err());
        assert_eq!(
            registry.metric_names(),
            vec!["accuracy", "mae", "mse", "spearmanr"]
        );
        assert_eq!(
            registry.callback_names(),
            vec!["save_embedding", "save_predictions"]
        );
    }
}
