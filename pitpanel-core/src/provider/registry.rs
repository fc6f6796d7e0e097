use std::collections::BTreeMap;

use super::{FeatureProvider, ProviderError};

/// Feature providers by source name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn FeatureProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own name.
    pub fn register(&mut self, provider: Box<dyn FeatureProvider>) -> Result<(), ProviderError> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(ProviderError::DuplicateSource(name));
        }
        tracing::debug!(source = %name, "registered feature provider");
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, source: &str) -> Result<&dyn FeatureProvider, ProviderError> {
        self.providers
            .get(source)
            .map(|p| p.as_ref())
            .ok_or_else(|| ProviderError::UnknownSource(source.to_string()))
    }

    /// Provider for `source`, checked to serve `feature`.
    pub fn resolve(&self, source: &str, feature: &str) -> Result<&dyn FeatureProvider, ProviderError> {
        let provider = self.get(source)?;
        if !provider.supports(feature) {
            return Err(ProviderError::UnknownFeature {
                source_name: source.to_string(),
                feature: feature.to_string(),
            });
        }
        Ok(provider)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub(crate) fn providers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn FeatureProvider>> {
        self.providers.values_mut()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("sources", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
