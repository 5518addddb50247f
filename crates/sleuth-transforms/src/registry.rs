use std::collections::HashMap;
use std::sync::Arc;

use sleuth_core::traits::Transform;
use sleuth_core::types::TransformDescriptor;

/// Registry of available transforms.
///
/// Built explicitly at startup and threaded through to whatever resolves
/// transforms by name. Registration is a deliberate bootstrap step, not
/// an import side effect.
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// Register a transform.
    pub fn register(&mut self, transform: impl Transform) {
        let name = transform.name().to_string();
        self.transforms.insert(name, Arc::new(transform));
    }

    /// Get a transform by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(name).cloned()
    }

    /// List all registered transform names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Descriptors for discovery UIs, sorted by name.
    pub fn descriptors(&self) -> Vec<TransformDescriptor> {
        let mut descriptors: Vec<TransformDescriptor> =
            self.transforms.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Create a registry with all builtin transforms registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(crate::builtin::dns::DomainResolveTransform);
        registry.register(crate::builtin::subdomains::SubdomainEnumTransform);
        registry.register(crate::builtin::whois::WhoisLookupTransform);
        registry.register(crate::builtin::geoip::IpGeolocateTransform);
        registry.register(crate::builtin::breach::BreachLookupTransform);
        registry.register(crate::builtin::wallet::WalletLookupTransform);

        registry
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
