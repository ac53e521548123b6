// ── Item factory registry ──
//
// Maps the `kind` of an item declaration to a constructor. Hives are built
// from configuration by looking kinds up here; there is no reflection.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::item::{ConstantItem, DataItem, MemoryItem};
use crate::catalogue::ServiceCatalogue;
use crate::config::ItemSpec;
use crate::error::CoreError;
use crate::proxy::{ProxyItem, RemoteConnection};

/// What constructors may reach while building an item.
#[derive(Clone)]
pub struct FactoryContext {
    pub connections: Arc<ServiceCatalogue<dyn RemoteConnection>>,
}

type Constructor =
    Box<dyn Fn(&ItemSpec, &FactoryContext) -> Result<Arc<dyn DataItem>, CoreError> + Send + Sync>;

/// Registry of item kinds.
pub struct ItemFactoryRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl Default for ItemFactoryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ItemFactoryRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry knowing `memory`, `constant` and `proxy`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", |spec, _| {
            Ok(MemoryItem::new(&spec.name, spec.initial_value.clone(), spec.attributes.clone()) as Arc<dyn DataItem>)
        });
        registry.register("constant", |spec, _| {
            Ok(ConstantItem::new(&spec.name, spec.initial_value.clone(), spec.attributes.clone())
                as Arc<dyn DataItem>)
        });
        registry.register("proxy", |spec, ctx| {
            if spec.upstreams.is_empty() {
                return Err(CoreError::validation(format!(
                    "proxy item '{}' has no upstreams",
                    spec.name
                )));
            }
            Ok(ProxyItem::new(&spec.name, &spec.upstreams, &ctx.connections) as Arc<dyn DataItem>)
        });
        registry
    }

    /// Add or replace the constructor for `kind`.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        constructor: impl Fn(&ItemSpec, &FactoryContext) -> Result<Arc<dyn DataItem>, CoreError>
        + Send
        + Sync
        + 'static,
    ) {
        self.constructors.insert(kind.into(), Box::new(constructor));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn create(&self, spec: &ItemSpec, ctx: &FactoryContext) -> Result<Arc<dyn DataItem>, CoreError> {
        let constructor = self.constructors.get(&spec.kind).ok_or_else(|| {
            CoreError::validation(format!(
                "item '{}' has unknown kind '{}' (known: {})",
                spec.name,
                spec.kind,
                self.kinds().join(", ")
            ))
        })?;
        constructor(spec, ctx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Variant;

    fn ctx() -> FactoryContext {
        FactoryContext {
            connections: ServiceCatalogue::new(),
        }
    }

    #[test]
    fn builds_known_kinds() {
        let registry = ItemFactoryRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec!["constant", "memory", "proxy"]);

        let item = registry
            .create(&ItemSpec::new("a", "memory").with_value(3), &ctx())
            .unwrap();
        assert_eq!(item.id(), "a");
        assert_eq!(item.read(), Variant::Int32(3));
    }

    #[test]
    fn unknown_kinds_and_bare_proxies_are_rejected() {
        let registry = ItemFactoryRegistry::with_defaults();
        let err = registry
            .create(&ItemSpec::new("a", "modbus"), &ctx())
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Validation { .. }));

        let err = registry
            .create(&ItemSpec::new("p", "proxy"), &ctx())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no upstreams"));
    }

    #[test]
    fn custom_kinds_can_be_added() {
        let mut registry = ItemFactoryRegistry::empty();
        registry.register("fixed", |spec, _| {
            Ok(ConstantItem::new(&spec.name, Variant::from("x"), spec.attributes.clone()) as Arc<dyn DataItem>)
        });
        let item = registry.create(&ItemSpec::new("f", "fixed"), &ctx()).unwrap();
        assert_eq!(item.read(), Variant::from("x"));
    }
}
