//! The `ServiceProvider` capability: an explicit, type-keyed lookup for
//! operation dependencies, standing in for reflection-based service
//! location. The engine only ever queries this — it never registers
//! services on behalf of a host.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves operation dependencies by type.
pub trait ServiceProvider: Send + Sync {
    /// Attempt to resolve a service of type `T`.
    fn try_resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// A simple in-memory [`ServiceProvider`] backed by a type-keyed map.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete service instance.
    pub fn register<T: Send + Sync + 'static>(&mut self, service: T) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }
}

impl ServiceProvider for ServiceRegistry {
    fn try_resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&type_id).cloned()
    }
}

/// Extension helper for typed resolution against any [`ServiceProvider`].
pub trait ServiceProviderExt {
    fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>>;
}

impl<P: ServiceProvider + ?Sized> ServiceProviderExt for P {
    fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.try_resolve(TypeId::of::<T>())
            .and_then(|arc| arc.downcast::<T>().ok())
    }
}
