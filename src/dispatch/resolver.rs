//! Service instance resolution.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A type-erased service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

/// Supplies service instances to the dispatcher, once per request.
pub trait DependencyResolver: Send + Sync + 'static {
    /// An instance of the service type `service`, or `None` if unknown.
    fn get_service(&self, service: TypeId) -> Option<ServiceInstance>;

    /// Release an instance obtained from [`get_service`](Self::get_service)
    /// after the request finished with it.
    fn terminate_service(&self, _instance: ServiceInstance) {}
}

/// Resolver backed by registered singletons and factories.
#[derive(Default)]
pub struct DefaultResolver {
    factories: HashMap<TypeId, Factory>,
}

impl DefaultResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one instance across all requests.
    pub fn singleton<S: Send + Sync + 'static>(mut self, service: S) -> Self {
        let instance: ServiceInstance = Arc::new(service);
        self.factories
            .insert(TypeId::of::<S>(), Arc::new(move || Arc::clone(&instance)));
        self
    }

    /// Build a fresh instance for every request.
    pub fn transient<S, F>(mut self, factory: F) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<S>(),
            Arc::new(move || Arc::new(factory()) as ServiceInstance),
        );
        self
    }

    pub fn contains<S: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<S>())
    }
}

impl DependencyResolver for DefaultResolver {
    fn get_service(&self, service: TypeId) -> Option<ServiceInstance> {
        self.factories.get(&service).map(|factory| factory())
    }
}
