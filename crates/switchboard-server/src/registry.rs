//! Service registration: services, method bindings, and the registry the
//! dispatcher arms its slots from.
//!
//! A service registers each of its methods exactly once during `on_init`;
//! after setup the registry is read-only and shared across workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use switchboard_transport::{MethodDescriptor, MethodKind};

use crate::context::{
    BindingParam, ClientStreamContext, RpcContext, ServerStreamContext,
};
use crate::error::{Result, ServerError};
use crate::metrics::{RegistryMetrics, RegistryMetricsSnapshot};
use crate::server::ServerHandle;
use crate::slot::{
    ClientStreamBinding, ClientStreamBindingInner, ServerStreamBinding, ServerStreamBindingInner,
    SlotFactory, UnaryBinding, UnaryBindingInner,
};

/// A hosted RPC service.
///
/// `on_init` is invoked exactly once at registration and binds every
/// method the service serves. Returning `false` aborts server startup.
pub trait Service: Send + Sync {
    /// Fully-qualified service name, e.g. `test.GrpcService`.
    fn name(&self) -> &'static str;

    /// Binds the service's methods. Called exactly once.
    fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool;

    /// Whether the service is currently willing to serve. Consulted by
    /// introspection surfaces, not by the dispatch path.
    fn is_serving(&self) -> bool {
        true
    }
}

/// Collects one service's method bindings during `on_init`.
pub struct ServiceBinder {
    service_name: &'static str,
    handle: ServerHandle,
    factories: Vec<Arc<dyn SlotFactory>>,
    bound: HashSet<String>,
}

impl ServiceBinder {
    fn new(service_name: &'static str, handle: ServerHandle) -> Self {
        Self {
            service_name,
            handle,
            factories: Vec::new(),
            bound: HashSet::new(),
        }
    }

    /// Narrow handle to the hosting server, for services that need to
    /// trigger shutdown or inspect sibling services.
    pub fn server_handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    fn check_method<Req, Resp>(
        &mut self,
        desc: &MethodDescriptor<Req, Resp>,
        kind: MethodKind,
    ) -> Result<String> {
        if desc.service != self.service_name {
            return Err(ServerError::ForeignMethod {
                method: desc.full_name(),
                service: self.service_name.to_string(),
            });
        }
        if desc.kind != kind {
            return Err(ServerError::Init(format!(
                "method '{}' bound with mismatched shape",
                desc.full_name()
            )));
        }
        let full = desc.full_name();
        if !self.bound.insert(full.clone()) {
            return Err(ServerError::DuplicateMethod { name: full });
        }
        Ok(full)
    }

    /// Binds a unary method.
    pub fn bind_unary<Req, Resp>(
        &mut self,
        desc: MethodDescriptor<Req, Resp>,
        param: Option<BindingParam>,
        handler: impl Fn(&mut RpcContext, &Req, &mut Resp) + Send + Sync + 'static,
    ) -> Result<()>
    where
        Req: Send + 'static,
        Resp: Default + Send + 'static,
    {
        self.check_method(&desc, MethodKind::Unary)?;
        self.factories.push(Arc::new(UnaryBinding {
            inner: Arc::new(UnaryBindingInner {
                desc,
                handler: Box::new(handler),
                param,
            }),
        }));
        Ok(())
    }

    /// Binds a server-streaming method.
    pub fn bind_server_stream<Req, Resp>(
        &mut self,
        desc: MethodDescriptor<Req, Resp>,
        param: Option<BindingParam>,
        handler: impl Fn(&mut ServerStreamContext, &Req, &mut Resp) + Send + Sync + 'static,
    ) -> Result<()>
    where
        Req: Send + 'static,
        Resp: Default + Send + 'static,
    {
        self.check_method(&desc, MethodKind::ServerStream)?;
        self.factories.push(Arc::new(ServerStreamBinding {
            inner: Arc::new(ServerStreamBindingInner {
                desc,
                handler: Box::new(handler),
                param,
            }),
        }));
        Ok(())
    }

    /// Binds a client-streaming method.
    pub fn bind_client_stream<Req, Resp>(
        &mut self,
        desc: MethodDescriptor<Req, Resp>,
        param: Option<BindingParam>,
        handler: impl Fn(&mut ClientStreamContext, &Req, &mut Resp) + Send + Sync + 'static,
    ) -> Result<()>
    where
        Req: Default + Send + 'static,
        Resp: Default + Send + 'static,
    {
        self.check_method(&desc, MethodKind::ClientStream)?;
        self.factories.push(Arc::new(ClientStreamBinding {
            inner: Arc::new(ClientStreamBindingInner {
                desc,
                handler: Box::new(handler),
                param,
            }),
        }));
        Ok(())
    }
}

/// Narrow read-only view of one registered service.
#[derive(Clone)]
pub struct ServiceHandle {
    service: Arc<dyn Service>,
}

impl ServiceHandle {
    /// The service's fully-qualified name.
    pub fn name(&self) -> &'static str {
        self.service.name()
    }

    /// Whether the service reports itself as serving.
    pub fn is_serving(&self) -> bool {
        self.service.is_serving()
    }
}

/// All services and method bindings hosted by one server.
pub struct ServiceRegistry {
    services: HashMap<&'static str, Arc<dyn Service>>,
    factories: Vec<Arc<dyn SlotFactory>>,
    bound: HashSet<String>,
    metrics: Arc<RegistryMetrics>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            factories: Vec::new(),
            bound: HashSet::new(),
            metrics: Arc::new(RegistryMetrics::new()),
        }
    }

    /// Registers a service and runs its `on_init` exactly once.
    pub fn add_service(&mut self, service: Arc<dyn Service>, handle: &ServerHandle) -> Result<()> {
        let name = service.name();
        if self.services.contains_key(name) {
            return Err(ServerError::DuplicateService {
                name: name.to_string(),
            });
        }
        let mut binder = ServiceBinder::new(name, handle.clone());
        if !Arc::clone(&service).on_init(&mut binder) {
            return Err(ServerError::ServiceInit {
                name: name.to_string(),
            });
        }
        for factory in &binder.factories {
            let full = factory.full_name();
            if !self.bound.insert(full.clone()) {
                return Err(ServerError::DuplicateMethod { name: full });
            }
        }
        self.factories.append(&mut binder.factories);
        self.services.insert(name, service);
        Ok(())
    }

    /// Looks up a registered service by name.
    pub fn get_service(&self, name: &str) -> Option<ServiceHandle> {
        self.services.get(name).map(|service| ServiceHandle {
            service: service.clone(),
        })
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of bound methods across all services.
    pub fn binding_count(&self) -> usize {
        self.factories.len()
    }

    /// The (method, shape) table handed to the transport at bind time.
    pub fn method_table(&self) -> HashMap<String, MethodKind> {
        self.factories
            .iter()
            .map(|f| (f.full_name(), f.kind()))
            .collect()
    }

    /// Snapshot of the registry's call metrics.
    pub fn metrics(&self) -> RegistryMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_arc(&self) -> Arc<RegistryMetrics> {
        self.metrics.clone()
    }

    pub(crate) fn factories(&self) -> Vec<Arc<dyn SlotFactory>> {
        self.factories.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_transport::bincode_marshaller;

    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct Empty;

    fn unary_desc(method: &'static str) -> MethodDescriptor<Empty, Empty> {
        MethodDescriptor {
            service: "demo.Service",
            method,
            kind: MethodKind::Unary,
            req: bincode_marshaller(),
            resp: bincode_marshaller(),
        }
    }

    struct DemoService {
        healthy: bool,
    }

    impl Service for DemoService {
        fn name(&self) -> &'static str {
            "demo.Service"
        }

        fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool {
            binder
                .bind_unary(unary_desc("Noop"), None, |_ctx, _req: &Empty, _resp| {})
                .is_ok()
        }

        fn is_serving(&self) -> bool {
            self.healthy
        }
    }

    #[test]
    fn test_add_service_binds_methods() {
        let mut registry = ServiceRegistry::new();
        let handle = ServerHandle::detached();
        registry
            .add_service(Arc::new(DemoService { healthy: true }), &handle)
            .unwrap();
        assert_eq!(registry.service_count(), 1);
        assert_eq!(registry.binding_count(), 1);
        assert_eq!(
            registry.method_table().get("demo.Service/Noop"),
            Some(&MethodKind::Unary)
        );
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let mut registry = ServiceRegistry::new();
        let handle = ServerHandle::detached();
        registry
            .add_service(Arc::new(DemoService { healthy: true }), &handle)
            .unwrap();
        let err = registry
            .add_service(Arc::new(DemoService { healthy: true }), &handle)
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateService { .. }));
        assert_eq!(
            err.status_code(),
            switchboard_transport::StatusCode::InvalidArgument
        );
    }

    #[test]
    fn test_get_service_exposes_is_serving() {
        let mut registry = ServiceRegistry::new();
        let handle = ServerHandle::detached();
        registry
            .add_service(Arc::new(DemoService { healthy: false }), &handle)
            .unwrap();
        let svc = registry.get_service("demo.Service").unwrap();
        assert!(!svc.is_serving());
        assert!(registry.get_service("demo.Missing").is_none());
    }

    #[test]
    fn test_foreign_method_rejected() {
        struct WrongService;
        impl Service for WrongService {
            fn name(&self) -> &'static str {
                "other.Service"
            }
            fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool {
                // Descriptor names demo.Service, binder is for other.Service.
                binder
                    .bind_unary(unary_desc("Noop"), None, |_ctx, _req: &Empty, _resp| {})
                    .is_ok()
            }
        }
        let mut registry = ServiceRegistry::new();
        let handle = ServerHandle::detached();
        let err = registry
            .add_service(Arc::new(WrongService), &handle)
            .unwrap_err();
        assert!(matches!(err, ServerError::ServiceInit { .. }));
    }

    #[test]
    fn test_duplicate_method_rejected() {
        struct DoubleService;
        impl Service for DoubleService {
            fn name(&self) -> &'static str {
                "demo.Service"
            }
            fn on_init(self: Arc<Self>, binder: &mut ServiceBinder) -> bool {
                binder
                    .bind_unary(unary_desc("Noop"), None, |_ctx, _req: &Empty, _resp| {})
                    .is_ok()
                    && binder
                        .bind_unary(unary_desc("Noop"), None, |_ctx, _req: &Empty, _resp| {})
                        .is_ok()
            }
        }
        let mut registry = ServiceRegistry::new();
        let handle = ServerHandle::detached();
        let err = registry
            .add_service(Arc::new(DoubleService), &handle)
            .unwrap_err();
        assert!(matches!(err, ServerError::ServiceInit { .. }));
    }
}
