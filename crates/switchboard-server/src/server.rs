//! Server lifecycle: endpoint binding, worker startup, the supervisor
//! loop, and coordinated shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use switchboard_transport::{CompletionQueue, Endpoint, ServerTransport};

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};
use crate::metrics::RegistryMetricsSnapshot;
use crate::registry::{Service, ServiceHandle, ServiceRegistry};
use crate::slot::SlotEnv;

/// Tunables of a [`ServerCore`]. The `Default` impl documents defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker threads, each with its own completion queue (default 2).
    pub worker_count: usize,
    /// Accept slots armed per method per worker; raise above 1 for
    /// head-of-line-blocking resilience (default 1).
    pub slots_per_method_per_worker: usize,
    /// Interval between supervisor `on_run` invocations (default 1 s).
    pub run_interval: Duration,
    /// Grace window between closing the transport and stopping the
    /// workers (default 200 ms).
    pub grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            slots_per_method_per_worker: 1,
            run_interval: Duration::from_secs(1),
            grace_period: Duration::from_millis(200),
        }
    }
}

/// Application hooks around the server lifecycle.
///
/// `on_init` registers services and may adjust the builder; returning
/// `false` aborts startup. `on_run` is invoked at the configured interval
/// while the server is up. `on_error`/`on_info` carry the framework's own
/// diagnostics and default to `tracing`.
pub trait ServerHandler: Send + Sync {
    /// One-time initialization; register services here.
    fn on_init(&self, builder: &mut ServerBuilder) -> bool;

    /// Periodic supervisor callback.
    fn on_run(&self) {}

    /// Framework error reporting.
    fn on_error(&self, msg: &str) {
        error!(target: "switchboard", "{msg}");
    }

    /// Framework informational reporting.
    fn on_info(&self, msg: &str) {
        info!(target: "switchboard", "{msg}");
    }
}

struct HandleInner {
    running: AtomicBool,
    sleeper: Mutex<()>,
    wake: Condvar,
    registry: Mutex<Option<Arc<ServiceRegistry>>>,
}

/// Clone-able narrow handle to a server: shutdown, liveness, and service
/// introspection. This is the only server surface handed to services.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                running: AtomicBool::new(false),
                sleeper: Mutex::new(()),
                wake: Condvar::new(),
                registry: Mutex::new(None),
            }),
        }
    }

    /// A handle not attached to any running server. Useful for assembling
    /// registries in isolation.
    pub fn detached() -> Self {
        Self::new()
    }

    /// Requests shutdown; `run` unblocks at the next supervisor tick.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    /// Whether the server is currently serving.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Looks up a hosted service by fully-qualified name.
    pub fn get_service(&self, name: &str) -> Option<ServiceHandle> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|registry| registry.get_service(name))
    }

    /// Snapshot of the hosted registry's call metrics.
    pub fn registry_metrics(&self) -> Option<RegistryMetricsSnapshot> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|registry| registry.metrics())
    }

    fn set_running(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    fn publish_registry(&self, registry: Arc<ServiceRegistry>) {
        *self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(registry);
    }

    fn clear_registry(&self) {
        *self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn wait_tick(&self, interval: Duration) {
        let guard = self
            .inner
            .sleeper
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !self.is_running() {
            return;
        }
        let _ = self
            .inner
            .wake
            .wait_timeout(guard, interval)
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// Mutable server assembly passed to [`ServerHandler::on_init`].
pub struct ServerBuilder {
    config: ServerConfig,
    registry: ServiceRegistry,
    handle: ServerHandle,
}

impl ServerBuilder {
    fn new(config: ServerConfig, handle: ServerHandle) -> Self {
        Self {
            config,
            registry: ServiceRegistry::new(),
            handle,
        }
    }

    /// Registers a service; its `on_init` runs immediately.
    pub fn add_service(&mut self, service: Arc<dyn Service>) -> Result<()> {
        self.registry.add_service(service, &self.handle)
    }

    /// Overrides the supervisor `on_run` interval.
    pub fn set_run_interval(&mut self, interval: Duration) {
        self.config.run_interval = interval;
    }

    /// Mutable access to the full configuration.
    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Handle to the server being assembled.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }
}

/// The server: binds endpoints, arms call slots on per-worker completion
/// queues, and supervises the worker pool until shutdown.
pub struct ServerCore {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    handle: ServerHandle,
}

impl ServerCore {
    /// Creates a server around the application handler.
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        Self {
            config,
            handler,
            handle: ServerHandle::new(),
        }
    }

    /// Handle for shutdown and introspection.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Runs the server on a single TCP port. Blocks until shutdown.
    pub fn run_port(&self, port: u16) -> Result<()> {
        self.run(&[Endpoint::Port(port)])
    }

    /// Runs the server on a single endpoint URI. Blocks until shutdown.
    pub fn run_uri(&self, uri: &str) -> Result<()> {
        self.run(&[Endpoint::from(uri)])
    }

    /// Runs the server on the given endpoints. Blocks until shutdown.
    pub fn run(&self, endpoints: &[Endpoint]) -> Result<()> {
        let mut builder = ServerBuilder::new(self.config.clone(), self.handle.clone());
        if !self.handler.on_init(&mut builder) {
            self.handler.on_error("server initialization failed");
            return Err(ServerError::Init("on_init returned false".to_string()));
        }
        let ServerBuilder {
            config, registry, ..
        } = builder;

        if registry.service_count() == 0 {
            self.handler
                .on_error("server initialization failed: no services registered");
            return Err(ServerError::NoServices);
        }
        if registry.binding_count() == 0 {
            self.handler
                .on_error("server initialization failed: no RPC request registered");
            return Err(ServerError::NoBindings);
        }

        let mut uris = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            endpoint.validate()?;
            let uri = endpoint.uri();
            self.handler.on_info(&format!("addressUri = '{uri}'"));
            uris.push(uri);
        }

        let transport = ServerTransport::bind(&uris, registry.method_table())?;
        let registry = Arc::new(registry);
        self.handle.publish_registry(registry.clone());

        let workers_running = Arc::new(AtomicBool::new(true));
        let worker_count = config.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let env = SlotEnv {
                transport: transport.clone(),
                cq: Arc::new(CompletionQueue::new()),
                hooks: self.handler.clone(),
                metrics: registry.metrics_arc(),
            };
            let dispatcher = Dispatcher::new(env, workers_running.clone(), index);
            let factories = registry.factories();
            let slots_per_method = config.slots_per_method_per_worker;
            let thread = thread::Builder::new()
                .name(format!("switchboard-worker-{index}"))
                .spawn(move || dispatcher.run(factories, slots_per_method));
            match thread {
                Ok(thread) => workers.push(thread),
                Err(e) => {
                    transport.shutdown();
                    workers_running.store(false, Ordering::SeqCst);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    self.handle.clear_registry();
                    return Err(ServerError::Init(format!("failed to spawn worker: {e}")));
                }
            }
        }
        self.handler.on_info(&format!(
            "server is running with {} worker threads",
            workers.len()
        ));

        // Supervisor loop: tick on_run until shutdown is requested.
        self.handle.set_running();
        while self.handle.is_running() {
            self.handler.on_run();
            self.handle.wait_tick(config.run_interval);
        }

        self.handler.on_info("stopping server ...");
        transport.shutdown();
        thread::sleep(config.grace_period);
        workers_running.store(false, Ordering::SeqCst);

        self.handler.on_info("waiting for worker threads to complete...");
        for worker in workers {
            let _ = worker.join();
        }
        self.handle.clear_registry();
        self.handler.on_info("all worker threads are completed");
        Ok(())
    }
}
