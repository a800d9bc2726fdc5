//! Server fixtures for the end-to-end suites.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use switchboard_server::{
    Service, ServerBuilder, ServerConfig, ServerCore, ServerHandle, ServerHandler,
};

/// Installs a fmt subscriber once per test binary, honouring RUST_LOG.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// A unique abstract-socket endpoint URI for one test.
pub fn unique_uri(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "unix-abstract:swb-{prefix}-{}-{}",
        rand::random::<u32>(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Polls `pred` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

/// Handler hosting a fixed set of services with a fast supervisor tick.
pub struct HostedServices {
    services: Vec<Arc<dyn Service>>,
}

impl ServerHandler for HostedServices {
    fn on_init(&self, builder: &mut ServerBuilder) -> bool {
        builder.set_run_interval(Duration::from_millis(10));
        self.services
            .iter()
            .all(|service| builder.add_service(service.clone()).is_ok())
    }
}

/// A server running on its own thread.
pub struct RunningServer {
    pub uri: String,
    pub handle: ServerHandle,
    thread: JoinHandle<switchboard_server::Result<()>>,
}

impl RunningServer {
    /// Requests shutdown and joins the server thread.
    pub fn stop(self) -> Result<()> {
        self.handle.shutdown();
        self.join()
    }

    /// Joins the server thread without requesting shutdown (for suites
    /// where the server stops itself, e.g. via a Shutdown RPC).
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| anyhow!("server thread panicked"))?
            .map_err(|e| anyhow!("server run failed: {e}"))
    }
}

/// Starts a server with default test configuration.
pub fn start_server(services: Vec<Arc<dyn Service>>) -> Result<RunningServer> {
    start_server_with(services, test_config())
}

/// Default configuration for test servers.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        worker_count: 2,
        slots_per_method_per_worker: 1,
        run_interval: Duration::from_millis(10),
        grace_period: Duration::from_millis(50),
    }
}

/// Starts a server on a unique endpoint and waits for it to come up.
pub fn start_server_with(
    services: Vec<Arc<dyn Service>>,
    config: ServerConfig,
) -> Result<RunningServer> {
    init_tracing();
    let uri = unique_uri("srv");
    let core = ServerCore::new(config, Arc::new(HostedServices { services }));
    let handle = core.handle();
    let run_uri = uri.clone();
    let thread = std::thread::spawn(move || core.run_uri(&run_uri));
    if !wait_until(Duration::from_secs(5), || handle.is_running()) {
        handle.shutdown();
        let _ = thread.join();
        return Err(anyhow!("server failed to start on '{uri}'"));
    }
    Ok(RunningServer { uri, handle, thread })
}
