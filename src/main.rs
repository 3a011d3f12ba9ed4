//! authgate service entry point.
//!
//! Startup sequence: observability, configuration, policy module compile,
//! route specification load, evaluator preparation, RBAC store connect and
//! ping, then the accept loop. Any startup failure exits non-zero before
//! the listener binds; SIGINT/SIGTERM trigger a bounded graceful drain.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use authgate::config::EnvConfig;
use authgate::handler::PolicyHandler;
use authgate::lifecycle::{DrainResult, LifecycleManager};
use authgate::metrics::GatewayMetrics;
use authgate::openapi::load_route_spec;
use authgate::policy::{loader::load_policy_module, EvaluatorSet, PolicyBundle};
use authgate::rbac::{RbacDataSource, RbacStore};
use authgate::router::RouteRegistry;
use authgate::server::serve;
use authgate::transport::TargetClient;

#[tokio::main]
async fn main() {
    // Non-blocking JSON logging; the guard must live for the whole program
    // so buffered lines are flushed on exit.
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .json()
        .with_writer(writer)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let env = EnvConfig::from_env()?;

    // Policies compile once; a broken module is fatal.
    let module = load_policy_module(&env.opa_modules_directory)?;
    let bundle = PolicyBundle::compile(module)?;

    let spec = load_route_spec(&env).await?;
    let registry = RouteRegistry::build(&spec, &env);
    let evaluators = EvaluatorSet::prepare(&bundle, spec.policy_names())?;

    // RBAC is optional; when configured, an unreachable store is fatal.
    let rbac: Option<Arc<dyn RbacDataSource>> = match env.rbac_config() {
        Some((url, roles_collection, bindings_collection)) => {
            let store = RbacStore::connect(url, roles_collection, bindings_collection).await?;
            store.ping().await?;
            Some(Arc::new(store))
        }
        None => {
            info!("RBAC store not configured, proceeding without bindings and roles");
            None
        }
    };

    let target = Arc::new(TargetClient::new(&env.target_service_host)?);
    let lifecycle = Arc::new(LifecycleManager::new());
    let metrics = Arc::new(GatewayMetrics::new());

    let handler = PolicyHandler::new(
        env.clone(),
        registry,
        evaluators,
        target,
        rbac,
        lifecycle.clone(),
        metrics,
    );

    let addr = format!("0.0.0.0:{}", env.http_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        target_service = %env.target_service_host,
        "authgate listening"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone(), lifecycle.clone());
    lifecycle.mark_ready();

    serve(handler, listener, shutdown).await?;

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_budget_secs = env.delay_shutdown_seconds,
        "Draining in-flight requests"
    );
    match lifecycle
        .drain_requests(Duration::from_secs(env.delay_shutdown_seconds))
        .await
    {
        DrainResult::Complete => {
            info!("Shutdown complete");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            Err(format!("drain budget elapsed with {remaining} requests in flight").into())
        }
    }
}

/// SIGINT and SIGTERM both begin the graceful shutdown: readiness flips to
/// 503, the accept loop stops, in-flight requests drain.
fn spawn_signal_handlers(shutdown: CancellationToken, lifecycle: Arc<LifecycleManager>) {
    let sigint_shutdown = shutdown.clone();
    let sigint_lifecycle = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                sigint_lifecycle.begin_shutdown();
                sigint_shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    lifecycle.begin_shutdown();
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
            }
        });
    }

    #[cfg(not(unix))]
    {
        let _ = (shutdown, lifecycle);
        tracing::warn!("SIGTERM handling is unavailable on this platform");
    }
}
