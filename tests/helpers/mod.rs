//! Shared helpers for the proxy integration tests: spin up a full gateway
//! (route registry, compiled policies, real listener) in front of a mock
//! target service.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use authgate::config::EnvConfig;
use authgate::handler::PolicyHandler;
use authgate::lifecycle::LifecycleManager;
use authgate::metrics::GatewayMetrics;
use authgate::openapi::RouteSpec;
use authgate::policy::loader::PolicyModule;
use authgate::policy::{EvaluatorSet, PolicyBundle};
use authgate::rbac::RbacDataSource;
use authgate::router::RouteRegistry;
use authgate::server::serve;
use authgate::transport::TargetClient;

/// A running gateway bound to an ephemeral port. Dropping the handle shuts
/// the server down.
pub struct GatewayHandle {
    pub base_url: String,
    shutdown: CancellationToken,
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Test environment: identity headers named like the production defaults
/// used throughout the scenarios.
pub fn test_env(target_url: &str) -> EnvConfig {
    EnvConfig {
        target_service_host: target_url.to_string(),
        target_service_oas_path: Some("/documentation/json".to_string()),
        user_id_header: "useridheader".to_string(),
        user_groups_header: "usergroupsheader".to_string(),
        user_properties_header: "userpropertiesheader".to_string(),
        ..EnvConfig::default()
    }
}

/// Build and serve a gateway for the given route spec and policy module.
pub async fn spawn_gateway(
    env: EnvConfig,
    spec_json: &str,
    policies: &str,
    rbac: Option<Arc<dyn RbacDataSource>>,
) -> GatewayHandle {
    let spec = RouteSpec::parse(spec_json.as_bytes()).expect("route spec should parse");
    let registry = RouteRegistry::build(&spec, &env);

    let bundle = PolicyBundle::compile(PolicyModule {
        name: "policies.rego".to_string(),
        content: policies.to_string(),
    })
    .expect("policy module should compile");
    let evaluators =
        EvaluatorSet::prepare(&bundle, spec.policy_names()).expect("evaluators should prepare");

    let target =
        Arc::new(TargetClient::new(&env.target_service_host).expect("target client should build"));
    let lifecycle = Arc::new(LifecycleManager::new());
    lifecycle.mark_ready();

    let handler = PolicyHandler::new(
        env,
        registry,
        evaluators,
        target,
        rbac,
        lifecycle,
        Arc::new(GatewayMetrics::new()),
    );

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an addr");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = serve(handler, listener, server_shutdown).await;
    });

    GatewayHandle {
        base_url: format!("http://{addr}"),
        shutdown,
    }
}
