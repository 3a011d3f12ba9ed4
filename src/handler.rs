//! The per-request policy handler.
//!
//! Single entry point for every proxied request: resolve the matched
//! route, collect the caller's bindings and roles, assemble the policy
//! input, evaluate the request-flow policy (allow or partial mode), proxy
//! to the target service, and run the response-flow policy on the way
//! back.
//!
//! ```text
//! START → ROUTE_MATCHED → ALWAYS_PROXY | HAS_POLICY
//! HAS_POLICY → IDENTITY_COLLECTED → RBAC_FETCHED|RBAC_SKIPPED → INPUT_BUILT
//! INPUT_BUILT → ALLOW_EVAL → DENIED(403) | PROXIED
//! INPUT_BUILT → PARTIAL_EVAL → QUERY_INJECTED → PROXIED
//! PROXIED → RESPONSE_POLICY? → DENIED | FORWARDED
//! any step → ERROR(500/502)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use tracing::{debug, warn};

use crate::config::EnvConfig;
use crate::error::{
    fail_response_with_code, AuthgateError, NO_PERMISSIONS_MESSAGE, POLICY_EVALUATION_FAILED,
};
use crate::input::{build_input, extract_user, User};
use crate::lifecycle::LifecycleManager;
use crate::metrics::GatewayMetrics;
use crate::openapi::{RequestFlow, ResponseFlow, RouteConfig};
use crate::policy::EvaluatorSet;
use crate::rbac::RbacDataSource;
use crate::router::{RouteRegistry, RESERVED_PATHS};
use crate::transport::{
    self, is_hop_by_hop_header, ForwardRequest, ForwardedResponse, ResponseFlowEval,
    TargetForwarder,
};

/// Largest request/response body the proxy will buffer.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// The composed per-request middleware. Cheap to clone; all state is
/// shared and immutable (the RBAC client synchronizes internally).
#[derive(Clone)]
pub struct PolicyHandler {
    inner: Arc<HandlerState>,
}

struct HandlerState {
    env: EnvConfig,
    registry: RouteRegistry,
    evaluators: EvaluatorSet,
    target: Arc<dyn TargetForwarder>,
    rbac: Option<Arc<dyn RbacDataSource>>,
    lifecycle: Arc<LifecycleManager>,
    metrics: Arc<GatewayMetrics>,
}

impl PolicyHandler {
    pub fn new(
        env: EnvConfig,
        registry: RouteRegistry,
        evaluators: EvaluatorSet,
        target: Arc<dyn TargetForwarder>,
        rbac: Option<Arc<dyn RbacDataSource>>,
        lifecycle: Arc<LifecycleManager>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerState {
                env,
                registry,
                evaluators,
                target,
                rbac,
                lifecycle,
                metrics,
            }),
        }
    }

    /// Handle one request. Never fails: every error path is converted into
    /// a JSON error response.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        if RESERVED_PATHS.contains(&path.as_str()) {
            return self.status_route(&path);
        }

        let response = match self.handle_request(request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, path = %path, "Request failed");
                error.to_response()
            }
        };

        self.inner
            .metrics
            .record_request(method.as_str(), response.status().as_u16());
        response
    }

    fn status_route(&self, path: &str) -> Response<Full<Bytes>> {
        match path {
            "/-/healthz" => json_status(StatusCode::OK, "OK"),
            "/-/ready" => {
                if self.inner.lifecycle.is_ready() {
                    json_status(StatusCode::OK, "OK")
                } else {
                    json_status(StatusCode::SERVICE_UNAVAILABLE, "KO")
                }
            }
            _ => {
                let body = self.inner.metrics.render();
                let mut response = Response::new(Full::new(Bytes::from(body)));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(
                        "application/openmetrics-text; version=1.0.0; charset=utf-8",
                    ),
                );
                response
            }
        }
    }

    async fn handle_request<B>(
        &self,
        request: Request<B>,
    ) -> Result<Response<Full<Bytes>>, AuthgateError>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let state = &*self.inner;

        let Some(_guard) = state.lifecycle.track_request() else {
            return Ok(fail_response_with_code(
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting down",
                "service is shutting down",
            ));
        };

        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let body_bytes = Limited::new(body, MAX_BODY_SIZE)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| AuthgateError::InvalidRequestBody(e.to_string()))?;

        let matched = state.registry.match_route(&parts.method, &path);
        let (config, path_params) = match &matched {
            Some(route) => {
                debug!(
                    method = %parts.method,
                    path = %path,
                    matched_path = %route.matched_path,
                    "Route matched"
                );
                (route.config, route.path_params.clone())
            }
            None => (None, HashMap::new()),
        };

        let request_flow = config.and_then(|c| c.request_flow.as_ref());
        let response_flow = config.and_then(|c| c.response_flow.as_ref());

        let mut forward_headers = parts.headers.clone();
        let mut built_input: Option<serde_json::Value> = None;

        if let Some(flow) = request_flow {
            match self
                .evaluate_request_flow(
                    flow,
                    config,
                    &parts.method,
                    &path_and_query,
                    &path_params,
                    &parts.headers,
                    &body_bytes,
                    &mut forward_headers,
                )
                .await?
            {
                RequestFlowOutcome::Denied => {
                    state.metrics.record_denial(&flow.policy_name);
                    return Ok(deny_response());
                }
                RequestFlowOutcome::Allowed { input } => built_input = Some(input),
            }
        }

        let forward_request = ForwardRequest {
            method: parts.method.clone(),
            path_and_query: path_and_query.clone(),
            headers: forward_headers,
            body: body_bytes.clone(),
        };
        let response = state.target.forward(forward_request).await?;

        let response = match response_flow {
            Some(flow) => {
                self.apply_response_flow(
                    flow,
                    config,
                    response,
                    built_input,
                    &parts.method,
                    &path_and_query,
                    &path_params,
                    &parts.headers,
                    &body_bytes,
                )
                .await?
            }
            None => response,
        };

        Ok(to_http_response(response))
    }

    /// Evaluate the request-flow policy: allow mode, or partial mode with
    /// residual-query injection into the forwarded headers.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_request_flow(
        &self,
        flow: &RequestFlow,
        config: Option<&RouteConfig>,
        method: &http::Method,
        path_and_query: &str,
        path_params: &HashMap<String, String>,
        headers: &HeaderMap,
        body: &[u8],
        forward_headers: &mut HeaderMap,
    ) -> Result<RequestFlowOutcome, AuthgateError> {
        let state = &*self.inner;

        let Some(evaluator) = state.evaluators.get(&flow.policy_name) else {
            // Empty or unknown policy names deny rather than proxy:
            // fail closed.
            warn!(policy = %flow.policy_name, "No evaluator for request-flow policy");
            return Ok(RequestFlowOutcome::Denied);
        };

        let user = self.collect_user(headers).await?;
        let input = self.build_input_document(config, method, path_and_query, path_params, headers, body, &user)?;

        let started = Instant::now();
        if flow.generate_query {
            let residual = evaluator.evaluate_partial(&input)?;
            state
                .metrics
                .record_evaluation(&flow.policy_name, started.elapsed().as_secs_f64());

            if residual.is_deny() {
                return Ok(RequestFlowOutcome::Denied);
            }
            let header_name = HeaderName::from_bytes(
                flow.query_options.header_or_default().as_bytes(),
            )
            .map_err(|e| AuthgateError::RouteSpec(format!("invalid query header name: {e}")))?;
            let header_value = HeaderValue::from_str(&residual.to_header_value())
                .map_err(|e| AuthgateError::RouteSpec(format!("invalid query header value: {e}")))?;
            forward_headers.insert(header_name, header_value);
        } else {
            let allowed = evaluator.evaluate_allow(&input)?;
            state
                .metrics
                .record_evaluation(&flow.policy_name, started.elapsed().as_secs_f64());
            if !allowed {
                return Ok(RequestFlowOutcome::Denied);
            }
        }

        Ok(RequestFlowOutcome::Allowed { input })
    }

    /// Evaluate the response-flow policy. The input document is reused
    /// from the request flow when available, or assembled here so that
    /// response-only routes always reach the target first.
    #[allow(clippy::too_many_arguments)]
    async fn apply_response_flow(
        &self,
        flow: &ResponseFlow,
        config: Option<&RouteConfig>,
        response: ForwardedResponse,
        built_input: Option<serde_json::Value>,
        method: &http::Method,
        path_and_query: &str,
        path_params: &HashMap<String, String>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ForwardedResponse, AuthgateError> {
        let Some(evaluator) = self.inner.evaluators.get(&flow.policy_name) else {
            warn!(policy = %flow.policy_name, "No evaluator for response-flow policy");
            return Ok(ForwardedResponse::with_error_body(
                StatusCode::FORBIDDEN,
                POLICY_EVALUATION_FAILED,
                NO_PERMISSIONS_MESSAGE,
            ));
        };

        let input = match built_input {
            Some(input) => input,
            None => {
                let user = self.collect_user(headers).await?;
                self.build_input_document(
                    config,
                    method,
                    path_and_query,
                    path_params,
                    headers,
                    body,
                    &user,
                )?
            }
        };

        transport::post_process(response, ResponseFlowEval { evaluator, input })
    }

    /// Extract the caller identity and, when RBAC is enabled and an
    /// identity is present, fetch its bindings and roles.
    async fn collect_user(&self, headers: &HeaderMap) -> Result<User, AuthgateError> {
        let mut user = extract_user(headers, &self.inner.env)?;

        if let Some(rbac) = &self.inner.rbac {
            if user.has_identity() {
                user.bindings = rbac.retrieve_user_bindings(&user.id, &user.groups).await?;

                let mut role_ids: Vec<String> = user
                    .bindings
                    .iter()
                    .flat_map(|binding| binding.roles.iter().cloned())
                    .collect();
                role_ids.sort();
                role_ids.dedup();
                if !role_ids.is_empty() {
                    user.roles = rbac.retrieve_user_roles_by_role_ids(&role_ids).await?;
                }
            }
        }

        Ok(user)
    }

    fn build_input_document(
        &self,
        config: Option<&RouteConfig>,
        method: &http::Method,
        path_and_query: &str,
        path_params: &HashMap<String, String>,
        headers: &HeaderMap,
        body: &[u8],
        user: &User,
    ) -> Result<serde_json::Value, AuthgateError> {
        let enable_optimization = config
            .map(|c| c.options.enable_resource_permissions_map_optimization)
            .unwrap_or(false);

        let input = build_input(
            &self.inner.env,
            method,
            path_and_query,
            path_params,
            headers,
            body,
            user,
            enable_optimization,
        )?;
        serde_json::to_value(&input).map_err(|e| AuthgateError::PolicyRuntime {
            policy: "input".to_string(),
            details: e.to_string(),
        })
    }
}

enum RequestFlowOutcome {
    Allowed { input: serde_json::Value },
    Denied,
}

fn deny_response() -> Response<Full<Bytes>> {
    fail_response_with_code(
        StatusCode::FORBIDDEN,
        POLICY_EVALUATION_FAILED,
        NO_PERMISSIONS_MESSAGE,
    )
}

fn json_status(status: StatusCode, label: &str) -> Response<Full<Bytes>> {
    let body = format!(r#"{{"status":"{label}"}}"#);
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Convert a buffered target response into the reply sent to the client.
/// Bodies are buffered, so `Content-Length` is recomputed and any
/// connection-scoped headers are dropped.
fn to_http_response(forwarded: ForwardedResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(forwarded.body.clone()));
    *response.status_mut() = forwarded.status;

    for (name, value) in &forwarded.headers {
        if is_hop_by_hop_header(name.as_str()) || *name == CONTENT_LENGTH {
            continue;
        }
        response.headers_mut().append(name, value.clone());
    }
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(forwarded.body.len()));
    response
}
