//! Target-service transport and response-flow post-processing.
//!
//! The proxy leg is a plain HTTP round trip: method, path, query, body and
//! headers are forwarded verbatim aside from hop-by-hop headers and the
//! residual-query header injection. On the way back, routes with a
//! response flow get their policy evaluated against the parsed response
//! body; everything else passes through untouched.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::{debug, warn};

use crate::error::{
    AuthgateError, RequestError, CONTENT_TYPE_ERROR_MESSAGE, NO_PERMISSIONS_MESSAGE,
    POLICY_EVALUATION_FAILED,
};
use crate::input::content_type_is_json;
use crate::openapi::normalize_base_url;
use crate::policy::PolicyEvaluator;

/// A buffered request on its way to the target service.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path plus query string, forwarded verbatim.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A buffered response from the target service.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardedResponse {
    /// Synthesize a JSON error response, discarding the original.
    pub fn with_error_body(status: StatusCode, error: &str, message: &str) -> Self {
        let body = RequestError {
            status_code: status.as_u16(),
            message: message.to_string(),
            error: error.to_string(),
        };
        let bytes = serde_json::to_vec(&body).unwrap_or_default();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        Self {
            status,
            headers,
            body: Bytes::from(bytes),
        }
    }
}

/// The proxy leg, kept behind a trait so tests can stub the target.
#[async_trait]
pub trait TargetForwarder: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardedResponse, AuthgateError>;
}

/// Pooled HTTP client for the configured target host.
pub struct TargetClient {
    client: reqwest::Client,
    base_url: String,
}

impl TargetClient {
    /// Build the client for `target_host` (either `host:port` or a full
    /// URL).
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::TargetProxy` if the HTTP client cannot be
    /// constructed.
    pub fn new(target_host: &str) -> Result<Self, AuthgateError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(5))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| AuthgateError::TargetProxy(e.to_string()))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(target_host),
        })
    }
}

#[async_trait]
impl TargetForwarder for TargetClient {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardedResponse, AuthgateError> {
        let url = format!("{}{}", self.base_url, request.path_and_query);

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if is_hop_by_hop_header(name.as_str()) || *name == HOST || *name == CONTENT_LENGTH {
                continue;
            }
            headers.append(name, value.clone());
        }

        debug!(method = %request.method, url = %url, "Proxying request to target service");

        let response = self
            .client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| AuthgateError::TargetProxy(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthgateError::TargetProxy(e.to_string()))?;

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Hop-by-hop headers are meaningful for a single connection only and are
/// not forwarded.
pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(CONNECTION.as_str())
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case(TE.as_str())
        || name.eq_ignore_ascii_case(TRAILER.as_str())
        || name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str())
        || name.eq_ignore_ascii_case(UPGRADE.as_str())
}

/// Response-flow evaluation context: the prepared evaluator plus the input
/// document assembled on the request path.
pub struct ResponseFlowEval<'a> {
    pub evaluator: &'a PolicyEvaluator,
    pub input: serde_json::Value,
}

/// Round-trip to the target and post-process the response.
///
/// Behavior, in order:
/// 1. the underlying round trip; errors propagate unchanged;
/// 2. no response flow, non-2xx status, or empty body: the response passes
///    through untouched;
/// 3. a non-JSON content type is replaced with a synthesized 500;
/// 4. a JSON body that fails to parse is a hard error;
/// 5. the response-flow policy runs in allow mode with `response.body`
///    injected; denial replaces the response with a 403.
///
/// # Errors
///
/// Returns `AuthgateError::TargetProxy` on transport failures,
/// `AuthgateError::ResponseDecode` on malformed JSON bodies, and
/// `AuthgateError::PolicyRuntime` on evaluation exceptions.
pub async fn round_trip(
    forwarder: &dyn TargetForwarder,
    request: ForwardRequest,
    response_flow: Option<ResponseFlowEval<'_>>,
) -> Result<ForwardedResponse, AuthgateError> {
    let response = forwarder.forward(request).await?;
    match response_flow {
        Some(flow) => post_process(response, flow),
        None => Ok(response),
    }
}

/// Apply the response-flow policy to an already-received response (steps
/// 2–5 of [`round_trip`]).
///
/// # Errors
///
/// Returns `AuthgateError::ResponseDecode` on malformed JSON bodies and
/// `AuthgateError::PolicyRuntime` on evaluation exceptions.
pub fn post_process(
    response: ForwardedResponse,
    flow: ResponseFlowEval<'_>,
) -> Result<ForwardedResponse, AuthgateError> {
    if !response.status.is_success() {
        return Ok(response);
    }
    if response.body.is_empty() {
        return Ok(response);
    }

    if !content_type_is_json(&response.headers) {
        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        warn!(
            content_type = %content_type,
            "Target service response is not JSON, discarding it"
        );
        return Ok(ForwardedResponse::with_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("unexpected content type sent back by the target service: '{content_type}'"),
            CONTENT_TYPE_ERROR_MESSAGE,
        ));
    }

    let body: serde_json::Value = serde_json::from_slice(&response.body)
        .map_err(|e| AuthgateError::ResponseDecode(e.to_string()))?;

    let mut input = flow.input;
    input["response"] = serde_json::json!({ "body": body });

    let allowed = flow.evaluator.evaluate_allow(&input)?;
    if !allowed {
        debug!(
            policy = %flow.evaluator.rule_name(),
            "Response-flow policy denied the response"
        );
        return Ok(ForwardedResponse::with_error_body(
            StatusCode::FORBIDDEN,
            POLICY_EVALUATION_FAILED,
            NO_PERMISSIONS_MESSAGE,
        ));
    }

    // Permitted responses pass through unmodified; body filtering via the
    // residual query is a forward-compatibility point.
    Ok(response)
}
