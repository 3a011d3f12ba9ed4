//! Error handling for authgate.
//!
//! Every per-request failure is converted into exactly one JSON response
//! with the shape `{"statusCode": int, "message": string, "error": string}`.
//! Startup failures (`ModuleLoad`, `Compile`, store ping) abort the process
//! instead; they never reach a client.

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message returned on policy denials.
pub const NO_PERMISSIONS_MESSAGE: &str = "you don't have permissions to access this resource";

/// Error detail attached to policy denials.
pub const POLICY_EVALUATION_FAILED: &str = "RBAC policy evaluation failed";

/// Message returned when the RBAC store cannot be queried.
pub const USER_BINDINGS_ERROR_MESSAGE: &str = "Error while retrieving user bindings";

/// Message returned when the user-properties header cannot be decoded.
pub const INVALID_USER_PROPERTIES_MESSAGE: &str = "user properties header is not valid";

/// Message returned when the target service replies with a non-JSON body
/// on a response-flow route.
pub const CONTENT_TYPE_ERROR_MESSAGE: &str = "content-type is not application/json";

/// Generic business error message, used when no more specific message applies.
pub const GENERIC_BUSINESS_ERROR_MESSAGE: &str = "Internal server error, please try again later";

/// All error conditions of the policy enforcement pipeline.
#[derive(Debug, Error)]
pub enum AuthgateError {
    /// The policy module directory is missing, unreadable, or empty.
    #[error("failed to load policy module from {path}: {reason}")]
    ModuleLoad { path: String, reason: String },

    /// The policy module failed to compile.
    #[error("policy compilation failed: {details}")]
    Compile { details: String },

    /// A policy evaluation raised an exception at runtime.
    #[error("policy {policy} evaluation failed: {details}")]
    PolicyRuntime { policy: String, details: String },

    /// A JSON request body failed to parse.
    #[error("failed to parse request body: {0}")]
    InvalidRequestBody(String),

    /// The user-properties header carried a value that is not a JSON object.
    #[error("user properties header is not valid: {0}")]
    InvalidUserProperties(String),

    /// The RBAC document store could not be queried.
    #[error("RBAC store error: {0}")]
    RbacStore(String),

    /// The round trip to the target service failed.
    #[error("error proxying to target service: {0}")]
    TargetProxy(String),

    /// The target service sent a response body that could not be decoded.
    #[error("response body is not valid: {0}")]
    ResponseDecode(String),

    /// A required environment variable is missing or malformed.
    #[error("configuration error: {0}")]
    Env(String),

    /// The OpenAPI route specification could not be loaded or parsed.
    #[error("invalid route specification: {0}")]
    RouteSpec(String),
}

impl AuthgateError {
    /// HTTP status this error maps to when it surfaces on a request path.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TargetProxy(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Bounded, client-facing message for this error. Raw upstream bytes
    /// never end up here, only the fixed message vocabulary.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::RbacStore(_) => USER_BINDINGS_ERROR_MESSAGE,
            Self::InvalidUserProperties(_) => INVALID_USER_PROPERTIES_MESSAGE,
            _ => GENERIC_BUSINESS_ERROR_MESSAGE,
        }
    }

    /// Convert this error into the single JSON response emitted to the client.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        fail_response_with_code(self.status_code(), &self.to_string(), self.client_message())
    }
}

/// Wire shape of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestError {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub message: String,
    pub error: String,
}

/// Build a JSON error response with an accurate `Content-Length`.
pub fn fail_response_with_code(
    status: StatusCode,
    error: &str,
    message: &str,
) -> Response<Full<Bytes>> {
    let body = RequestError {
        status_code: status.as_u16(),
        message: message.to_string(),
        error: error.to_string(),
    };
    let bytes = serde_json::to_vec(&body).unwrap_or_default();

    let mut response = Response::new(Full::new(Bytes::from(bytes.clone())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    response
}
