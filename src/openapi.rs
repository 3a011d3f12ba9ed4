//! OpenAPI-style route specification.
//!
//! The route spec maps `(pattern, method)` pairs to policy configuration
//! under the `x-rond` extension key (the legacy `x-permission` key is
//! accepted with identical semantics). Patterns use `{name}` captures and
//! an optional trailing `*` wildcard; the method `all` expands to the full
//! supported set.
//!
//! The spec is loaded once at startup, either from a local file or fetched
//! from the target service.

use std::collections::BTreeMap;

use http::Method;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EnvConfig;
use crate::error::AuthgateError;

/// HTTP methods an `all` entry expands to.
pub const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

/// Policy configuration of one `(pattern, method)` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_flow: Option<RequestFlow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_flow: Option<ResponseFlow>,
    #[serde(default)]
    pub options: RouteOptions,
}

impl RouteConfig {
    /// True when neither flow is configured: the route always proxies.
    pub fn is_always_proxy(&self) -> bool {
        self.request_flow.is_none() && self.response_flow.is_none()
    }
}

/// Request-flow policy: evaluated before proxying.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestFlow {
    #[serde(default)]
    pub policy_name: String,
    /// When set, the policy runs in partial mode and the residual query is
    /// forwarded to the target in a header.
    #[serde(default)]
    pub generate_query: bool,
    #[serde(default)]
    pub query_options: QueryOptions,
}

/// Carrier options for the residual query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default)]
    pub header_name: String,
}

impl QueryOptions {
    /// Header the residual query is injected into.
    pub fn header_or_default(&self) -> &str {
        if self.header_name.is_empty() {
            "x-query"
        } else {
            &self.header_name
        }
    }
}

/// Response-flow policy: evaluated on the response path with the parsed
/// response body in the input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFlow {
    #[serde(default)]
    pub policy_name: String,
}

/// Per-route evaluation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptions {
    /// Include the materialized resource-permissions map in the input.
    #[serde(default)]
    pub enable_resource_permissions_map_optimization: bool,
}

/// One verb entry of the spec; everything except the policy extension is
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerbConfig {
    #[serde(default, rename = "x-rond", alias = "x-permission")]
    pub policy: Option<RouteConfig>,
}

/// The parsed route specification: pattern → method → verb configuration.
/// `BTreeMap` keeps iteration deterministic.
#[derive(Debug, Clone, Default)]
pub struct RouteSpec {
    pub paths: BTreeMap<String, BTreeMap<String, VerbConfig>>,
}

impl RouteSpec {
    /// Parse a route specification document.
    ///
    /// Unknown keys inside verb objects and non-method keys inside path
    /// objects (e.g. OpenAPI `parameters`) are tolerated and skipped.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::RouteSpec` if the document is not valid
    /// JSON, lacks a `paths` object, or a policy extension is malformed.
    pub fn parse(bytes: &[u8]) -> Result<Self, AuthgateError> {
        #[derive(Deserialize)]
        struct RawSpec {
            paths: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
        }

        let raw: RawSpec = serde_json::from_slice(bytes)
            .map_err(|e| AuthgateError::RouteSpec(e.to_string()))?;

        let mut paths = BTreeMap::new();
        for (pattern, verbs) in raw.paths {
            let mut methods = BTreeMap::new();
            for (method, value) in verbs {
                if !is_method_key(&method) {
                    continue;
                }
                let verb: VerbConfig =
                    serde_json::from_value(value).map_err(|e| {
                        AuthgateError::RouteSpec(format!(
                            "invalid policy configuration for {method} {pattern}: {e}"
                        ))
                    })?;
                methods.insert(method.to_lowercase(), verb);
            }
            paths.insert(pattern, methods);
        }

        Ok(Self { paths })
    }

    /// Every policy name referenced by the spec (request and response
    /// flows), for evaluator preparation. Empty names are skipped.
    pub fn policy_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for verbs in self.paths.values() {
            for verb in verbs.values() {
                let Some(config) = &verb.policy else { continue };
                if let Some(flow) = &config.request_flow {
                    if !flow.policy_name.is_empty() {
                        names.push(flow.policy_name.clone());
                    }
                }
                if let Some(flow) = &config.response_flow {
                    if !flow.policy_name.is_empty() {
                        names.push(flow.policy_name.clone());
                    }
                }
            }
        }
        names
    }
}

fn is_method_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("all")
        || SUPPORTED_METHODS
            .iter()
            .any(|method| key.eq_ignore_ascii_case(method.as_str()))
}

/// Load the route specification: a local file takes precedence over the
/// network fetch from the target service.
///
/// # Errors
///
/// Returns `AuthgateError::RouteSpec` when no source is configured, the
/// source is unreachable, or the document fails to parse.
pub async fn load_route_spec(env: &EnvConfig) -> Result<RouteSpec, AuthgateError> {
    if let Some(path) = &env.api_permissions_file_path {
        info!(path = %path, "Loading route specification from file");
        let bytes = std::fs::read(path)
            .map_err(|e| AuthgateError::RouteSpec(format!("cannot read {path}: {e}")))?;
        return RouteSpec::parse(&bytes);
    }

    let Some(oas_path) = &env.target_service_oas_path else {
        return Err(AuthgateError::RouteSpec(
            "no route specification source configured".to_string(),
        ));
    };

    let url = format!(
        "{}{}",
        normalize_base_url(&env.target_service_host),
        oas_path
    );
    info!(url = %url, "Fetching route specification from target service");

    let response = reqwest::get(&url)
        .await
        .map_err(|e| AuthgateError::RouteSpec(format!("cannot fetch {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(AuthgateError::RouteSpec(format!(
            "target service returned {} for {url}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AuthgateError::RouteSpec(e.to_string()))?;
    RouteSpec::parse(&bytes)
}

/// Accepts both `host:port` and full URLs.
pub fn normalize_base_url(host: &str) -> String {
    if host.contains("://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", host.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_SPEC: &str = r#"{
        "paths": {
            "/users/": {
                "get": {"x-rond": {"requestFlow": {"policyName": "allow"}}},
                "post": {"x-rond": {"requestFlow": {"policyName": "allow"}}}
            },
            "/composed/permission/": {
                "all": {"x-rond": {"requestFlow": {"policyName": "very.very.composed.permission"}}}
            },
            "/no-permission": {
                "get": {}
            }
        }
    }"#;

    #[test]
    fn test_parse_simple_spec() {
        let spec = RouteSpec::parse(SIMPLE_SPEC.as_bytes()).unwrap();
        assert_eq!(spec.paths.len(), 3);

        let users_get = spec.paths["/users/"]["get"].policy.as_ref().unwrap();
        assert_eq!(
            users_get.request_flow.as_ref().unwrap().policy_name,
            "allow"
        );
        assert!(spec.paths["/no-permission"]["get"].policy.is_none());
    }

    #[test]
    fn test_legacy_x_permission_key() {
        let spec = RouteSpec::parse(
            br#"{"paths": {"/legacy": {"get": {"x-permission": {"requestFlow": {"policyName": "allow_legacy"}}}}}}"#,
        )
        .unwrap();
        let config = spec.paths["/legacy"]["get"].policy.as_ref().unwrap();
        assert_eq!(
            config.request_flow.as_ref().unwrap().policy_name,
            "allow_legacy"
        );
    }

    #[test]
    fn test_response_flow_and_query_options() {
        let spec = RouteSpec::parse(
            br#"{"paths": {"/items": {"get": {"x-rond": {
                "requestFlow": {"policyName": "filter_items", "generateQuery": true,
                                "queryOptions": {"headerName": "x-acl-query"}},
                "responseFlow": {"policyName": "column_policy"}
            }}}}}"#,
        )
        .unwrap();
        let config = spec.paths["/items"]["get"].policy.as_ref().unwrap();
        let request_flow = config.request_flow.as_ref().unwrap();
        assert!(request_flow.generate_query);
        assert_eq!(request_flow.query_options.header_or_default(), "x-acl-query");
        assert_eq!(
            config.response_flow.as_ref().unwrap().policy_name,
            "column_policy"
        );
    }

    #[test]
    fn test_query_options_default_header() {
        assert_eq!(QueryOptions::default().header_or_default(), "x-query");
    }

    #[test]
    fn test_non_method_keys_are_skipped() {
        let spec = RouteSpec::parse(
            br#"{"paths": {"/users/{id}": {
                "parameters": [{"name": "id", "in": "path"}],
                "get": {"summary": "fetch one user", "x-rond": {"requestFlow": {"policyName": "allow"}}}
            }}}"#,
        )
        .unwrap();
        let verbs = &spec.paths["/users/{id}"];
        assert_eq!(verbs.len(), 1);
        assert!(verbs.contains_key("get"));
    }

    #[test]
    fn test_policy_names_collects_both_flows() {
        let spec = RouteSpec::parse(
            br#"{"paths": {
                "/a": {"get": {"x-rond": {"requestFlow": {"policyName": "allow"},
                                           "responseFlow": {"policyName": "filter"}}}},
                "/b": {"post": {"x-rond": {"requestFlow": {"policyName": "allow"}}}},
                "/c": {"get": {"x-rond": {"requestFlow": {"policyName": ""}}}}
            }}"#,
        )
        .unwrap();
        let mut names = spec.policy_names();
        names.sort();
        assert_eq!(names, vec!["allow", "allow", "filter"]);
    }

    #[test]
    fn test_parse_rejects_invalid_document() {
        assert!(matches!(
            RouteSpec::parse(b"not json"),
            Err(AuthgateError::RouteSpec(_))
        ));
        assert!(matches!(
            RouteSpec::parse(br#"{"no_paths": {}}"#),
            Err(AuthgateError::RouteSpec(_))
        ));
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("localhost:3001"), "http://localhost:3001");
        assert_eq!(
            normalize_base_url("http://localhost:3001/"),
            "http://localhost:3001"
        );
        assert_eq!(
            normalize_base_url("https://svc.internal"),
            "https://svc.internal"
        );
    }
}
