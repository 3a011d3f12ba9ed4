//! Policy input document assembly.
//!
//! Every evaluation receives a JSON document with a fixed shape:
//!
//! ```json
//! {
//!   "request":  { "method", "path", "pathParams", "headers", "query", "body" },
//!   "response": { "body" },
//!   "user":     { "properties", "groups", "bindings", "roles", "resourcePermissionsMap" },
//!   "clientType": ""
//! }
//! ```
//!
//! `request.body` appears only for methods that carry one (POST, PUT,
//! PATCH, DELETE) with an exact `application/json` content type;
//! `response.body` only during response-flow evaluation; and
//! `resourcePermissionsMap` only when the route opts into the optimization.

use std::collections::{BTreeSet, HashMap};

use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::config::EnvConfig;
use crate::error::AuthgateError;
use crate::rbac::{build_optimized_resource_permissions_map, Binding, Role};

/// Methods whose JSON body is included in the policy input.
const BODY_METHODS: [Method; 4] = [Method::POST, Method::PUT, Method::PATCH, Method::DELETE];

/// Caller identity, derived from trusted upstream headers.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: String,
    pub groups: Vec<String>,
    pub properties: Map<String, serde_json::Value>,
    pub bindings: Vec<Binding>,
    pub roles: Vec<Role>,
}

impl User {
    /// True when there is an identity worth fetching RBAC data for.
    pub fn has_identity(&self) -> bool {
        !self.id.is_empty() || !self.groups.is_empty()
    }
}

/// Extract the caller identity from the configured request headers.
///
/// An absent or empty properties header decodes to an empty object; a
/// non-empty value that is not a JSON object is a hard error.
///
/// # Errors
///
/// Returns `AuthgateError::InvalidUserProperties` on malformed properties.
pub fn extract_user(headers: &HeaderMap, env: &EnvConfig) -> Result<User, AuthgateError> {
    let id = header_value(headers, &env.user_id_header).unwrap_or_default();

    let groups = header_value(headers, &env.user_groups_header)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|group| !group.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let properties = match header_value(headers, &env.user_properties_header) {
        None => Map::new(),
        Some(value) if value.is_empty() => Map::new(),
        Some(value) => serde_json::from_str::<Map<String, serde_json::Value>>(&value)
            .map_err(|e| AuthgateError::InvalidUserProperties(e.to_string()))?,
    };

    Ok(User {
        id,
        groups,
        properties,
        bindings: Vec::new(),
        roles: Vec::new(),
    })
}

/// The policy input document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub request: InputRequest,
    pub response: InputResponse,
    pub user: InputUser,
    pub client_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub method: String,
    pub path: String,
    pub path_params: HashMap<String, String>,
    pub headers: HashMap<String, Vec<String>>,
    pub query: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputUser {
    pub properties: Map<String, serde_json::Value>,
    pub groups: Vec<String>,
    pub bindings: Vec<Binding>,
    pub roles: Vec<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_permissions_map: Option<BTreeSet<String>>,
}

/// Assemble the policy input for one request. The builder is pure: it
/// reads the request data it is given and produces a canonical document.
///
/// # Errors
///
/// Returns `AuthgateError::InvalidRequestBody` when a JSON content type is
/// declared but the body does not parse.
#[allow(clippy::too_many_arguments)]
pub fn build_input(
    env: &EnvConfig,
    method: &Method,
    path: &str,
    path_params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
    user: &User,
    enable_optimization: bool,
) -> Result<Input, AuthgateError> {
    let parsed_body = if BODY_METHODS.contains(method) && content_type_is_json(headers) {
        if body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(body)
                    .map_err(|e| AuthgateError::InvalidRequestBody(e.to_string()))?,
            )
        }
    } else {
        None
    };

    let resource_permissions_map = enable_optimization
        .then(|| build_optimized_resource_permissions_map(&user.bindings, &user.roles));

    let (path_only, query) = match path.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path, ""),
    };

    Ok(Input {
        request: InputRequest {
            method: method.to_string(),
            path: path_only.to_string(),
            path_params: path_params.clone(),
            headers: headers_map(headers),
            query: parse_query(query),
            body: parsed_body,
        },
        response: InputResponse { body: None },
        user: InputUser {
            properties: user.properties.clone(),
            groups: user.groups.clone(),
            bindings: user.bindings.clone(),
            roles: user.roles.clone(),
            resource_permissions_map,
        },
        client_type: header_value(headers, &env.client_type_header).unwrap_or_default(),
    })
}

/// Exact `application/json` check, ignoring any charset parameter.
pub fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

/// Full header set, preserving multiple values per name.
fn headers_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    fn env() -> EnvConfig {
        EnvConfig::default()
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_empty_user_properties_header_is_empty_object() {
        let mut headers = HeaderMap::new();
        headers.insert("miauserproperties", HeaderValue::from_static(""));

        let user = extract_user(&headers, &env()).expect("empty header is accepted");
        assert!(user.properties.is_empty());
    }

    #[test]
    fn test_malformed_user_properties_header_fails() {
        let mut headers = HeaderMap::new();
        headers.insert("miauserproperties", HeaderValue::from_static("{}{}{{"));

        let result = extract_user(&headers, &env());
        assert!(matches!(
            result,
            Err(AuthgateError::InvalidUserProperties(_))
        ));
    }

    #[test]
    fn test_non_object_user_properties_fails() {
        let mut headers = HeaderMap::new();
        headers.insert("miauserproperties", HeaderValue::from_static("1"));

        let result = extract_user(&headers, &env());
        assert!(matches!(
            result,
            Err(AuthgateError::InvalidUserProperties(_))
        ));
    }

    #[test]
    fn test_groups_split_on_comma() {
        let mut headers = HeaderMap::new();
        headers.insert("miausergroups", HeaderValue::from_static("user1,user2,"));
        headers.insert("miauserid", HeaderValue::from_static("user1"));

        let user = extract_user(&headers, &env()).unwrap();
        assert_eq!(user.groups, vec!["user1", "user2"]);
        assert_eq!(user.id, "user1");
        assert!(user.has_identity());
    }

    #[test]
    fn test_body_included_for_write_methods_with_json() {
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            let input = build_input(
                &env(),
                &method,
                "/",
                &HashMap::new(),
                &json_headers(),
                br#"{"Key":42}"#,
                &User::default(),
                false,
            )
            .unwrap();
            assert_eq!(input.request.body, Some(json!({"Key": 42})), "{method}");
        }
    }

    #[test]
    fn test_body_ignored_on_get() {
        let input = build_input(
            &env(),
            &Method::GET,
            "/",
            &HashMap::new(),
            &json_headers(),
            br#"{"Key":42}"#,
            &User::default(),
            false,
        )
        .unwrap();
        assert!(input.request.body.is_none());
    }

    #[test]
    fn test_body_included_with_charset_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=UTF-8"),
        );
        let input = build_input(
            &env(),
            &Method::POST,
            "/",
            &HashMap::new(),
            &headers,
            br#"{"Key":42}"#,
            &User::default(),
            false,
        )
        .unwrap();
        assert_eq!(input.request.body, Some(json!({"Key": 42})));
    }

    #[test]
    fn test_body_omitted_for_other_content_types() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("multipart/form-data"));
        let input = build_input(
            &env(),
            &Method::POST,
            "/",
            &HashMap::new(),
            &headers,
            b"{notajson}",
            &User::default(),
            false,
        )
        .unwrap();
        assert!(input.request.body.is_none());
    }

    #[test]
    fn test_invalid_json_body_with_json_content_type_fails() {
        let result = build_input(
            &env(),
            &Method::POST,
            "/",
            &HashMap::new(),
            &json_headers(),
            b"{notajson}",
            &User::default(),
            false,
        );
        assert!(matches!(result, Err(AuthgateError::InvalidRequestBody(_))));
    }

    #[test]
    fn test_empty_body_on_post_is_omitted() {
        let input = build_input(
            &env(),
            &Method::POST,
            "/",
            &HashMap::new(),
            &json_headers(),
            b"",
            &User::default(),
            false,
        )
        .unwrap();
        assert!(input.request.body.is_none());
    }

    #[test]
    fn test_query_and_client_type() {
        let mut headers = HeaderMap::new();
        headers.insert("client-type", HeaderValue::from_static("backoffice"));

        let input = build_input(
            &env(),
            &Method::GET,
            "/users/?page=1&tag=a&tag=b",
            &HashMap::new(),
            &headers,
            b"",
            &User::default(),
            false,
        )
        .unwrap();

        assert_eq!(input.client_type, "backoffice");
        assert_eq!(input.request.query["page"], vec!["1"]);
        assert_eq!(input.request.query["tag"], vec!["a", "b"]);
    }

    #[test]
    fn test_serialization_round_trip_is_canonical() {
        let mut headers = HeaderMap::new();
        headers.insert("x-something", HeaderValue::from_static("v"));
        let input = build_input(
            &env(),
            &Method::GET,
            "/users/{id}",
            &HashMap::from([("id".to_string(), "42".to_string())]),
            &headers,
            b"",
            &User::default(),
            false,
        )
        .unwrap();

        let bytes = serde_json::to_vec(&input).unwrap();
        let reparsed: Input = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            serde_json::to_value(&reparsed).unwrap()
        );
    }

    #[test]
    fn test_wire_field_names() {
        let input = Input {
            client_type: "ct".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&input).unwrap();
        assert!(value.get("clientType").is_some());
        assert!(value["request"].get("pathParams").is_some());
        assert!(value["request"].get("body").is_none());
        assert!(value["response"].get("body").is_none());
        assert!(value["user"].get("resourcePermissionsMap").is_none());
    }

    #[test]
    fn test_resource_permissions_map_behind_flag() {
        let user = User {
            bindings: vec![Binding {
                roles: vec!["role1".to_string()],
                permissions: vec!["pN".to_string()],
                resource: Some(crate::rbac::Resource {
                    resource_type: "type1".to_string(),
                    resource_id: "resource1".to_string(),
                }),
                ..Default::default()
            }],
            roles: vec![Role {
                role_id: "role1".to_string(),
                permissions: vec!["p1".to_string(), "p2".to_string()],
            }],
            ..Default::default()
        };

        let without = build_input(
            &env(),
            &Method::GET,
            "/",
            &HashMap::new(),
            &HeaderMap::new(),
            b"",
            &user,
            false,
        )
        .unwrap();
        assert!(without.user.resource_permissions_map.is_none());

        let with = build_input(
            &env(),
            &Method::GET,
            "/",
            &HashMap::new(),
            &HeaderMap::new(),
            b"",
            &user,
            true,
        )
        .unwrap();
        let map = with.user.resource_permissions_map.unwrap();
        assert_eq!(
            map,
            BTreeSet::from([
                "p1:type1:resource1".to_string(),
                "p2:type1:resource1".to_string(),
                "pN:type1:resource1".to_string(),
            ])
        );
    }
}
