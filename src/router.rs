//! Route registry.
//!
//! Routes from the OpenAPI-style specification are installed into an
//! ordered matcher with first-match-wins semantics. Registration order is
//! reverse lexicographic by path, so more specific prefixes precede
//! shorter ones and wildcard variants sort after their concrete siblings;
//! a catch-all fallback is appended last and sweeps every unmatched path
//! to the always-proxy behavior.
//!
//! Patterns support `{name}` captures (one non-empty segment each) and a
//! trailing `*` wildcard, which registers the remaining pattern as a
//! literal prefix match.

use std::collections::HashMap;

use http::Method;
use tracing::debug;

use crate::config::EnvConfig;
use crate::openapi::{RouteConfig, RouteSpec, SUPPORTED_METHODS};

/// Paths served by the service itself, never wired through the policy
/// handler.
pub const RESERVED_PATHS: [&str; 3] = ["/-/ready", "/-/healthz", "/-/metrics"];

#[derive(Debug, Clone)]
enum PathPattern {
    Exact(Vec<Segment>),
    Prefix(String),
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct RouteEntry {
    raw_pattern: String,
    pattern: PathPattern,
    /// `None` matches every method.
    method: Option<Method>,
    config: Option<RouteConfig>,
}

/// A matched route: its policy configuration (if any) and the captured
/// path parameters.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub matched_path: &'a str,
    pub config: Option<&'a RouteConfig>,
    pub path_params: HashMap<String, String>,
}

/// The immutable route registry, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    entries: Vec<RouteEntry>,
}

impl RouteRegistry {
    /// Build the registry from the parsed specification.
    ///
    /// Registration rules:
    /// 1. paths sort reverse-lexicographically;
    /// 2. a `*` registers a literal prefix match;
    /// 3. `all` expands to every supported method;
    /// 4. in standalone mode every path gets the configured prefix;
    /// 5. reserved status paths are skipped;
    /// 6. the documentation endpoint is always-proxied unless it declares
    ///    its own request flow;
    /// 7. a catch-all fallback is appended last.
    pub fn build(spec: &RouteSpec, env: &EnvConfig) -> Self {
        let mut paths: Vec<&String> = spec.paths.keys().collect();
        paths.sort();
        paths.reverse();

        let oas_path = env.target_service_oas_path.as_deref();
        let mut documentation_in_spec = false;
        let mut entries = Vec::new();

        for path in paths {
            let registered = if env.standalone {
                format!("{}{}", env.path_prefix_standalone, path)
            } else {
                path.clone()
            };
            if RESERVED_PATHS.contains(&registered.as_str()) {
                continue;
            }

            let is_documentation = oas_path == Some(path.as_str());
            if is_documentation {
                documentation_in_spec = true;
            }

            for (method_key, verb) in &spec.paths[path] {
                let config = verb.policy.clone();

                // The documentation endpoint is proxied without evaluation
                // when it carries no explicit request-flow policy.
                let config = if is_documentation
                    && method_key == "get"
                    && config
                        .as_ref()
                        .and_then(|c| c.request_flow.as_ref())
                        .map(|flow| flow.policy_name.is_empty())
                        .unwrap_or(true)
                {
                    None
                } else {
                    config
                };

                if method_key == "all" {
                    entries.push(RouteEntry {
                        raw_pattern: registered.clone(),
                        pattern: parse_pattern(&registered),
                        method: None,
                        config,
                    });
                    continue;
                }

                let Some(method) = supported_method(method_key) else {
                    continue;
                };
                entries.push(RouteEntry {
                    raw_pattern: registered.clone(),
                    pattern: parse_pattern(&registered),
                    method: Some(method),
                    config,
                });
            }
        }

        // The documentation endpoint is reachable even when the spec does
        // not list it.
        if let Some(oas_path) = oas_path {
            if !documentation_in_spec {
                let registered = if env.standalone {
                    format!("{}{}", env.path_prefix_standalone, oas_path)
                } else {
                    oas_path.to_string()
                };
                entries.push(RouteEntry {
                    raw_pattern: registered.clone(),
                    pattern: parse_pattern(&registered),
                    method: None,
                    config: None,
                });
            }
        }

        // Catch-all fallback: everything not explicitly registered is
        // proxied without evaluation.
        let fallback = if env.standalone {
            format!("{}/", env.path_prefix_standalone.trim_end_matches('/'))
        } else {
            "/".to_string()
        };
        entries.push(RouteEntry {
            raw_pattern: format!("{fallback}*"),
            pattern: PathPattern::Prefix(fallback),
            method: None,
            config: None,
        });

        debug!(route_count = entries.len(), "Route registry built");
        Self { entries }
    }

    /// Resolve the first route matching `(method, path)`.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        for entry in &self.entries {
            if let Some(entry_method) = &entry.method {
                if entry_method != method {
                    continue;
                }
            }
            if let Some(path_params) = match_pattern(&entry.pattern, path) {
                return Some(RouteMatch {
                    matched_path: &entry.raw_pattern,
                    config: entry.config.as_ref(),
                    path_params,
                });
            }
        }
        None
    }

    /// True for the status/metrics paths served by the proxy itself.
    pub fn is_reserved(path: &str) -> bool {
        RESERVED_PATHS.contains(&path)
    }
}

fn supported_method(key: &str) -> Option<Method> {
    SUPPORTED_METHODS
        .iter()
        .find(|method| key.eq_ignore_ascii_case(method.as_str()))
        .cloned()
}

fn parse_pattern(pattern: &str) -> PathPattern {
    if let Some(prefix) = pattern.split('*').next().filter(|_| pattern.contains('*')) {
        return PathPattern::Prefix(prefix.to_string());
    }

    let segments = pattern
        .split('/')
        .map(|segment| {
            if segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2 {
                Segment::Param(segment[1..segment.len() - 1].to_string())
            } else {
                Segment::Literal(segment.to_string())
            }
        })
        .collect();
    PathPattern::Exact(segments)
}

fn match_pattern(pattern: &PathPattern, path: &str) -> Option<HashMap<String, String>> {
    match pattern {
        PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()).then(HashMap::new),
        PathPattern::Exact(segments) => {
            let request_segments: Vec<&str> = path.split('/').collect();
            if request_segments.len() != segments.len() {
                return None;
            }
            let mut params = HashMap::new();
            for (pattern_segment, request_segment) in segments.iter().zip(&request_segments) {
                match pattern_segment {
                    Segment::Literal(literal) => {
                        if literal != request_segment {
                            return None;
                        }
                    }
                    Segment::Param(name) => {
                        if request_segment.is_empty() {
                            return None;
                        }
                        params.insert(name.clone(), (*request_segment).to_string());
                    }
                }
            }
            Some(params)
        }
    }
}
