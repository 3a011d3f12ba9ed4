//! Partial evaluation: residual query construction.
//!
//! Routes with `generateQuery` run their policy in partial mode: terms that
//! depend only on `input` are substituted and evaluated immediately, while
//! comparisons against the unknown `data.resources` document survive as a
//! residual query the target service applies as a data-store filter.
//!
//! The supported rule shape is the conjunction-of-comparisons subset data
//! filters are written in:
//!
//! ```text
//! filter_projects {
//!     resource := data.resources[_]
//!     resource.tenantId == input.user.properties.tenantId
//!     resource.visibility != "private"
//! }
//! ```
//!
//! Multiple bodies of the same rule are OR-ed. A body whose known
//! conditions fail is dropped; a body that survives with no unknown
//! conditions makes the residual unconditionally true. A residual with no
//! surviving body is an unconditional deny.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AuthgateError;

/// Root of the unknown document partial evaluation ranges over.
const UNKNOWN_ROOT: &str = "data.resources[_]";

/// Comparison operator of a residual condition. The unknown side is always
/// normalized to the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    /// Mirror the operator so the unknown term can move to the left side.
    fn flipped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Lte => Self::Gte,
            Self::Gt => Self::Lt,
            Self::Gte => Self::Lte,
        }
    }
}

/// One residual condition: `<unknown>.field <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

/// The residual expression tree after known inputs are substituted:
/// a disjunction of conjunctions over the unknown document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualQuery {
    pub clauses: Vec<Vec<FilterCondition>>,
}

impl ResidualQuery {
    /// True when no body survived: the policy can never be satisfied for
    /// this input, regardless of data-store contents.
    pub fn is_deny(&self) -> bool {
        self.clauses.is_empty()
    }

    /// True when some body is fully satisfied by the input alone.
    pub fn is_unconditional(&self) -> bool {
        self.clauses.iter().any(|clause| clause.is_empty())
    }

    /// Serialized form carried to the target service.
    pub fn to_header_value(&self) -> String {
        serde_json::to_string(&self.clauses).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Run partial evaluation of `rule_name` over `module` with the given
/// known input document.
///
/// # Errors
///
/// Returns `AuthgateError::PolicyRuntime` when the rule does not exist or
/// uses constructs outside the supported filter subset.
pub fn evaluate_partial(
    module: &str,
    rule_name: &str,
    input: &serde_json::Value,
) -> Result<ResidualQuery, AuthgateError> {
    let bodies = extract_rule_bodies(module, rule_name);
    if bodies.is_empty() {
        return Err(runtime_error(
            rule_name,
            "rule not found in policy module".to_string(),
        ));
    }

    let mut clauses = Vec::new();
    for body in &bodies {
        if let Some(conditions) = evaluate_body(rule_name, body, input)? {
            clauses.push(conditions);
        }
    }

    Ok(ResidualQuery { clauses })
}

fn runtime_error(rule_name: &str, details: String) -> AuthgateError {
    AuthgateError::PolicyRuntime {
        policy: rule_name.to_string(),
        details,
    }
}

/// Extract every body of `rule_name` from the module source. Brace
/// matching skips string literals and `#` comments.
fn extract_rule_bodies(module: &str, rule_name: &str) -> Vec<String> {
    let pattern = format!(
        r"(?m)^[ \t]*{}\s*(?:=\s*true\s*)?(?:if\s*)?\{{",
        regex::escape(rule_name)
    );
    let Ok(re) = regex::Regex::new(&pattern) else {
        return Vec::new();
    };

    let mut bodies = Vec::new();
    for found in re.find_iter(module) {
        // The match ends at the opening brace.
        let open = found.end() - 1;
        if let Some(close) = matching_brace(module, open) {
            bodies.push(module[open + 1..close].to_string());
        }
    }
    bodies
}

fn matching_brace(source: &str, open: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;

    for (offset, &b) in bytes.iter().enumerate().skip(open) {
        if in_comment {
            if b == b'\n' {
                in_comment = false;
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'#' => in_comment = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// A term of a filter expression, after substitution of known inputs.
enum Term {
    /// Fully known value.
    Known(serde_json::Value),
    /// A reference into `input` that does not exist: Rego semantics make
    /// the whole body undefined.
    Undefined,
    /// A field path on the unknown document.
    Unknown(String),
}

/// Evaluate one rule body. Returns the surviving residual conditions, or
/// `None` when a known condition fails (the body contributes nothing).
fn evaluate_body(
    rule_name: &str,
    body: &str,
    input: &serde_json::Value,
) -> Result<Option<Vec<FilterCondition>>, AuthgateError> {
    let mut aliases: HashMap<String, ()> = HashMap::new();
    let mut conditions = Vec::new();

    for raw in body.lines().flat_map(|line| line.split(';')) {
        let statement = strip_comment(raw).trim();
        if statement.is_empty() {
            continue;
        }

        if let Some(alias) = parse_binding(statement) {
            aliases.insert(alias, ());
            continue;
        }

        match split_comparison(statement) {
            Some((lhs, op, rhs)) => {
                let lhs = resolve_term(rule_name, lhs, input, &aliases)?;
                let rhs = resolve_term(rule_name, rhs, input, &aliases)?;
                match (lhs, rhs) {
                    (Term::Undefined, _) | (_, Term::Undefined) => return Ok(None),
                    (Term::Known(a), Term::Known(b)) => {
                        if !compare_known(rule_name, op, &a, &b)? {
                            return Ok(None);
                        }
                    }
                    (Term::Unknown(field), Term::Known(value)) => {
                        conditions.push(FilterCondition { field, op, value });
                    }
                    (Term::Known(value), Term::Unknown(field)) => {
                        conditions.push(FilterCondition {
                            field,
                            op: op.flipped(),
                            value,
                        });
                    }
                    (Term::Unknown(_), Term::Unknown(_)) => {
                        return Err(runtime_error(
                            rule_name,
                            format!("unsupported comparison between two unknowns: '{statement}'"),
                        ));
                    }
                }
            }
            None => {
                // Bare statement: truthiness over a known term.
                match resolve_term(rule_name, statement, input, &aliases)? {
                    Term::Known(value) => {
                        if !is_truthy(&value) {
                            return Ok(None);
                        }
                    }
                    Term::Undefined => return Ok(None),
                    Term::Unknown(_) => {
                        return Err(runtime_error(
                            rule_name,
                            format!("unsupported bare unknown statement: '{statement}'"),
                        ));
                    }
                }
            }
        }
    }

    Ok(Some(conditions))
}

fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'#' => return &line[..offset],
            _ => {}
        }
    }
    line
}

/// `alias := data.resources[_]`
fn parse_binding(statement: &str) -> Option<String> {
    let (lhs, rhs) = statement.split_once(":=")?;
    let alias = lhs.trim();
    let source = rhs.trim();
    if source != UNKNOWN_ROOT {
        return None;
    }
    let valid = !alias.is_empty()
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| alias.to_string())
}

fn split_comparison(statement: &str) -> Option<(&str, FilterOp, &str)> {
    let bytes = statement.as_bytes();
    let mut in_string = false;
    let mut escaped = false;

    for offset in 0..bytes.len() {
        let b = bytes[offset];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
            continue;
        }

        let rest = &statement[offset..];
        let (op, width) = if rest.starts_with("==") {
            (FilterOp::Eq, 2)
        } else if rest.starts_with("!=") {
            (FilterOp::Ne, 2)
        } else if rest.starts_with("<=") {
            (FilterOp::Lte, 2)
        } else if rest.starts_with(">=") {
            (FilterOp::Gte, 2)
        } else if rest.starts_with('<') {
            (FilterOp::Lt, 1)
        } else if rest.starts_with('>') {
            (FilterOp::Gt, 1)
        } else {
            continue;
        };

        let lhs = statement[..offset].trim();
        let rhs = statement[offset + width..].trim();
        if lhs.is_empty() || rhs.is_empty() {
            return None;
        }
        return Some((lhs, op, rhs));
    }
    None
}

fn resolve_term(
    rule_name: &str,
    term: &str,
    input: &serde_json::Value,
    aliases: &HashMap<String, ()>,
) -> Result<Term, AuthgateError> {
    // Literals: strings, numbers, booleans, null all parse as JSON.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(term) {
        return Ok(Term::Known(value));
    }

    if let Some(path) = term.strip_prefix("input.") {
        if path.contains('[') {
            return Err(runtime_error(
                rule_name,
                format!("unsupported indexed input reference: '{term}'"),
            ));
        }
        return Ok(match walk_input(input, path) {
            Some(value) => Term::Known(value.clone()),
            None => Term::Undefined,
        });
    }

    if let Some(field) = term.strip_prefix(&format!("{UNKNOWN_ROOT}.")) {
        return Ok(Term::Unknown(field.to_string()));
    }

    if let Some((alias, field)) = term.split_once('.') {
        if aliases.contains_key(alias) {
            return Ok(Term::Unknown(field.to_string()));
        }
    }

    Err(runtime_error(
        rule_name,
        format!("unsupported term in filter policy: '{term}'"),
    ))
}

fn walk_input<'a>(input: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = input;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn is_truthy(value: &serde_json::Value) -> bool {
    !matches!(value, serde_json::Value::Bool(false) | serde_json::Value::Null)
}

fn compare_known(
    rule_name: &str,
    op: FilterOp,
    a: &serde_json::Value,
    b: &serde_json::Value,
) -> Result<bool, AuthgateError> {
    use serde_json::Value;

    match op {
        FilterOp::Eq => Ok(a == b),
        FilterOp::Ne => Ok(a != b),
        _ => {
            let ordering = match (a, b) {
                (Value::Number(x), Value::Number(y)) => {
                    let (x, y) = (x.as_f64(), y.as_f64());
                    match (x, y) {
                        (Some(x), Some(y)) => x.partial_cmp(&y),
                        _ => None,
                    }
                }
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(runtime_error(
                    rule_name,
                    "unsupported ordering comparison between mismatched types".to_string(),
                ));
            };
            Ok(match op {
                FilterOp::Lt => ordering.is_lt(),
                FilterOp::Lte => ordering.is_le(),
                FilterOp::Gt => ordering.is_gt(),
                FilterOp::Gte => ordering.is_ge(),
                FilterOp::Eq | FilterOp::Ne => unreachable!(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FILTER_MODULE: &str = r#"package policies

filter_projects {
    resource := data.resources[_]
    resource.tenantId == input.user.properties.tenantId
}
"#;

    #[test]
    fn test_residual_from_known_input() {
        let input = json!({"user": {"properties": {"tenantId": "tenant-a"}}});
        let residual = evaluate_partial(FILTER_MODULE, "filter_projects", &input).unwrap();

        assert_eq!(
            residual.clauses,
            vec![vec![FilterCondition {
                field: "tenantId".to_string(),
                op: FilterOp::Eq,
                value: json!("tenant-a"),
            }]]
        );
        assert!(!residual.is_deny());
        assert!(!residual.is_unconditional());
    }

    #[test]
    fn test_missing_input_reference_denies() {
        let input = json!({"user": {"properties": {}}});
        let residual = evaluate_partial(FILTER_MODULE, "filter_projects", &input).unwrap();
        assert!(residual.is_deny());
    }

    #[test]
    fn test_known_condition_failure_drops_body() {
        let module = r#"package policies
filter {
    input.clientType == "backoffice"
    resource := data.resources[_]
    resource.ownerId == input.user.properties.id
}
"#;
        let denied = json!({"clientType": "frontend", "user": {"properties": {"id": "u1"}}});
        let residual = evaluate_partial(module, "filter", &denied).unwrap();
        assert!(residual.is_deny());

        let allowed = json!({"clientType": "backoffice", "user": {"properties": {"id": "u1"}}});
        let residual = evaluate_partial(module, "filter", &allowed).unwrap();
        assert_eq!(residual.clauses.len(), 1);
        assert_eq!(residual.clauses[0][0].field, "ownerId");
        assert_eq!(residual.clauses[0][0].value, json!("u1"));
    }

    #[test]
    fn test_multiple_bodies_become_or_clauses() {
        let module = r#"package policies
filter {
    resource := data.resources[_]
    resource.ownerId == input.user.properties.id
}
filter {
    resource := data.resources[_]
    resource.public == true
}
"#;
        let input = json!({"user": {"properties": {"id": "u1"}}});
        let residual = evaluate_partial(module, "filter", &input).unwrap();
        assert_eq!(residual.clauses.len(), 2);
        assert_eq!(residual.clauses[1][0].field, "public");
        assert_eq!(residual.clauses[1][0].value, json!(true));
    }

    #[test]
    fn test_fully_known_body_is_unconditional() {
        let module = r#"package policies
filter { input.user.properties.admin == true }
"#;
        let input = json!({"user": {"properties": {"admin": true}}});
        let residual = evaluate_partial(module, "filter", &input).unwrap();
        assert!(residual.is_unconditional());
        assert_eq!(residual.to_header_value(), "[[]]");
    }

    #[test]
    fn test_known_on_left_flips_operator() {
        let module = r#"package policies
filter {
    resource := data.resources[_]
    input.user.properties.clearance >= resource.requiredClearance
}
"#;
        let input = json!({"user": {"properties": {"clearance": 3}}});
        let residual = evaluate_partial(module, "filter", &input).unwrap();
        assert_eq!(
            residual.clauses[0][0],
            FilterCondition {
                field: "requiredClearance".to_string(),
                op: FilterOp::Lte,
                value: json!(3),
            }
        );
    }

    #[test]
    fn test_direct_unknown_reference_without_binding() {
        let module = r#"package policies
filter { data.resources[_].tenantId == input.tenant }
"#;
        let input = json!({"tenant": "t-9"});
        let residual = evaluate_partial(module, "filter", &input).unwrap();
        assert_eq!(residual.clauses[0][0].field, "tenantId");
    }

    #[test]
    fn test_unknown_rule_is_runtime_error() {
        let result = evaluate_partial(FILTER_MODULE, "missing_rule", &json!({}));
        assert!(matches!(
            result,
            Err(AuthgateError::PolicyRuntime { .. })
        ));
    }

    #[test]
    fn test_unsupported_construct_is_runtime_error() {
        let module = r#"package policies
filter {
    resource := data.resources[_]
    other := data.resources[_]
    resource.a == other.b
}
"#;
        let result = evaluate_partial(module, "filter", &json!({}));
        assert!(matches!(
            result,
            Err(AuthgateError::PolicyRuntime { .. })
        ));
    }

    #[test]
    fn test_header_value_round_trip() {
        let residual = ResidualQuery {
            clauses: vec![vec![FilterCondition {
                field: "tenantId".to_string(),
                op: FilterOp::Eq,
                value: json!("abc"),
            }]],
        };
        let header = residual.to_header_value();
        let parsed: Vec<Vec<FilterCondition>> = serde_json::from_str(&header).unwrap();
        assert_eq!(parsed, residual.clauses);
        assert!(header.contains(r#""op":"eq""#));
    }
}
