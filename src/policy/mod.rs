//! Policy compilation and evaluation.
//!
//! Policies are Rego modules under the `policies` package, loaded from a
//! flat directory at startup and compiled once into an immutable
//! [`PolicyBundle`]. Per-route evaluators are prepared against the bundle
//! and shared across requests; each evaluation binds a transient engine to
//! a concrete input document.

pub mod engine;
pub mod loader;
pub mod partial;

pub use engine::{EvaluatorSet, PolicyBundle, PolicyEvaluator};
pub use loader::PolicyModule;
pub use partial::{FilterCondition, FilterOp, ResidualQuery};

/// Policy names may contain `.` in route configuration; rule names may not.
/// `foo.bar` targets the rule `foo_bar` inside `data.policies`.
pub fn sanitize_policy_name(name: &str) -> String {
    name.replace('.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_policy_name() {
        assert_eq!(sanitize_policy_name("allow"), "allow");
        assert_eq!(
            sanitize_policy_name("very.composed.policy"),
            "very_composed_policy"
        );
        assert!(!sanitize_policy_name("a.b.c").contains('.'));
    }
}
