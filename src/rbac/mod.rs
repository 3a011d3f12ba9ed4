//! RBAC data model and resource-permission materialization.
//!
//! Bindings assign roles and/or direct permissions to subjects (user ids
//! or groups), optionally scoped to a resource. Roles are named permission
//! sets. Both are read per request from the document store; the
//! materialized resource-permissions map is computed on demand for routes
//! that opt into the optimization.

pub mod store;

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AuthgateError;

pub use store::RbacStore;

/// Subjects a binding applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subjects {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Resource scope of a binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_type: String,
    pub resource_id: String,
}

/// An assignment of roles and/or permissions to subjects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    #[serde(default)]
    pub binding_id: String,
    #[serde(default)]
    pub subjects: Subjects,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
}

/// A named set of permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[serde(default)]
    pub role_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Read access to the RBAC document store, kept behind a trait so the
/// handler can be exercised against a mock store in tests.
#[async_trait]
pub trait RbacDataSource: Send + Sync {
    /// All bindings whose subjects contain `user_id` or intersect
    /// `user_groups`, de-duplicated by binding id.
    async fn retrieve_user_bindings(
        &self,
        user_id: &str,
        user_groups: &[String],
    ) -> Result<Vec<Binding>, AuthgateError>;

    /// The roles whose id is in `role_ids`.
    async fn retrieve_user_roles_by_role_ids(
        &self,
        role_ids: &[String],
    ) -> Result<Vec<Role>, AuthgateError>;
}

/// Materialize the flat permission set implied by a user's bindings and
/// roles.
///
/// For every binding, each permission from its referenced roles and each
/// directly attached permission is inserted as `<permission>` for
/// resourceless bindings, or `<permission>:<resourceType>:<resourceId>`
/// when the binding is scoped. Duplicates collapse; the result is a set.
pub fn build_optimized_resource_permissions_map(
    bindings: &[Binding],
    roles: &[Role],
) -> BTreeSet<String> {
    let roles_map: HashMap<&str, &[String]> = roles
        .iter()
        .map(|role| (role.role_id.as_str(), role.permissions.as_slice()))
        .collect();

    let mut permissions = BTreeSet::new();
    for binding in bindings {
        let key = |permission: &str| match &binding.resource {
            Some(resource) => format!(
                "{permission}:{}:{}",
                resource.resource_type, resource.resource_id
            ),
            None => permission.to_string(),
        };

        for role_id in &binding.roles {
            if let Some(role_permissions) = roles_map.get(role_id.as_str()) {
                for permission in *role_permissions {
                    permissions.insert(key(permission));
                }
            }
        }
        for permission in &binding.permissions {
            permissions.insert(key(permission));
        }
    }
    permissions
}
