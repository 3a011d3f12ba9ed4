//! MongoDB-backed RBAC store client.
//!
//! The store is shared across requests; the driver pools connections
//! internally. The database name comes from the connection-string path.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Client, Collection, Database};
use tracing::{debug, info};

use super::{Binding, RbacDataSource, Role};
use crate::error::AuthgateError;

/// Client for the `bindings` and `roles` collections.
#[derive(Clone)]
pub struct RbacStore {
    database: Database,
    bindings: Collection<Binding>,
    roles: Collection<Role>,
}

impl RbacStore {
    /// Connect to the store.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::RbacStore` if the URL is malformed or does
    /// not name a database.
    pub async fn connect(
        url: &str,
        roles_collection: &str,
        bindings_collection: &str,
    ) -> Result<Self, AuthgateError> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(|e| AuthgateError::RbacStore(e.to_string()))?;
        let database = client.default_database().ok_or_else(|| {
            AuthgateError::RbacStore(
                "MongoDB connection string must include a database name".to_string(),
            )
        })?;

        let bindings = database.collection::<Binding>(bindings_collection);
        let roles = database.collection::<Role>(roles_collection);

        info!(
            database = %database.name(),
            roles_collection = %roles_collection,
            bindings_collection = %bindings_collection,
            "RBAC store configured"
        );

        Ok(Self {
            database,
            bindings,
            roles,
        })
    }

    /// Verify connectivity; used by the readiness probe and at startup.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::RbacStore` when the server is unreachable.
    pub async fn ping(&self) -> Result<(), AuthgateError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| AuthgateError::RbacStore(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RbacDataSource for RbacStore {
    async fn retrieve_user_bindings(
        &self,
        user_id: &str,
        user_groups: &[String],
    ) -> Result<Vec<Binding>, AuthgateError> {
        let filter = doc! {
            "$or": [
                { "subjects.userIds": user_id },
                { "subjects.groups": { "$in": user_groups.to_vec() } },
            ]
        };

        let mut cursor = self
            .bindings
            .find(filter)
            .await
            .map_err(|e| AuthgateError::RbacStore(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        let mut bindings = Vec::new();
        while let Some(binding) = cursor
            .try_next()
            .await
            .map_err(|e| AuthgateError::RbacStore(e.to_string()))?
        {
            if seen.insert(binding.binding_id.clone()) {
                bindings.push(binding);
            }
        }

        debug!(
            user_id = %user_id,
            binding_count = bindings.len(),
            "Retrieved user bindings"
        );
        Ok(bindings)
    }

    async fn retrieve_user_roles_by_role_ids(
        &self,
        role_ids: &[String],
    ) -> Result<Vec<Role>, AuthgateError> {
        let filter = doc! { "roleId": { "$in": role_ids.to_vec() } };

        let mut cursor = self
            .roles
            .find(filter)
            .await
            .map_err(|e| AuthgateError::RbacStore(e.to_string()))?;

        let mut roles = Vec::new();
        while let Some(role) = cursor
            .try_next()
            .await
            .map_err(|e| AuthgateError::RbacStore(e.to_string()))?
        {
            roles.push(role);
        }
        Ok(roles)
    }
}
