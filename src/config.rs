//! Environment-variable configuration.
//!
//! The service is configured entirely through the environment. Required
//! variables abort startup when missing; everything else has a default.
//! RBAC is optional: it is enabled only when the MongoDB URL and both
//! collection names are present.

use crate::error::AuthgateError;

/// Parsed environment configuration, loaded once at startup and shared
/// read-only across all requests.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Logger verbosity (`LOG_LEVEL`, default `info`).
    pub log_level: String,
    /// Inbound listen port (`HTTP_PORT`, default `8080`).
    pub http_port: u16,
    /// Downstream target `host:port` or full URL (`TARGET_SERVICE_HOST`, required).
    pub target_service_host: String,
    /// Path at which the target exposes its OpenAPI document
    /// (`TARGET_SERVICE_OAS_PATH`).
    pub target_service_oas_path: Option<String>,
    /// Local OpenAPI file, alternative to the target fetch
    /// (`API_PERMISSIONS_FILE_PATH`).
    pub api_permissions_file_path: Option<String>,
    /// Directory holding the `.rego` policy sources
    /// (`OPA_MODULES_DIRECTORY`, required).
    pub opa_modules_directory: String,
    /// Header carrying the caller's properties JSON
    /// (`USER_PROPERTIES_HEADER_KEY`, default `miauserproperties`).
    pub user_properties_header: String,
    /// Header carrying the caller's comma-separated groups
    /// (`USER_GROUPS_HEADER_KEY`, default `miausergroups`).
    pub user_groups_header: String,
    /// Header carrying the caller's user id
    /// (`USER_ID_HEADER_KEY`, default `miauserid`).
    pub user_id_header: String,
    /// Header carrying the client-type label
    /// (`CLIENT_TYPE_HEADER_KEY`, default `Client-Type`).
    pub client_type_header: String,
    /// RBAC store connection string (`MONGODB_URL`).
    pub mongodb_url: Option<String>,
    /// RBAC roles collection (`ROLES_COLLECTION_NAME`).
    pub roles_collection_name: Option<String>,
    /// RBAC bindings collection (`BINDINGS_COLLECTION_NAME`).
    pub bindings_collection_name: Option<String>,
    /// Graceful-shutdown drain budget in seconds
    /// (`DELAY_SHUTDOWN_SECONDS`, default `10`).
    pub delay_shutdown_seconds: u64,
    /// Standalone deployment flag (`STANDALONE`).
    pub standalone: bool,
    /// Path prefix applied to every route in standalone mode
    /// (`PATH_PREFIX_STANDALONE`, default `/eval`).
    pub path_prefix_standalone: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            http_port: 8080,
            target_service_host: String::new(),
            target_service_oas_path: None,
            api_permissions_file_path: None,
            opa_modules_directory: String::new(),
            user_properties_header: "miauserproperties".to_string(),
            user_groups_header: "miausergroups".to_string(),
            user_id_header: "miauserid".to_string(),
            client_type_header: "Client-Type".to_string(),
            mongodb_url: None,
            roles_collection_name: None,
            bindings_collection_name: None,
            delay_shutdown_seconds: 10,
            standalone: false,
            path_prefix_standalone: "/eval".to_string(),
        }
    }
}

impl EnvConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::Env` if:
    /// - `TARGET_SERVICE_HOST` or `OPA_MODULES_DIRECTORY` is missing
    /// - neither `API_PERMISSIONS_FILE_PATH` nor `TARGET_SERVICE_OAS_PATH` is set
    /// - a numeric variable fails to parse
    pub fn from_env() -> Result<Self, AuthgateError> {
        let defaults = Self::default();

        let target_service_host = required_var("TARGET_SERVICE_HOST")?;
        let opa_modules_directory = required_var("OPA_MODULES_DIRECTORY")?;

        let config = Self {
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
            http_port: parse_var("HTTP_PORT", defaults.http_port)?,
            target_service_host,
            target_service_oas_path: optional_var("TARGET_SERVICE_OAS_PATH"),
            api_permissions_file_path: optional_var("API_PERMISSIONS_FILE_PATH"),
            opa_modules_directory,
            user_properties_header: optional_var("USER_PROPERTIES_HEADER_KEY")
                .unwrap_or(defaults.user_properties_header),
            user_groups_header: optional_var("USER_GROUPS_HEADER_KEY")
                .unwrap_or(defaults.user_groups_header),
            user_id_header: optional_var("USER_ID_HEADER_KEY").unwrap_or(defaults.user_id_header),
            client_type_header: optional_var("CLIENT_TYPE_HEADER_KEY")
                .unwrap_or(defaults.client_type_header),
            mongodb_url: optional_var("MONGODB_URL"),
            roles_collection_name: optional_var("ROLES_COLLECTION_NAME"),
            bindings_collection_name: optional_var("BINDINGS_COLLECTION_NAME"),
            delay_shutdown_seconds: parse_var(
                "DELAY_SHUTDOWN_SECONDS",
                defaults.delay_shutdown_seconds,
            )?,
            standalone: optional_var("STANDALONE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            path_prefix_standalone: optional_var("PATH_PREFIX_STANDALONE")
                .unwrap_or(defaults.path_prefix_standalone),
        };

        if config.api_permissions_file_path.is_none() && config.target_service_oas_path.is_none() {
            return Err(AuthgateError::Env(
                "one of API_PERMISSIONS_FILE_PATH or TARGET_SERVICE_OAS_PATH must be set"
                    .to_string(),
            ));
        }

        Ok(config)
    }

    /// RBAC store configuration, present only when fully configured.
    ///
    /// Returns `(mongodb_url, roles_collection, bindings_collection)`.
    pub fn rbac_config(&self) -> Option<(&str, &str, &str)> {
        match (
            &self.mongodb_url,
            &self.roles_collection_name,
            &self.bindings_collection_name,
        ) {
            (Some(url), Some(roles), Some(bindings)) => {
                Some((url.as_str(), roles.as_str(), bindings.as_str()))
            }
            _ => None,
        }
    }
}

fn required_var(key: &str) -> Result<String, AuthgateError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthgateError::Env(format!("required environment variable {key} is not set")))
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, AuthgateError> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| AuthgateError::Env(format!("{key} must be a valid number, got '{value}'"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "LOG_LEVEL",
            "HTTP_PORT",
            "TARGET_SERVICE_HOST",
            "TARGET_SERVICE_OAS_PATH",
            "API_PERMISSIONS_FILE_PATH",
            "OPA_MODULES_DIRECTORY",
            "USER_PROPERTIES_HEADER_KEY",
            "USER_GROUPS_HEADER_KEY",
            "USER_ID_HEADER_KEY",
            "CLIENT_TYPE_HEADER_KEY",
            "MONGODB_URL",
            "ROLES_COLLECTION_NAME",
            "BINDINGS_COLLECTION_NAME",
            "DELAY_SHUTDOWN_SECONDS",
            "STANDALONE",
            "PATH_PREFIX_STANDALONE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_missing_target_host_fails() {
        clear_env();
        std::env::set_var("OPA_MODULES_DIRECTORY", "/policies");

        let result = EnvConfig::from_env();
        assert!(matches!(result, Err(AuthgateError::Env(_))));
    }

    #[test]
    #[serial]
    fn test_missing_oas_source_fails() {
        clear_env();
        std::env::set_var("TARGET_SERVICE_HOST", "localhost:3001");
        std::env::set_var("OPA_MODULES_DIRECTORY", "/policies");

        let result = EnvConfig::from_env();
        assert!(matches!(result, Err(AuthgateError::Env(_))));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("TARGET_SERVICE_HOST", "localhost:3001");
        std::env::set_var("OPA_MODULES_DIRECTORY", "/policies");
        std::env::set_var("TARGET_SERVICE_OAS_PATH", "/documentation/json");

        let config = EnvConfig::from_env().expect("config should load");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.user_properties_header, "miauserproperties");
        assert_eq!(config.user_groups_header, "miausergroups");
        assert_eq!(config.user_id_header, "miauserid");
        assert_eq!(config.client_type_header, "Client-Type");
        assert_eq!(config.delay_shutdown_seconds, 10);
        assert!(!config.standalone);
        assert!(config.rbac_config().is_none());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_port_fails() {
        clear_env();
        std::env::set_var("TARGET_SERVICE_HOST", "localhost:3001");
        std::env::set_var("OPA_MODULES_DIRECTORY", "/policies");
        std::env::set_var("TARGET_SERVICE_OAS_PATH", "/documentation/json");
        std::env::set_var("HTTP_PORT", "not-a-port");

        let result = EnvConfig::from_env();
        assert!(matches!(result, Err(AuthgateError::Env(_))));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_rbac_config_requires_all_three() {
        clear_env();
        std::env::set_var("TARGET_SERVICE_HOST", "localhost:3001");
        std::env::set_var("OPA_MODULES_DIRECTORY", "/policies");
        std::env::set_var("TARGET_SERVICE_OAS_PATH", "/documentation/json");
        std::env::set_var("MONGODB_URL", "mongodb://localhost/rbac");
        std::env::set_var("ROLES_COLLECTION_NAME", "roles");

        let config = EnvConfig::from_env().expect("config should load");
        assert!(config.rbac_config().is_none(), "bindings collection missing");

        std::env::set_var("BINDINGS_COLLECTION_NAME", "bindings");
        let config = EnvConfig::from_env().expect("config should load");
        assert_eq!(
            config.rbac_config(),
            Some(("mongodb://localhost/rbac", "roles", "bindings"))
        );

        clear_env();
    }
}
