//! Policy module loading.
//!
//! All `.rego` files of a directory are concatenated into a single logical
//! module. Concatenation order is lexicographic by filename so the compiled
//! module is reproducible across runs.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::AuthgateError;

/// A named policy module: the concatenation of every `.rego` source file
/// found in the configured directory.
#[derive(Debug, Clone)]
pub struct PolicyModule {
    pub name: String,
    pub content: String,
}

/// Load the policy module from `directory`.
///
/// # Errors
///
/// Returns `AuthgateError::ModuleLoad` if the directory is missing,
/// unreadable, or contains no `.rego` files.
pub fn load_policy_module(directory: &str) -> Result<PolicyModule, AuthgateError> {
    let dir = Path::new(directory);
    let entries = fs::read_dir(dir).map_err(|e| AuthgateError::ModuleLoad {
        path: directory.to_string(),
        reason: e.to_string(),
    })?;

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("rego"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(AuthgateError::ModuleLoad {
            path: directory.to_string(),
            reason: "no .rego files found".to_string(),
        });
    }

    let mut content = String::new();
    for path in &files {
        let source = fs::read_to_string(path).map_err(|e| AuthgateError::ModuleLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&source);
    }

    info!(
        directory = %directory,
        file_count = files.len(),
        "Loaded policy module"
    );

    Ok(PolicyModule {
        name: "policies.rego".to_string(),
        content,
    })
}
