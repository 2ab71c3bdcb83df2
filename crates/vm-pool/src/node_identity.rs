//! Local node identity detection
//!
//! Allocations are tagged with the node that made them so recovery can
//! find this node's leftovers after a restart. The name is resolved once
//! and cached for the lifetime of the process.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::PoolError;

/// Environment variable injected by the deployment manifest.
pub const NODE_NAME_ENV: &str = "NODE_NAME";
/// Downward-API projection of `spec.nodeName`.
const NODE_NAME_FILE: &str = "/etc/podinfo/nodename";
const HOSTNAME_FILE: &str = "/etc/hostname";

/// Namespace file mounted into every pod with a service account.
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
/// Namespace assumed when detection fails.
pub const DEFAULT_POOL_NAMESPACE: &str = "confidential-containers-system";

static NODE_NAME: OnceLock<Option<String>> = OnceLock::new();

/// Resolves the local node name, trying the environment, the downward-API
/// file and the hostname file in that order. The first answer is cached.
pub fn current_node_name() -> Result<String, PoolError> {
    NODE_NAME
        .get_or_init(|| {
            resolve_node_name(
                NODE_NAME_ENV,
                Path::new(NODE_NAME_FILE),
                Path::new(HOSTNAME_FILE),
            )
        })
        .clone()
        .ok_or(PoolError::NodeIdentityUnknown)
}

fn resolve_node_name(env_var: &str, node_name_file: &Path, hostname_file: &Path) -> Option<String> {
    if let Ok(name) = env::var(env_var) {
        let name = name.trim();
        if !name.is_empty() {
            debug!("Node name detected from environment: {}", name);
            return Some(name.to_string());
        }
    }

    for (path, origin) in [
        (node_name_file, "downward API"),
        (hostname_file, "hostname file"),
    ] {
        if let Ok(contents) = fs::read_to_string(path) {
            if let Some(name) = first_non_empty_line(&contents) {
                debug!("Node name detected from {}: {}", origin, name);
                return Some(name);
            }
        }
    }

    None
}

fn first_non_empty_line(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Namespace this replica runs in, read from the service-account mount,
/// falling back to the well-known default outside a cluster.
pub fn current_namespace_or_default() -> String {
    match fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        Ok(contents) => first_non_empty_line(&contents)
            .unwrap_or_else(|| DEFAULT_POOL_NAMESPACE.to_string()),
        Err(_) => DEFAULT_POOL_NAMESPACE.to_string(),
    }
}
