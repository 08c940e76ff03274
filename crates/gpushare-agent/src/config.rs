//! Agent configuration from the environment.

use std::fs;

/// When set, allocation requests beyond GPU capacity are permitted with
/// a warning instead of failing with OUT_OF_MEMORY.
pub const ENV_ENABLE_SINGLE_OVERSUB: &str = "GPUSHARE_ENABLE_SINGLE_OVERSUB";

/// Overrides the amount of GPU memory hidden from the application, in
/// MiB.
pub const ENV_MEMINFO_RESERVE_MIB: &str = "GPUSHARE_MEMINFO_RESERVE_MIB";

/// GPU memory hidden from the application by default. CUDA stores
/// context data in physical, non-pageable memory, and CUDA libraries
/// claim more; hiding a fixed amount leaves headroom so a fully
/// "allocated" application does not thrash against its own context.
pub const DEFAULT_MEMINFO_RESERVE_MIB: u64 = 1536;

/// Present inside any Kubernetes pod; its presence tells us the pod
/// metadata is worth reading.
const ENV_KUBERNETES: &str = "KUBERNETES_SERVICE_HOST";

/// Kubernetes sets the pod name as the container hostname.
const ENV_HOSTNAME: &str = "HOSTNAME";

/// Mounted into every pod by default.
const POD_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    pub oversubscribe: bool,
    pub meminfo_reserve_bytes: u64,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let oversubscribe = std::env::var_os(ENV_ENABLE_SINGLE_OVERSUB).is_some();
        if oversubscribe {
            tracing::warn!("Enabling GPU memory oversubscription for this application");
        }

        let reserve_mib = std::env::var(ENV_MEMINFO_RESERVE_MIB)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MEMINFO_RESERVE_MIB);

        AgentConfig {
            oversubscribe,
            meminfo_reserve_bytes: reserve_mib * 1024 * 1024,
        }
    }
}

/// The pod name and namespace to register under, or `"none"` outside
/// Kubernetes (or when the metadata cannot be read).
pub fn pod_labels() -> (String, String) {
    if std::env::var_os(ENV_KUBERNETES).is_none() {
        return ("none".into(), "none".into());
    }

    let pod_name = match std::env::var(ENV_HOSTNAME) {
        Ok(name) if !name.is_empty() => name,
        _ => {
            tracing::debug!("Environment variable {ENV_HOSTNAME} is not set, defaulting to \"none\"");
            "none".into()
        }
    };

    let pod_namespace = match fs::read_to_string(POD_NAMESPACE_FILE) {
        Ok(contents) => {
            let ns = contents.lines().next().unwrap_or("").trim().to_string();
            if ns.is_empty() {
                "none".into()
            } else {
                ns
            }
        }
        Err(e) => {
            tracing::warn!("Couldn't read the Pod namespace from {POD_NAMESPACE_FILE}: {e}");
            "none".into()
        }
    };

    (pod_name, pod_namespace)
}
