pub mod client;
pub mod watcher;

pub use client::K8sClient;

/// Namespace prefixes the control loops never touch.
pub const EXCLUDED_NAMESPACE_PREFIXES: [&str; 5] = ["kube", "routing", "liqo", "metallb", "local"];

/// True for system namespaces the descheduler must ignore.
pub fn is_excluded_namespace(namespace: &str) -> bool {
    EXCLUDED_NAMESPACE_PREFIXES
        .iter()
        .any(|prefix| namespace.starts_with(prefix))
}
