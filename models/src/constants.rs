/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! noderefresh_domain {
    () => {
        "noderefresh.io"
    };
    ($s:literal) => {
        concat!(noderefresh_domain!(), "/", $s)
    };
}

pub const API_VERSION: &str = noderefresh_domain!("v1");
pub const NODEREFRESH_DOMAIN_LIKE_NAME: &str = noderefresh_domain!();
pub const CONTROLLER: &str = "noderefresh-controller";

// We can't use these consts inside macros, but we do provide constants for use in generating
// kubernetes objects.
pub const K8S_REFRESH_KIND: &str = "NodeRefresh";
pub const K8S_REFRESH_PLURAL: &str = "noderefreshes";
pub const K8S_REFRESH_STATUS: &str = "noderefreshes/status";
pub const K8S_REFRESH_SHORTNAME: &str = "nr";

// Pods in these namespaces are owned by the cluster itself and are never evicted.
pub const RESERVED_NAMESPACES: &[&str] = &["kube-system", "kube-public"];

// monitoring constants
pub const MONITORING_INTERNAL_PORT: u16 = 8080; // The internal port on which metrics and health routes are hosted.
pub const HEALTH_CHECK_ROUTE: &str = "/ping"; // Route used for k8s liveness and readiness checks.
