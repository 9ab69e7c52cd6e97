use crate::{Result, SniffError};
use k8s_openapi::api::core::v1::Pod;
use std::fmt;
use tracing::info;

/// The single container a capture session runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    namespace: String,
    pod: String,
    container: String,
}

impl CaptureTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub fn container(&self) -> &str {
        &self.container
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

const TERMINAL_PHASES: &[&str] = &["Succeeded", "Failed"];

/// Checks that `pod` can be sniffed and resolves the container name, defaulting
/// to the pod's first container.
pub fn validate_pod(pod: &Pod, requested_container: Option<&str>) -> Result<String> {
    let name = pod.metadata.name.clone().unwrap_or_default();

    if let Some(phase) = pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        if TERMINAL_PHASES.contains(&phase) {
            return Err(SniffError::PodTerminated {
                name,
                phase: phase.to_string(),
            });
        }
    }

    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);

    let first = match containers.first() {
        Some(c) => c,
        None => return Err(SniffError::NoContainers { name }),
    };

    match requested_container.filter(|c| !c.is_empty()) {
        Some(requested) => {
            if containers.iter().any(|c| c.name == requested) {
                Ok(requested.to_string())
            } else {
                Err(SniffError::ContainerNotFound {
                    container: requested.to_string(),
                    pod: name,
                })
            }
        }
        None => {
            info!("no container specified, taking first container we found in pod");
            info!("selected container: '{}'", first.name);
            Ok(first.name.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(phase: &str, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_defaults_to_first_container() {
        let pod = pod("Running", &["app", "sidecar"]);
        assert_eq!(validate_pod(&pod, None).unwrap(), "app");
        assert_eq!(validate_pod(&pod, Some("")).unwrap(), "app");
    }

    #[test]
    fn test_explicit_container() {
        let pod = pod("Running", &["app", "sidecar"]);
        assert_eq!(validate_pod(&pod, Some("sidecar")).unwrap(), "sidecar");
    }

    #[test]
    fn test_missing_container_rejected() {
        let pod = pod("Running", &["app"]);
        let err = validate_pod(&pod, Some("proxy")).unwrap_err();
        assert!(matches!(
            err,
            SniffError::ContainerNotFound { ref container, ref pod } if container == "proxy" && pod == "web-1"
        ));
    }

    #[test]
    fn test_terminal_phases_rejected() {
        for phase in ["Succeeded", "Failed"] {
            let err = validate_pod(&pod(phase, &["app"]), None).unwrap_err();
            assert!(matches!(err, SniffError::PodTerminated { .. }));
            assert!(err.to_string().contains(phase));
        }
    }

    #[test]
    fn test_pending_pod_accepted() {
        assert!(validate_pod(&pod("Pending", &["app"]), None).is_ok());
    }

    #[test]
    fn test_pod_without_containers_rejected() {
        let err = validate_pod(&pod("Running", &[]), None).unwrap_err();
        assert!(matches!(err, SniffError::NoContainers { .. }));
    }

    #[test]
    fn test_target_display() {
        let target = CaptureTarget::new("default", "web-1", "app");
        assert_eq!(target.to_string(), "default/web-1/app");
    }
}
