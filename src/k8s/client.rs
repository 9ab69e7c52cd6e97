use crate::k8s::types::{validate_pod, CaptureTarget};
use crate::{Result, SniffError};
use k8s_openapi::api::core::v1::Pod;
use kube::config::{Config, KubeConfigOptions};
use kube::{Api, Client};
use std::time::Duration;
use tracing::{debug, info};

pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Connects using the local kubeconfig, optionally pinned to `context`.
    ///
    /// Only connection establishment is bounded by `connect_timeout`; reads are
    /// left unbounded because a capture stream may idle for as long as the
    /// operator keeps it open.
    pub async fn connect(context: Option<&str>, connect_timeout: Duration) -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let mut config = match context {
            Some(ctx) => {
                let options = KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options).await.map_err(|e| {
                    SniffError::Kubernetes(format!("Failed to load context {}: {}", ctx, e))
                })?
            }
            None => Config::infer().await.map_err(|e| {
                SniffError::Kubernetes(format!("Failed to load kubeconfig: {}", e))
            })?,
        };

        config.connect_timeout = Some(connect_timeout);
        config.read_timeout = None;

        let client = Client::try_from(config).map_err(|e| {
            SniffError::Kubernetes(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod> {
        match self.pods(namespace).get(name).await {
            Ok(pod) => Ok(pod),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(SniffError::PodNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
            Err(e) => Err(SniffError::Kubernetes(format!(
                "Failed to get pod {}/{}: {}",
                namespace, name, e
            ))),
        }
    }

    /// Looks the pod up and validates it before any exec channel is opened.
    pub async fn resolve_target(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<CaptureTarget> {
        if namespace.is_empty() {
            return Err(SniffError::Config(
                "namespace value is empty should be custom or default".to_string(),
            ));
        }

        let found = self.get_pod(pod, namespace).await?;
        let container = validate_pod(&found, container)?;

        Ok(CaptureTarget::new(namespace, pod, container))
    }
}
