//! Kubernetes client wrapper for the placement controller

use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Binding, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use rand::seq::SliceRandom;
use tracing::{info, instrument};

use crate::error::{AppError, Result};

/// Wrapper around kube::Client with helper methods for placement operations
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    namespace: String,
}

impl K8sClient {
    /// Create a new K8sClient from an explicit kubeconfig path, or fall back
    /// to the inferred (in-cluster or default kubeconfig) configuration.
    #[instrument(skip_all)]
    pub async fn new(kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await?,
        };
        let client = Client::try_from(config)?;

        info!("Connected to Kubernetes cluster");

        Ok(Self {
            client,
            namespace: "default".to_string(),
        })
    }

    /// Wrap an existing client, for wiring and tests.
    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Use a specific namespace for the managed applications.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Get the namespace this client operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the inner kube Client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get a typed API for pods in the application namespace
    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Get a typed API for pods in any namespace
    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    /// Get a typed API for pods in a specific namespace
    pub fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Get a typed API for nodes
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Get a typed API for deployments in the application namespace
    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// List all cluster nodes
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self.nodes().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// List every pod in the cluster
    pub async fn list_all_pods(&self) -> Result<Vec<Pod>> {
        let list = self.pods_all().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// List all pods bound to a node, across namespaces
    pub async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let list = self.pods_all().list(&params).await?;
        Ok(list.items)
    }

    /// List the application's pods by its `app` label
    pub async fn list_pods_by_app(&self, app: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("app={app}"));
        let list = self.pods().list(&params).await?;
        Ok(list.items)
    }

    /// Get a pod by name in the application namespace
    pub async fn get_pod(&self, name: &str) -> Result<Pod> {
        Ok(self.pods().get(name).await?)
    }

    /// Resolve the current IP of a pod in the application namespace
    pub async fn pod_ip(&self, name: &str) -> Result<String> {
        let pod = self.get_pod(name).await?;
        pod.status
            .and_then(|status| status.pod_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| AppError::PodNotRunning(name.to_string()))
    }

    /// Resolve the IP of a random running pod carrying `app=<app>`
    pub async fn random_pod_ip(&self, app: &str) -> Result<String> {
        let pods = self.list_pods_by_app(app).await?;
        let candidates: Vec<String> = pods
            .into_iter()
            .filter_map(|pod| pod.status.and_then(|status| status.pod_ip))
            .filter(|ip| !ip.is_empty())
            .collect();

        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| AppError::NoPodsAvailable(app.to_string()))
    }

    /// Bind a pod to a node via the binding subresource
    #[instrument(skip(self))]
    pub async fn bind_pod(&self, namespace: &str, pod_name: &str, node_name: &str) -> Result<()> {
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node_name.to_string()),
                ..Default::default()
            },
        };

        self.pods_in(namespace)
            .create_subresource::<Binding>(
                "binding",
                pod_name,
                &PostParams::default(),
                serde_json::to_vec(&binding)?,
            )
            .await?;

        info!(pod = pod_name, node = node_name, "Bound pod to node");
        Ok(())
    }

    /// Delete a pod. A pod that is already gone counts as deleted.
    #[instrument(skip(self))]
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pods_in(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(name, namespace, "Deleted pod");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get the deployment backing an app (named `<app>-deployment`)
    pub async fn get_app_deployment(&self, app: &str) -> Result<Deployment> {
        Ok(self.deployments().get(&deployment_name(app)).await?)
    }

    /// Current replica count of the app's deployment
    pub async fn deployment_replicas(&self, app: &str) -> Result<i32> {
        let deployment = self.get_app_deployment(app).await?;
        Ok(deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(0))
    }

    /// Adjust the app's deployment replica count by `delta`
    #[instrument(skip(self))]
    pub async fn adjust_replicas(&self, app: &str, delta: i32) -> Result<()> {
        let deployments = self.deployments();
        let name = deployment_name(app);
        let mut deployment = deployments.get(&name).await?;
        if let Some(spec) = deployment.spec.as_mut() {
            let replicas = spec.replicas.unwrap_or(0) + delta;
            spec.replicas = Some(replicas.max(0));
        }
        deployments
            .replace(&name, &PostParams::default(), &deployment)
            .await?;
        info!(app, delta, "Adjusted deployment replicas");
        Ok(())
    }

    /// Pause or resume the app's deployment rollout
    #[instrument(skip(self))]
    pub async fn set_deployment_paused(&self, app: &str, paused: bool) -> Result<()> {
        let deployments = self.deployments();
        let name = deployment_name(app);
        let mut deployment = deployments.get(&name).await?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.paused = Some(paused);
        }
        deployments
            .replace(&name, &PostParams::default(), &deployment)
            .await?;
        Ok(())
    }
}

fn deployment_name(app: &str) -> String {
    format!("{app}-deployment")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_name() {
        assert_eq!(deployment_name("shop"), "shop-deployment");
    }
}
