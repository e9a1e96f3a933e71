//! Kubernetes client bindings

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{HostError, Result};
use async_trait::async_trait;
use nodeforge_workflow::Poller;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Summary of a pod's readiness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

/// Operations against the cluster API
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Create or update every object in a YAML manifest
    async fn apply_manifest(&self, cancel: &CancellationToken, manifest: &str) -> Result<()>;

    /// Delete every object in a YAML manifest; missing objects are ignored
    async fn delete_manifest(&self, cancel: &CancellationToken, manifest: &str) -> Result<()>;

    async fn resource_exists(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<bool>;

    /// Value of annotation `key` on an object; `None` when either the
    /// object or the annotation is missing
    async fn annotation(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        key: &str,
    ) -> Result<Option<String>>;

    /// Whether a CustomResourceDefinition is registered
    async fn crd_exists(&self, cancel: &CancellationToken, name: &str) -> Result<bool> {
        self.resource_exists(cancel, "customresourcedefinition", name, None)
            .await
    }

    async fn list_pods(&self, cancel: &CancellationToken, namespace: &str) -> Result<Vec<PodInfo>>;

    /// Wait until at least one pod in `namespace` starts with `prefix` and
    /// every such pod is Ready
    async fn wait_for_pods(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        prefix: &str,
        poller: &Poller,
    ) -> Result<()> {
        info!(namespace, prefix, "Waiting for pods to become ready");
        poller
            .wait(cancel, move || async move {
                match self.list_pods(cancel, namespace).await {
                    Ok(pods) => {
                        let matching: Vec<_> =
                            pods.iter().filter(|p| p.name.starts_with(prefix)).collect();
                        !matching.is_empty() && matching.iter().all(|p| p.ready)
                    }
                    Err(e) => {
                        debug!(error = %e, "Listing pods failed, retrying");
                        false
                    }
                }
            })
            .await?;
        Ok(())
    }
}

/// [`KubeClient`] backed by the `kubectl` CLI
pub struct KubectlClient {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: Option<PathBuf>,
}

impl KubectlClient {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            kubeconfig: None,
        }
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    fn kubectl(&self) -> CommandSpec {
        let spec = CommandSpec::new("kubectl");
        match &self.kubeconfig {
            Some(path) => spec.arg(format!("--kubeconfig={}", path.display())),
            None => spec,
        }
    }
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

fn parse_pods(command: &str, json: &str) -> Result<Vec<PodInfo>> {
    let list: PodList = serde_json::from_str(json).map_err(|e| HostError::Parse {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| PodInfo {
            ready: pod
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True"),
            name: pod.metadata.name,
            phase: pod.status.phase,
        })
        .collect())
}

#[async_trait]
impl KubeClient for KubectlClient {
    async fn apply_manifest(&self, cancel: &CancellationToken, manifest: &str) -> Result<()> {
        let spec = self.kubectl().args(["apply", "-f", "-"]).stdin(manifest);
        let output = self.runner.run_checked(cancel, &spec).await?;
        debug!(output = %output.stdout.trim(), "Applied manifest");
        Ok(())
    }

    async fn delete_manifest(&self, cancel: &CancellationToken, manifest: &str) -> Result<()> {
        let spec = self
            .kubectl()
            .args(["delete", "--ignore-not-found", "-f", "-"])
            .stdin(manifest);
        self.runner.run_checked(cancel, &spec).await?;
        Ok(())
    }

    async fn resource_exists(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<bool> {
        let mut spec = self
            .kubectl()
            .args(["get", kind, name, "--ignore-not-found", "-o", "name"]);
        if let Some(namespace) = namespace {
            spec = spec.args(["-n", namespace]);
        }
        let output = self.runner.run_checked(cancel, &spec).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    async fn annotation(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        key: &str,
    ) -> Result<Option<String>> {
        let jsonpath = format!(
            "jsonpath={{.metadata.annotations.{}}}",
            key.replace('.', "\\.")
        );
        let mut spec = self
            .kubectl()
            .args(["get", kind, name, "--ignore-not-found", "-o"])
            .arg(jsonpath);
        if let Some(namespace) = namespace {
            spec = spec.args(["-n", namespace]);
        }
        let output = self.runner.run_checked(cancel, &spec).await?;
        let value = output.stdout.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    async fn list_pods(&self, cancel: &CancellationToken, namespace: &str) -> Result<Vec<PodInfo>> {
        let spec = self
            .kubectl()
            .args(["get", "pods", "-n", namespace, "-o", "json"]);
        let output = self.runner.run_checked(cancel, &spec).await?;
        parse_pods(&spec.to_string(), &output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::ScriptedRunner;
    use std::time::Duration;

    const PODS: &str = r#"{
        "items": [
            {
                "metadata": {"name": "alloy-0"},
                "status": {
                    "phase": "Running",
                    "conditions": [{"type": "Ready", "status": "True"}]
                }
            },
            {
                "metadata": {"name": "node-exporter-x7k2p"},
                "status": {
                    "phase": "Pending",
                    "conditions": [{"type": "Ready", "status": "False"}]
                }
            },
            {"metadata": {"name": "just-created"}}
        ]
    }"#;

    #[test]
    fn test_parse_pods() {
        let pods = parse_pods("kubectl get pods", PODS).unwrap();
        assert_eq!(pods.len(), 3);
        assert!(pods[0].ready);
        assert_eq!(pods[1].phase, "Pending");
        assert!(!pods[1].ready);
        assert!(!pods[2].ready);

        assert!(matches!(
            parse_pods("kubectl get pods", "not json"),
            Err(HostError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_commands() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .respond(0, "namespace/monitoring configured\n")
                .respond(0, "customresourcedefinition.apiextensions.k8s.io/servicemonitors.monitoring.coreos.com\n")
                .respond(0, "")
                .respond(0, "3f1c9a\n"),
        );
        let client = KubectlClient::new(runner.clone()).with_kubeconfig("/etc/kubernetes/admin.conf");
        let cancel = CancellationToken::new();

        client
            .apply_manifest(&cancel, "kind: Namespace\n")
            .await
            .unwrap();
        assert!(client
            .crd_exists(&cancel, "servicemonitors.monitoring.coreos.com")
            .await
            .unwrap());
        assert!(!client
            .resource_exists(&cancel, "secret", "alloy-credentials", Some("monitoring"))
            .await
            .unwrap());

        assert_eq!(
            client
                .annotation(&cancel, "configmap", "alloy-config", Some("monitoring"), "nodeforge.io/checksum")
                .await
                .unwrap()
                .as_deref(),
            Some("3f1c9a")
        );

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].stdin.as_deref(), Some("kind: Namespace\n"));
        assert_eq!(
            seen[0].to_string(),
            "kubectl --kubeconfig=/etc/kubernetes/admin.conf apply -f -"
        );
        assert_eq!(
            seen[2].to_string(),
            "kubectl --kubeconfig=/etc/kubernetes/admin.conf get secret alloy-credentials --ignore-not-found -o name -n monitoring"
        );
        assert_eq!(
            seen[3].args[6],
            "jsonpath={.metadata.annotations.nodeforge\\.io/checksum}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_pods() {
        let ready = PODS.replace(r#""status": "False""#, r#""status": "True""#);
        let runner = Arc::new(
            ScriptedRunner::default()
                .respond(0, PODS)
                .respond(1, "")
                .respond(0, &ready),
        );
        let client = KubectlClient::new(runner.clone());
        let poller = Poller::new(Duration::from_secs(60), Duration::from_secs(1));

        client
            .wait_for_pods(&CancellationToken::new(), "monitoring", "node-exporter", &poller)
            .await
            .unwrap();
        assert_eq!(runner.commands().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_pods_timeout() {
        let runner = Arc::new(ScriptedRunner::default());
        let client = KubectlClient::new(runner);
        let poller = Poller::new(Duration::from_secs(5), Duration::from_secs(1));

        let err = client
            .wait_for_pods(&CancellationToken::new(), "monitoring", "alloy", &poller)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HostError::Poll(nodeforge_workflow::PollError::Timeout(_))
        ));
    }
}
